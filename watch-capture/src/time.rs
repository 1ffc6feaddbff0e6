use tokio::time::Instant;

pub trait TimeSource {
    /// Milliseconds on a monotonic clock. Only differences are meaningful.
    fn now_millis(&self) -> u64;
}

/// Monotonic milliseconds since the pipeline started. Backed by the tokio
/// clock so a paused test runtime controls it.
#[derive(Clone)]
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
