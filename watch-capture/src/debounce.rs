use std::time::Duration;

use tokio::time::Instant;

/// Trailing-edge debounce: every trigger pushes the deadline to `delay` after
/// itself, and `elapsed` resolves once no trigger arrived for `delay`.
///
/// Meant to be polled from a `tokio::select!` loop alongside the trigger
/// source. Dropping an in-progress `elapsed` future keeps the deadline.
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn trigger(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Wait for the quiet period to end, then disarm. Never resolves while disarmed.
    pub async fn elapsed(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}
