use std::collections::HashMap;
use std::time::Duration;

use watch_common::event::CandidateEvent;

/// Per-subject suppression window.
///
/// A subject is accepted when it was never accepted before, or when at least
/// `window` has passed since it last was. Payload content plays no part: a
/// changed event for the same subject inside the window is rejected, and an
/// identical one after the window is accepted again.
///
/// Entries are never evicted. The filter lives as long as its pipeline.
pub struct EmissionFilter {
    window_millis: u64,
    last_sent: HashMap<String, u64>,
}

impl EmissionFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window_millis: window.as_millis() as u64,
            last_sent: HashMap::new(),
        }
    }

    /// Decide whether `candidate` may be emitted at `now_millis`, recording
    /// the acceptance if so. Rejection leaves the filter untouched.
    pub fn accept(&mut self, candidate: &CandidateEvent, now_millis: u64) -> bool {
        if let Some(last_sent) = self.last_sent.get(candidate.subject_id()) {
            if now_millis.saturating_sub(*last_sent) < self.window_millis {
                return false;
            }
        }

        _ = self
            .last_sent
            .insert(candidate.subject_id().to_owned(), now_millis);
        true
    }

    pub fn last_sent_at(&self, subject_id: &str) -> Option<u64> {
        self.last_sent.get(subject_id).copied()
    }

    pub fn tracked_subjects(&self) -> usize {
        self.last_sent.len()
    }
}
