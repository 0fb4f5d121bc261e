use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::sleep;

/// What a finished wait should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceDecision {
    /// This wait was the last one issued inside the window.
    Execute,
    /// A newer wait superseded this one; do nothing.
    Skip,
}

/// Coalesces bursts of events into at most one execution per window.
/// Every call waits out the full window; only the call that is still the
/// newest for its key when the window elapses gets `Execute`.
#[derive(Debug, Default)]
pub struct Debouncer {
    runs: Mutex<HashMap<String, u64>>,
    counter: AtomicU64,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn debounce(&self, key: &str, window: Duration) -> DebounceDecision {
        let token = self.counter.fetch_add(1, Ordering::Relaxed);
        self.runs.lock().unwrap().insert(key.to_string(), token);

        sleep(window).await;

        let current = self.runs.lock().unwrap().get(key).copied();
        if current == Some(token) {
            DebounceDecision::Execute
        } else {
            DebounceDecision::Skip
        }
    }
}
