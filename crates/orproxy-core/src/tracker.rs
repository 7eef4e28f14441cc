//! In-memory record of models that returned terminal errors. Permanent marks
//! last for the life of the process; temporary marks expire after a fixed
//! window.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::warn;

const TEMPORARY_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
struct TrackerState {
    permanent: HashMap<String, Instant>,
    temporary: HashMap<String, Instant>,
}

#[derive(Debug, Default)]
pub struct PermanentFailureTracker {
    state: RwLock<TrackerState>,
}

impl PermanentFailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_permanent(&self, model: &str) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.permanent.insert(model.to_string(), Instant::now());
        warn!(model, "model marked as permanently unavailable");
    }

    pub fn mark_temporary(&self, model: &str) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.temporary.insert(model.to_string(), Instant::now());
    }

    pub fn is_permanently_failed(&self, model: &str) -> bool {
        self.state
            .read()
            .map(|state| state.permanent.contains_key(model))
            .unwrap_or(false)
    }

    /// Permanent membership, or a temporary mark still inside its window.
    /// The routing sweep checks `is_permanently_failed` directly; this wider
    /// predicate stays for callers that also honor temporary marks.
    pub fn should_skip(&self, model: &str) -> bool {
        let Ok(state) = self.state.read() else {
            return false;
        };
        if state.permanent.contains_key(model) {
            return true;
        }
        state
            .temporary
            .get(model)
            .map(|stamp| stamp.elapsed() < TEMPORARY_WINDOW)
            .unwrap_or(false)
    }

    pub fn clear_temporary(&self, model: &str) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.temporary.remove(model);
    }

    /// (permanent count, temporary marks still inside their window)
    pub fn stats(&self) -> (usize, usize) {
        let Ok(state) = self.state.read() else {
            return (0, 0);
        };
        let active_temporary = state
            .temporary
            .values()
            .filter(|stamp| stamp.elapsed() < TEMPORARY_WINDOW)
            .count();
        (state.permanent.len(), active_temporary)
    }
}
