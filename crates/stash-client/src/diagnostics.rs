//! Duplicate-lookup tracking.
//!
//! Fetching the same key twice through one client usually means a caller
//! should be holding on to the first result. The tracker counts repeat
//! lookups and, the first time any key repeats, schedules a single report
//! through the deferred runner. Counting continues until the report runs;
//! the report then drains the counts and the tracker ignores every later
//! lookup. Results of `get` are never affected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::deferred::DeferredRunner;

#[derive(Debug, Default)]
struct DupeState {
    /// Key -> number of lookups after the first.
    repeats: HashMap<String, u64>,
    report_scheduled: bool,
    reported: bool,
}

/// Per-client counter of repeated key lookups.
#[derive(Debug)]
pub struct DupeTracker {
    enabled: bool,
    state: Arc<Mutex<DupeState>>,
}

impl DupeTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Arc::new(Mutex::new(DupeState::default())),
        }
    }

    /// Record a lookup of `key`.
    pub fn track(&self, key: &str, runner: &dyn DeferredRunner) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.reported {
            return;
        }
        match state.repeats.get_mut(key) {
            None => {
                state.repeats.insert(key.to_string(), 0);
                return;
            }
            Some(count) => *count += 1,
        }
        if state.report_scheduled {
            return;
        }
        state.report_scheduled = true;
        // The runner may execute the report inline.
        drop(state);

        let shared = Arc::clone(&self.state);
        runner.defer(Box::new(move || {
            report(&shared);
        }));
    }

    /// Number of repeat lookups of `key` so far. Zero once the report ran.
    pub fn repeats(&self, key: &str) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .repeats
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn report_scheduled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .report_scheduled
    }
}

/// Log every key fetched more than once and stop tracking. Returns the
/// keys reported.
fn report(state: &Mutex<DupeState>) -> Vec<String> {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    state.reported = true;
    let mut dupes: Vec<(String, u64)> = std::mem::take(&mut state.repeats)
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .collect();
    dupes.sort();
    for (key, repeats) in &dupes {
        warn!(key = %key, fetches = repeats + 1, "duplicate get()");
    }
    dupes.into_iter().map(|(key, _)| key).collect()
}
