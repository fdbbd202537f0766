use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};

const MAX_ENTRIES: usize = 1000;

/// Human-readable record of protocol events, shared by every connection
/// worker and readable from outside the protocol engine.
///
/// Oldest entries are dropped once `MAX_ENTRIES` is reached.
#[derive(Clone, Default)]
pub struct ActivityLog {
    entries: Arc<Mutex<VecDeque<String>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.push(message);
    }

    /// Same as [`record`](Self::record) but logged at warn level.
    pub fn record_failure(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.push(message);
    }

    pub fn entries(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// True if any entry contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|entry| entry.contains(needle))
    }

    fn push(&self, message: String) {
        let mut entries = self.lock();
        if entries.len() == MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(message);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
