use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::engine::EngineThread;
use crate::lock_or_recover;

/// Engine thread handles kept resident for the lifetime of the process, so
/// follow-up turns reuse the same conversation without a resume round-trip.
#[derive(Default)]
pub struct RuntimeThreads {
    threads: Mutex<HashMap<String, Arc<dyn EngineThread>>>,
}

impl RuntimeThreads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread_id: &str) -> Option<Arc<dyn EngineThread>> {
        lock_or_recover(&self.threads).get(thread_id).cloned()
    }

    pub fn insert(&self, thread_id: &str, thread: Arc<dyn EngineThread>) {
        lock_or_recover(&self.threads).insert(thread_id.to_string(), thread);
    }

    pub fn remove(&self, thread_id: &str) -> bool {
        lock_or_recover(&self.threads).remove(thread_id).is_some()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.threads).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
