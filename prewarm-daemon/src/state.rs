use crate::worker::{EnvKey, Worker, WorkerFactory};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// State shared between the accept loop, the watcher task and teardown.
///
/// One lock covers both fields: reading the staleness flag is serialised
/// against the watcher's sample-compare-mark step.
#[derive(Default)]
pub struct SharedState {
    workers: HashMap<EnvKey, Arc<dyn Worker>>,
    stale: bool,
}

impl SharedState {
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// One-way transition; there is no way back to fresh.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// The worker for `key`, created through `factory` on first request.
    pub fn worker_for(&mut self, key: &EnvKey, factory: &dyn WorkerFactory) -> Arc<dyn Worker> {
        Arc::clone(
            self.workers
                .entry(key.clone())
                .or_insert_with(|| factory.create(key)),
        )
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Remove every worker so the caller can stop them outside the lock.
    pub fn take_workers(&mut self) -> Vec<(EnvKey, Arc<dyn Worker>)> {
        self.workers.drain().collect()
    }
}

pub type SharedStateRef = Arc<Mutex<SharedState>>;

/// Lock the shared state, recovering from a poisoned mutex.
pub fn lock(state: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
