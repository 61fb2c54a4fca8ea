//! Process-local exclusive leases, one per run.
//!
//! A driver (engine or recovery sweep) must hold the run's lease for the
//! whole duration of a transition, released only after the persist
//! completes. The store's optimistic version check is the second line of
//! defense when state is shared across processes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use orchid_state::RunId;

/// Registry of currently held run leases.
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the exclusive lease for `run_id`.
    ///
    /// Returns `None` if another driver already holds it; the caller must
    /// step aside, not wait.
    pub fn try_acquire(&self, run_id: &RunId) -> Option<LeaseGuard> {
        let mut held = self.held.lock().unwrap();
        if !held.insert(run_id.as_str().to_string()) {
            return None;
        }
        Some(LeaseGuard {
            held: Arc::clone(&self.held),
            run_id: run_id.as_str().to_string(),
        })
    }

    /// Whether some driver currently holds `run_id`.
    pub fn is_held(&self, run_id: &RunId) -> bool {
        self.held.lock().unwrap().contains(run_id.as_str())
    }
}

/// Releases the lease on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    held: Arc<Mutex<HashSet<String>>>,
    run_id: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.held.lock().unwrap().remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_guard_drops() {
        let registry = LeaseRegistry::new();
        let run_id = RunId::new();

        let guard = registry.try_acquire(&run_id).unwrap();
        assert!(registry.try_acquire(&run_id).is_none());
        assert!(registry.is_held(&run_id));

        drop(guard);
        assert!(!registry.is_held(&run_id));
        assert!(registry.try_acquire(&run_id).is_some());
    }

    #[test]
    fn leases_are_independent_across_runs() {
        let registry = LeaseRegistry::new();
        let a = RunId::new();
        let b = RunId::new();

        let _guard_a = registry.try_acquire(&a).unwrap();
        assert!(registry.try_acquire(&b).is_some());
    }
}
