//! Per-route write locks
//!
//! Segment upserts and route deletions on the same route are serialised;
//! writers on different routes and all readers proceed independently.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Registry of routes currently being written
#[derive(Debug, Default)]
pub struct RouteLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl RouteLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until no other writer holds `route_id`, then take it
    pub fn acquire(self: &Arc<Self>, route_id: &str) -> RouteLockGuard {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(route_id) {
            log::debug!("Waiting for write lock on route {}", route_id);
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(route_id.to_string());

        RouteLockGuard {
            locks: Arc::clone(self),
            route_id: route_id.to_string(),
        }
    }

    pub fn is_locked(&self, route_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(route_id)
    }
}

/// Releases its route when dropped
#[derive(Debug)]
pub struct RouteLockGuard {
    locks: Arc<RouteLocks>,
    route_id: String,
}

impl RouteLockGuard {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }
}

impl Drop for RouteLockGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.route_id);
        drop(held);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_guard_releases_on_drop() {
        let locks = RouteLocks::new();
        {
            let guard = locks.acquire("dongle--0001");
            assert_eq!(guard.route_id(), "dongle--0001");
            assert!(locks.is_locked("dongle--0001"));
            assert!(!locks.is_locked("dongle--0002"));
        }
        assert!(!locks.is_locked("dongle--0001"));
    }

    #[test]
    fn test_same_route_is_serialised() {
        let locks = RouteLocks::new();
        let guard = locks.acquire("r");
        let entered = Arc::new(AtomicBool::new(false));

        let waiter = {
            let locks = Arc::clone(&locks);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _guard = locks.acquire("r");
                entered.store(true, Ordering::SeqCst);
            })
        };

        // A different route is never blocked
        drop(locks.acquire("other"));

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        drop(guard);
        waiter.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
