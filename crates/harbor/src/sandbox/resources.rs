use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Host-wide count of live sandboxes
///
/// Every loaded instance holds one [`ResourceGuard`] until its sandbox is
/// stopped and its extraction directory is removed.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    live: Arc<AtomicUsize>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> ResourceGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        ResourceGuard {
            live: self.live.clone(),
        }
    }

    /// Number of guards currently held
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Releases its slot in the [`ResourceTracker`] when dropped
#[derive(Debug)]
pub struct ResourceGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_are_counted() {
        let tracker = ResourceTracker::new();
        let a = tracker.acquire();
        let b = tracker.clone().acquire();
        assert_eq!(tracker.live(), 2);

        drop(a);
        assert_eq!(tracker.live(), 1);
        drop(b);
        assert_eq!(tracker.live(), 0);
    }
}
