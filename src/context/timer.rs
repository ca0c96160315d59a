use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Timer identifier, unique within one context pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Pending timers of a pool, keyed by id.
#[derive(Default)]
pub(crate) struct TimerTable {
    next_id: AtomicU64,
    active: DashMap<TimerId, CancellationToken>,
}

impl TimerTable {
    pub(crate) fn insert(&self) -> (TimerId, CancellationToken) {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let token = CancellationToken::new();
        self.active.insert(id, token.clone());
        (id, token)
    }

    /// Cancel a pending timer. False when it already fired or was cancelled.
    pub(crate) fn cancel(&self, id: TimerId) -> bool {
        match self.active.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: TimerId) {
        self.active.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_once() {
        let table = TimerTable::default();
        let (a, token) = table.insert();
        let (b, _) = table.insert();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        assert!(table.cancel(a));
        assert!(token.is_cancelled());
        assert!(!table.cancel(a));
        assert_eq!(table.len(), 1);
    }
}
