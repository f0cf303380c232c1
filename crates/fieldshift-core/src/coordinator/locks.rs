//! Row locks for fields, pipelines, and records.
//!
//! Every row is a read-write lock. Schema changes and record writes take
//! rows exclusively; record writes also hold their pipeline's record set
//! shared, so a migration holding it exclusively sees no concurrent saves.

use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::sync::Arc;
use std::time::Duration;

/// Lockable rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// A pipeline row; guards its field list.
    Pipeline(u64),
    /// A field row.
    Field(u64),
    /// A record row.
    Record(u64, u64),
    /// Every record of a pipeline.
    Records(u64),
}

enum Held {
    Shared { _guard: ArcRwLockReadGuard<RawRwLock, ()> },
    Exclusive { _guard: ArcRwLockWriteGuard<RawRwLock, ()> },
}

/// A held lock. Released on drop.
pub struct RowGuard {
    key: LockKey,
    held: Held,
}

impl RowGuard {
    /// The locked row.
    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Check if other holders are excluded.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Held::Exclusive { .. })
    }
}

impl std::fmt::Debug for RowGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowGuard")
            .field("key", &self.key)
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

/// Table of row locks.
#[derive(Debug, Default)]
pub struct LockManager {
    rows: DashMap<LockKey, Arc<RwLock<()>>>,
}

impl LockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `key` exclusively, waiting at most `timeout`. Returns `None` on
    /// timeout.
    pub fn try_lock_for(&self, key: LockKey, timeout: Duration) -> Option<RowGuard> {
        let guard = self.row(key).try_write_arc_for(timeout)?;
        Some(RowGuard {
            key,
            held: Held::Exclusive { _guard: guard },
        })
    }

    /// Lock `key` shared with other shared holders, waiting at most
    /// `timeout`. Returns `None` on timeout.
    pub fn try_lock_shared_for(&self, key: LockKey, timeout: Duration) -> Option<RowGuard> {
        let guard = self.row(key).try_read_arc_for(timeout)?;
        Some(RowGuard {
            key,
            held: Held::Shared { _guard: guard },
        })
    }

    // Clone the Arc out so the map shard is not held while waiting.
    fn row(&self, key: LockKey) -> Arc<RwLock<()>> {
        self.rows.entry(key).or_default().clone()
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, row| Arc::strong_count(row) > 1);
        before.saturating_sub(self.rows.len())
    }

    /// Number of tracked rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if no row is tracked.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_until_dropped() {
        let locks = LockManager::new();
        let guard = locks.try_lock_for(LockKey::Field(1), Duration::from_millis(10)).unwrap();
        assert_eq!(guard.key(), LockKey::Field(1));
        assert!(locks.try_lock_for(LockKey::Field(1), Duration::from_millis(10)).is_none());
        assert!(locks.try_lock_for(LockKey::Field(2), Duration::from_millis(10)).is_some());

        drop(guard);
        assert!(locks.try_lock_for(LockKey::Field(1), Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_shared_holders_exclude_writers() {
        let locks = LockManager::new();
        let timeout = Duration::from_millis(10);
        let first = locks.try_lock_shared_for(LockKey::Records(1), timeout).unwrap();
        let second = locks.try_lock_shared_for(LockKey::Records(1), timeout).unwrap();
        assert!(!first.is_exclusive());
        assert!(locks.try_lock_for(LockKey::Records(1), timeout).is_none());

        drop(first);
        drop(second);
        let writer = locks.try_lock_for(LockKey::Records(1), timeout).unwrap();
        assert!(writer.is_exclusive());
        assert!(locks.try_lock_shared_for(LockKey::Records(1), timeout).is_none());
        assert!(locks.try_lock_shared_for(LockKey::Records(2), timeout).is_some());
    }

    #[test]
    fn test_prune_keeps_held_rows() {
        let locks = LockManager::new();
        let held = locks.try_lock_for(LockKey::Record(1, 1), Duration::from_millis(10)).unwrap();
        drop(locks.try_lock_for(LockKey::Record(1, 2), Duration::from_millis(10)));
        assert_eq!(locks.len(), 2);
        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
    }
}
