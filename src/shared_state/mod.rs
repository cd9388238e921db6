//! Cross-process state shared by every worker: token buckets, adaptive
//! multipliers and breaker records.
//!
//! All mutation goes through [`SharedStateStore::compare_and_update`], a
//! single atomic read-decide-write. Callers never read a value and write it
//! back in two steps.

mod keys;
mod memory;
mod sqlite;

pub use keys::{ResourceKind, StateKey};
pub use memory::InMemorySharedStateStore;
pub use sqlite::SqliteSharedStateStore;

use anyhow::Result;
use std::time::Duration;

/// Decision returned by an update closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// Leave the stored value (and its expiry) untouched.
    Keep,
    /// Store a new value, expiring `ttl` after `now_ms`.
    Put(String),
    /// Remove the record.
    Delete,
}

pub trait SharedStateStore: Send + Sync {
    /// Atomically reads the live value for `key` (expired records read as
    /// `None`), hands it to `update`, and applies the returned decision
    /// before any other caller, in this or any other process, can observe
    /// or modify the record.
    ///
    /// Returns the value stored after the update.
    fn compare_and_update(
        &self,
        key: &StateKey,
        now_ms: i64,
        ttl: Duration,
        update: &mut dyn FnMut(Option<&str>) -> StateUpdate,
    ) -> Result<Option<String>>;

    /// Reads the live value for `key`.
    fn get(&self, key: &StateKey, now_ms: i64) -> Result<Option<String>> {
        self.compare_and_update(key, now_ms, Duration::ZERO, &mut |_| StateUpdate::Keep)
    }

    fn delete(&self, key: &StateKey, now_ms: i64) -> Result<()> {
        self.compare_and_update(key, now_ms, Duration::ZERO, &mut |_| StateUpdate::Delete)?;
        Ok(())
    }

    /// Drops every record whose expiry is at or before `now_ms`.
    /// Returns the number of records removed.
    fn purge_expired(&self, now_ms: i64) -> Result<usize>;
}

fn expires_at(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod contract_tests {
    //! Behaviour every backend must share.

    use super::*;
    use std::sync::Arc;

    fn key(name: &str) -> StateKey {
        StateKey::new(ResourceKind::TokenBucket, name)
    }

    fn backends() -> (tempfile::TempDir, Vec<Arc<dyn SharedStateStore>>) {
        let dir = tempfile::TempDir::new().unwrap();
        let sqlite = SqliteSharedStateStore::open(dir.path().join("shared_state.db")).unwrap();
        (
            dir,
            vec![Arc::new(InMemorySharedStateStore::new()), Arc::new(sqlite)],
        )
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, stores) = backends();
        for store in stores {
            let stored = store
                .compare_and_update(&key("a"), 1000, Duration::from_secs(10), &mut |current| {
                    assert!(current.is_none());
                    StateUpdate::Put("one".to_string())
                })
                .unwrap();
            assert_eq!(stored.as_deref(), Some("one"));
            assert_eq!(store.get(&key("a"), 2000).unwrap().as_deref(), Some("one"));
        }
    }

    #[test]
    fn test_expired_record_reads_as_absent() {
        let (_dir, stores) = backends();
        for store in stores {
            store
                .compare_and_update(&key("a"), 1000, Duration::from_secs(1), &mut |_| {
                    StateUpdate::Put("v".to_string())
                })
                .unwrap();
            assert!(store.get(&key("a"), 1999).unwrap().is_some());
            assert!(store.get(&key("a"), 2000).unwrap().is_none());

            let mut seen = Some("sentinel".to_string());
            store
                .compare_and_update(&key("a"), 2500, Duration::from_secs(1), &mut |current| {
                    seen = current.map(str::to_string);
                    StateUpdate::Keep
                })
                .unwrap();
            assert_eq!(seen, None);
        }
    }

    #[test]
    fn test_keep_preserves_value_and_expiry() {
        let (_dir, stores) = backends();
        for store in stores {
            store
                .compare_and_update(&key("a"), 0, Duration::from_secs(5), &mut |_| {
                    StateUpdate::Put("v".to_string())
                })
                .unwrap();
            store
                .compare_and_update(&key("a"), 1000, Duration::from_secs(60), &mut |_| {
                    StateUpdate::Keep
                })
                .unwrap();
            assert!(store.get(&key("a"), 5000).unwrap().is_none());
        }
    }

    #[test]
    fn test_delete_and_purge() {
        let (_dir, stores) = backends();
        for store in stores {
            for name in ["a", "b", "c"] {
                store
                    .compare_and_update(&key(name), 0, Duration::from_secs(1), &mut |_| {
                        StateUpdate::Put(name.to_string())
                    })
                    .unwrap();
            }
            store.delete(&key("a"), 0).unwrap();
            assert!(store.get(&key("a"), 0).unwrap().is_none());

            assert_eq!(store.purge_expired(1000).unwrap(), 2);
            assert_eq!(store.purge_expired(1000).unwrap(), 0);
        }
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let (_dir, stores) = backends();
        for store in stores {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    std::thread::spawn(move || {
                        for _ in 0..25 {
                            store
                                .compare_and_update(
                                    &key("counter"),
                                    0,
                                    Duration::from_secs(60),
                                    &mut |current| {
                                        let n: u64 =
                                            current.and_then(|v| v.parse().ok()).unwrap_or(0);
                                        StateUpdate::Put((n + 1).to_string())
                                    },
                                )
                                .unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(
                store.get(&key("counter"), 0).unwrap().as_deref(),
                Some("200")
            );
        }
    }
}
