//! Per-key async locks

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// A table of async mutexes, one per key, created on demand.
///
/// Entries are removed again once nobody holds or waits for them, so the
/// table only ever contains keys that are in use.
#[derive(Clone, Default)]
pub(crate) struct KeyedLocks {
    table: Arc<LockTable>,
}

impl fmt::Debug for KeyedLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("held", &self.table.len())
            .finish()
    }
}

impl KeyedLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: impl Into<String>) -> KeyedGuard {
        let key = key.into();
        let mutex = self.table.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;

        KeyedGuard {
            key,
            table: self.table.clone(),
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.len()
    }
}

/// Exclusive access to one key of a [`KeyedLocks`] table.
pub(crate) struct KeyedGuard {
    key: String,
    table: Arc<LockTable>,
    _guard: OwnedMutexGuard<()>,
}

impl fmt::Debug for KeyedGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard").field("key", &self.key).finish()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // The table and this guard hold the only references when nobody waits.
        self.table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn entries_are_released() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock("a").await;
            let _b = locks.lock("b").await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("digest").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("digest").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        tokio::time::timeout(Duration::from_millis(100), locks.lock("b"))
            .await
            .expect("unrelated keys never block each other");
    }
}
