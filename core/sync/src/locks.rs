//! Per-document lock arena.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use tideline_common::DocumentKey;

/// Dead entries are pruned once the map grows past this size.
const PRUNE_THRESHOLD: usize = 256;

/// Serializes work on one document across local writes, pushes and remote
/// applies.
///
/// Locks are created on demand and held weakly; a key's entry disappears
/// once nobody holds or waits for its lock.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<DocumentKey, Weak<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting for any current holder.
    pub async fn lock(&self, key: &DocumentKey) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    fn handle(&self, key: &DocumentKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        if locks.len() >= PRUNE_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    /// Number of keys whose lock is currently held or awaited.
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(s: &str) -> DocumentKey {
        DocumentKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks.lock(&key("plant/1")).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key("plant/1")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&key("plant/1")).await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock(&key("plant/2")))
            .await
            .unwrap();
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let locks = KeyLocks::new();
        for i in 0..(PRUNE_THRESHOLD + 10) {
            let _guard = locks.lock(&key(&format!("plant/{}", i))).await;
        }
        assert_eq!(locks.active(), 0);
        assert!(locks.locks.lock().unwrap().len() < PRUNE_THRESHOLD + 10);
    }
}
