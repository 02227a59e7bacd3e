//! Per-correlation state store.
//!
//! Each key owns an async mutex around its optional state, so handlers for
//! one key run one at a time (across `.await` points) while different keys
//! proceed in parallel. The outer map lock is only held to find or create a
//! slot.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Locked view of one correlation's state. `None` until the saga starts;
/// completed sagas keep their final state so later messages can be dropped.
pub type SlotGuard<S> = OwnedMutexGuard<Option<S>>;

pub struct SagaStore<K, S> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<Option<S>>>>>,
}

impl<K, S> SagaStore<K, S>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to the slot for `key`, creating it empty.
    pub async fn lock(&self, key: &K) -> SlotGuard<S> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of correlations that have been locked at least once.
    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

impl<K, S> SagaStore<K, S>
where
    K: Eq + Hash + Clone,
    S: Clone,
{
    /// Copy of the current state, waiting for any in-flight handler.
    pub async fn snapshot(&self, key: &K) -> Option<S> {
        self.lock(key).await.clone()
    }
}

impl<K, S> Default for SagaStore<K, S>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slot_starts_empty_and_keeps_state() {
        let store: SagaStore<String, u32> = SagaStore::new();
        {
            let mut slot = store.lock(&"W1".to_string()).await;
            assert!(slot.is_none());
            *slot = Some(7);
        }
        assert_eq!(store.snapshot(&"W1".to_string()).await, Some(7));
        assert_eq!(store.tracked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_serialized() {
        let store: Arc<SagaStore<String, Vec<u32>>> = Arc::new(SagaStore::new());
        let key = "W1".to_string();

        let first = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let mut slot = store.lock(&key).await;
                let mut seen = slot.take().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(50)).await;
                seen.push(1);
                *slot = Some(seen);
            })
        };
        tokio::task::yield_now().await;

        let second = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let mut slot = store.lock(&key).await;
                let mut seen = slot.take().unwrap_or_default();
                seen.push(2);
                *slot = Some(seen);
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(store.snapshot(&key).await, Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block_each_other() {
        let store: SagaStore<String, u32> = SagaStore::new();
        let _held = store.lock(&"W1".to_string()).await;

        let other = tokio::time::timeout(Duration::from_millis(100), store.lock(&"W2".to_string())).await;
        assert!(other.is_ok());
    }
}
