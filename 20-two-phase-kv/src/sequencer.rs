//! Optional per-key serialization of transactions.
//!
//! Without it, two concurrent transactions on the same key may reach the
//! replicas in different orders and leave them permanently divergent. With
//! it, a coordinator runs at most one transaction per key at a time. This only
//! orders transactions that go through the same coordinator instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries nobody holds or waits on are pruned once the table grows past this.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct KeySequencer {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other transaction holds `key`; released on drop.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_waits_for_release() {
        let sequencer = Arc::new(KeySequencer::new());
        let guard = sequencer.acquire("a").await;

        let contender = {
            let sequencer = Arc::clone(&sequencer);
            tokio::spawn(async move {
                let _guard = sequencer.acquire("a").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire after release")
            .expect("contender task");
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let sequencer = KeySequencer::new();
        let _a = sequencer.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), sequencer.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(sequencer.tracked_keys(), 2);
    }
}
