//! Per-resource operation locks.
//!
//! Operations on the same `(backend, kind, id)` run one at a time; anything
//! else runs concurrently. Entries are dropped from the table once the last
//! holder or waiter releases them, so the table only ever holds live keys.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::ResourceKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub backend: String,
    pub kind: ResourceKind,
    pub id: String,
}

impl LockKey {
    pub fn new(backend: &str, kind: ResourceKind, id: &str) -> Self {
        Self {
            backend: backend.to_owned(),
            kind,
            id: id.to_owned(),
        }
    }
}

#[derive(Debug, Default)]
pub struct LockTable {
    entries: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`. The lock is held until the guard drops.
    pub async fn acquire(&self, key: LockKey) -> ResourceGuard {
        let mutex = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        ResourceGuard {
            key,
            entries: self.entries.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Exclusive hold on one resource key.
#[derive(Debug)]
pub struct ResourceGuard {
    key: LockKey,
    entries: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ResourceGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Table reference plus nobody else: no holder, no waiter.
        self.entries
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let table = Arc::new(LockTable::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (table, active, peak) = (table.clone(), active.clone(), peak.clone());
            tasks.push(tokio::spawn(async move {
                let _g = table
                    .acquire(LockKey::new("lvm", ResourceKind::Volume, "vol-1"))
                    .await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let table = LockTable::new();
        let _a = table
            .acquire(LockKey::new("lvm", ResourceKind::Volume, "vol-1"))
            .await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            table.acquire(LockKey::new("lvm", ResourceKind::Snapshot, "vol-1")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(table.len(), 2);
    }
}
