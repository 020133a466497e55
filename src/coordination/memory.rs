//! In-Memory Backend
//!
//! A deterministic coordination store kept in process memory. It records
//! every operation, mimics etcd's per-key `mod_revision`, and can be told
//! to refuse connections, reject writes, drop the link or answer slowly.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Connector, CoordinationSession, KeyEntry, TlsMaterial};
use crate::error::{Error, Result};

/// An operation observed by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Connect { address: String, tls: bool },
    Upsert { key: String, value: String, ttl_secs: u64 },
    Set { key: String, value: String, ttl_secs: u64 },
    RemoveSubtree { prefix: String },
    Get { key: String },
    CompareAndDelete { key: String, mod_revision: i64 },
    Close,
}

impl StoreOp {
    /// Whether this operation writes or deletes keys
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StoreOp::Upsert { .. }
                | StoreOp::Set { .. }
                | StoreOp::RemoveSubtree { .. }
                | StoreOp::CompareAndDelete { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct StoredKey {
    value: String,
    mod_revision: i64,
    ttl_secs: u64,
}

#[derive(Debug, Default)]
struct Inner {
    keys: BTreeMap<String, StoredKey>,
    revision: i64,
    ops: Vec<StoreOp>,
    refuse_connects: usize,
    reject_writes: bool,
    link_down: bool,
    latency: Duration,
}

impl Inner {
    fn write(&mut self, key: &str, value: &str, ttl_secs: u64) {
        self.revision += 1;
        self.keys.insert(
            key.to_string(),
            StoredKey {
                value: value.to_string(),
                mod_revision: self.revision,
                ttl_secs,
            },
        );
    }

    fn check_link(&self) -> Result<()> {
        if self.link_down {
            return Err(Error::Unavailable("memory store link down".into()));
        }
        Ok(())
    }

    fn check_write(&self, key: &str) -> Result<()> {
        self.check_link()?;
        if self.reject_writes {
            return Err(Error::Rejected {
                key: key.to_string(),
                reason: "writes rejected".into(),
            });
        }
        Ok(())
    }
}

/// Shared handle to an in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A connector opening sessions on this store
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    /// All operations observed so far
    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    /// Forget the recorded operations
    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Current keys, in order
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys.keys().cloned().collect()
    }

    /// Current value of `key`
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().keys.get(key).map(|k| k.value.clone())
    }

    /// Lease duration `key` was last written with
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.lock().keys.get(key).map(|k| k.ttl_secs)
    }

    /// Revision of the last write to `key`
    pub fn revision_of(&self, key: &str) -> Option<i64> {
        self.lock().keys.get(key).map(|k| k.mod_revision)
    }

    /// Write `key` as another party would, outside any session
    pub fn put_external(&self, key: &str, value: &str, ttl_secs: u64) {
        self.lock().write(key, value, ttl_secs);
    }

    /// Drop `key` as if its lease ran out
    pub fn expire(&self, key: &str) {
        self.lock().keys.remove(key);
    }

    /// Fail the next `count` connection attempts
    pub fn refuse_next_connects(&self, count: usize) {
        self.lock().refuse_connects = count;
    }

    /// Reject (or accept again) every write
    pub fn reject_writes(&self, reject: bool) {
        self.lock().reject_writes = reject;
    }

    /// Delay every session call by `latency`, like a slow store
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Make every call fail as unavailable until the link comes back
    pub fn set_link_down(&self, down: bool) {
        self.lock().link_down = down;
    }

    fn connect(&self, address: &str, tls: bool) -> Result<Box<dyn CoordinationSession>> {
        let mut inner = self.lock();
        inner.ops.push(StoreOp::Connect {
            address: address.to_string(),
            tls,
        });

        if inner.refuse_connects > 0 {
            inner.refuse_connects -= 1;
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }
        inner.check_link()?;

        Ok(Box::new(MemorySession {
            store: self.clone(),
        }))
    }
}

/// Opens sessions on a `MemoryStore`
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect_plain(&self, address: &str) -> Result<Box<dyn CoordinationSession>> {
        self.store.connect(address, false)
    }

    async fn connect_tls(
        &self,
        address: &str,
        _tls: &TlsMaterial,
    ) -> Result<Box<dyn CoordinationSession>> {
        self.store.connect(address, true)
    }
}

/// A session on a `MemoryStore`
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
}

#[async_trait::async_trait]
impl CoordinationSession for MemorySession {
    async fn upsert(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.store.delay().await;
        let mut inner = self.store.lock();
        inner.ops.push(StoreOp::Upsert {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
        });
        inner.check_write(key)?;
        inner.write(key, value, ttl_secs);
        Ok(())
    }

    async fn set(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.store.delay().await;
        let mut inner = self.store.lock();
        inner.ops.push(StoreOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
        });
        inner.check_write(key)?;
        inner.write(key, value, ttl_secs);
        Ok(())
    }

    async fn remove_subtree(&mut self, prefix: &str) -> Result<u64> {
        self.store.delay().await;
        let mut inner = self.store.lock();
        inner.ops.push(StoreOp::RemoveSubtree {
            prefix: prefix.to_string(),
        });
        inner.check_write(prefix)?;

        let before = inner.keys.len();
        inner.keys.retain(|key, _| !key.starts_with(prefix));
        let removed = before - inner.keys.len();
        if removed > 0 {
            inner.revision += 1;
        }
        Ok(removed as u64)
    }

    async fn get(&mut self, key: &str) -> Result<Option<KeyEntry>> {
        self.store.delay().await;
        let mut inner = self.store.lock();
        inner.ops.push(StoreOp::Get {
            key: key.to_string(),
        });
        inner.check_link()?;
        Ok(inner.keys.get(key).map(|k| KeyEntry {
            value: k.value.clone().into_bytes(),
            mod_revision: k.mod_revision,
        }))
    }

    async fn compare_and_delete(&mut self, key: &str, mod_revision: i64) -> Result<bool> {
        self.store.delay().await;
        let mut inner = self.store.lock();
        inner.ops.push(StoreOp::CompareAndDelete {
            key: key.to_string(),
            mod_revision,
        });
        inner.check_write(key)?;

        match inner.keys.get(key) {
            Some(stored) if stored.mod_revision == mod_revision => {
                inner.keys.remove(key);
                inner.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.store.lock().ops.push(StoreOp::Close);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_renews_single_key() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem:2379").await.unwrap();

        session.upsert("/k", "a", 10).await.unwrap();
        let first = store.revision_of("/k").unwrap();
        session.upsert("/k", "a", 10).await.unwrap();

        assert_eq!(store.keys(), vec!["/k".to_string()]);
        assert!(store.revision_of("/k").unwrap() > first);
        assert_eq!(store.ttl_of("/k"), Some(10));
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_matching_revision() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem:2379").await.unwrap();

        store.put_external("/old", "x", 10);
        let rev = store.revision_of("/old").unwrap();
        store.put_external("/old", "x", 10);

        assert!(!session.compare_and_delete("/old", rev).await.unwrap());
        assert!(store.value("/old").is_some());

        let rev = store.revision_of("/old").unwrap();
        assert!(session.compare_and_delete("/old", rev).await.unwrap());
        assert!(store.value("/old").is_none());
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem:2379").await.unwrap();

        store.put_external("/ns-ha-default-a", "1", 0);
        store.put_external("/ns-ha-default-b", "2", 0);
        store.put_external("/other", "3", 0);

        assert_eq!(session.remove_subtree("/ns-ha-").await.unwrap(), 2);
        assert_eq!(store.keys(), vec!["/other".to_string()]);
    }

    #[tokio::test]
    async fn test_refused_connects_and_link_down() {
        let store = MemoryStore::new();
        let connector = store.connector();
        store.refuse_next_connects(1);

        assert!(connector.connect_plain("mem:2379").await.is_err());
        let mut session = connector.connect_plain("mem:2379").await.unwrap();

        store.set_link_down(true);
        let err = session.get("/k").await.unwrap_err();
        assert!(err.is_link_failure());
    }
}
