//! Replica Watch
//!
//! A replica polls the liveness key once per tick and publishes what it
//! sees on a watch channel. An absent key is the promotion-candidacy signal
//! for whatever makes failover decisions; a new identity only updates the
//! cached view. The watcher never writes.

use tokio::sync::watch;

use super::primary::PrimaryRecord;
use crate::coordination::CoordinationSession;
use crate::error::Result;

/// Latest view of the primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryObservation {
    /// Nothing observed yet
    Unknown,
    /// Liveness key present
    Present(PrimaryRecord),
    /// Liveness key absent or expired
    Absent,
}

/// Change detected by one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Same primary as before (or still none)
    Unchanged,
    /// A primary appeared or a different node took over
    PrimaryChanged {
        previous: Option<String>,
        current: PrimaryRecord,
    },
    /// The key disappeared; this replica is a promotion candidate
    PrimaryLost { last: Option<String> },
}

/// Observes the primary's liveness key from a replica
#[derive(Debug)]
pub struct ReplicaWatcher {
    key: String,
    tx: watch::Sender<PrimaryObservation>,
}

impl ReplicaWatcher {
    /// Create a watcher for `key`
    pub fn new(key: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(PrimaryObservation::Unknown);
        Self {
            key: key.into(),
            tx,
        }
    }

    /// Subscribe to primary observations
    pub fn subscribe(&self) -> watch::Receiver<PrimaryObservation> {
        self.tx.subscribe()
    }

    /// Latest observation
    pub fn current(&self) -> PrimaryObservation {
        self.tx.borrow().clone()
    }

    /// Forget what was observed, e.g. after leaving the replica role
    pub fn reset(&mut self) {
        self.tx.send_replace(PrimaryObservation::Unknown);
    }

    /// Poll the liveness key once
    pub async fn observe(&mut self, session: &mut dyn CoordinationSession) -> Result<WatchEvent> {
        let next = match session.get(&self.key).await? {
            Some(entry) => PrimaryObservation::Present(PrimaryRecord::decode(&entry.value_str())),
            None => PrimaryObservation::Absent,
        };

        let previous = self.current();
        let event = match (&previous, &next) {
            (PrimaryObservation::Present(old), PrimaryObservation::Present(new))
                if old.same_identity(new) =>
            {
                WatchEvent::Unchanged
            }
            (PrimaryObservation::Absent, PrimaryObservation::Absent) => WatchEvent::Unchanged,
            (old, PrimaryObservation::Present(new)) => WatchEvent::PrimaryChanged {
                previous: match old {
                    PrimaryObservation::Present(record) => Some(record.node_id.clone()),
                    _ => None,
                },
                current: new.clone(),
            },
            (old, PrimaryObservation::Absent) => WatchEvent::PrimaryLost {
                last: match old {
                    PrimaryObservation::Present(record) => Some(record.node_id.clone()),
                    _ => None,
                },
            },
            (_, PrimaryObservation::Unknown) => WatchEvent::Unchanged,
        };

        match &event {
            WatchEvent::PrimaryChanged { previous, current } => tracing::info!(
                "Primary is now {} at {} (was {})",
                current.node_id,
                current.address,
                previous.as_deref().unwrap_or("unknown")
            ),
            WatchEvent::PrimaryLost { last } => tracing::warn!(
                "Liveness key {} is gone (last primary: {}), node is a promotion candidate",
                self.key,
                last.as_deref().unwrap_or("unknown")
            ),
            WatchEvent::Unchanged => {}
        }

        if previous != next {
            self.tx.send_replace(next);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Connector, MemoryStore};

    fn record(id: &str, address: &str) -> String {
        serde_json::to_string(&PrimaryRecord {
            node_id: id.to_string(),
            address: address.to_string(),
            since: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_detects_new_primary_then_loss() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem").await.unwrap();
        let mut watcher = ReplicaWatcher::new("/k");
        let mut rx = watcher.subscribe();

        store.put_external("/k", &record("redis-0", "10.0.0.5:6379"), 10);
        let event = watcher.observe(session.as_mut()).await.unwrap();
        assert!(matches!(
            event,
            WatchEvent::PrimaryChanged { previous: None, ref current } if current.node_id == "redis-0"
        ));
        assert!(rx.has_changed().unwrap());
        assert!(matches!(
            &*rx.borrow_and_update(),
            PrimaryObservation::Present(r) if r.node_id == "redis-0"
        ));

        // Renewal by the same primary is not a change
        store.put_external("/k", &record("redis-0", "10.0.0.5:6379"), 10);
        assert_eq!(watcher.observe(session.as_mut()).await.unwrap(), WatchEvent::Unchanged);
        assert!(!rx.has_changed().unwrap());

        store.expire("/k");
        let event = watcher.observe(session.as_mut()).await.unwrap();
        assert_eq!(
            event,
            WatchEvent::PrimaryLost {
                last: Some("redis-0".to_string())
            }
        );
        assert_eq!(*rx.borrow_and_update(), PrimaryObservation::Absent);

        assert_eq!(watcher.observe(session.as_mut()).await.unwrap(), WatchEvent::Unchanged);
    }

    #[tokio::test]
    async fn test_failover_to_other_node() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem").await.unwrap();
        let mut watcher = ReplicaWatcher::new("/k");

        store.put_external("/k", &record("redis-0", "10.0.0.5:6379"), 10);
        watcher.observe(session.as_mut()).await.unwrap();

        store.put_external("/k", &record("redis-2", "10.0.0.7:6379"), 10);
        let event = watcher.observe(session.as_mut()).await.unwrap();
        assert!(matches!(
            event,
            WatchEvent::PrimaryChanged { previous: Some(ref p), ref current }
                if p == "redis-0" && current.node_id == "redis-2"
        ));
    }

    #[tokio::test]
    async fn test_never_writes() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem").await.unwrap();
        let mut watcher = ReplicaWatcher::new("/k");

        for _ in 0..3 {
            watcher.observe(session.as_mut()).await.unwrap();
        }
        assert!(store.ops().iter().all(|op| !op.is_write()));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_reset_forgets_view() {
        let store = MemoryStore::new();
        let mut session = store.connector().connect_plain("mem").await.unwrap();
        let mut watcher = ReplicaWatcher::new("/k");

        watcher.observe(session.as_mut()).await.unwrap();
        assert_eq!(watcher.current(), PrimaryObservation::Absent);
        watcher.reset();
        assert_eq!(watcher.current(), PrimaryObservation::Unknown);
    }
}
