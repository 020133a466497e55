//! Stale Primary Key Reclaim
//!
//! A key left behind by a previous primary is only deleted after its grace
//! deadline, and only with a compare-and-delete on the revision observed one
//! full grace window earlier. A former primary that is still renewing the
//! key bumps its revision, which pushes the deletion back again.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::link::LinkState;

/// Result of one reclaim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// No stale key is recorded
    NothingRecorded,
    /// Grace deadline has not passed yet
    NotYetDue { remaining: Duration },
    /// Key seen for the first time; deletion deferred by one grace window
    Observed { mod_revision: i64 },
    /// Key was written since the last sighting; deletion deferred again
    StillRenewed { mod_revision: i64 },
    /// Stale key is gone (`deleted` is false if it had already vanished)
    Reclaimed { deleted: bool },
}

impl ReclaimOutcome {
    /// Only a completed reclaim counts as success
    pub fn succeeded(&self) -> bool {
        matches!(self, ReclaimOutcome::Reclaimed { .. })
    }
}

/// Try to remove the stale primary key recorded on `link`
pub async fn try_reclaim_old_primary_path(
    link: &mut LinkState,
    grace: Duration,
    now: Instant,
) -> Result<ReclaimOutcome> {
    let Some(stale) = link.stale_key().cloned() else {
        return Ok(ReclaimOutcome::NothingRecorded);
    };

    if now < stale.delete_after {
        return Ok(ReclaimOutcome::NotYetDue {
            remaining: stale.delete_after - now,
        });
    }

    let session = link
        .session_mut()
        .ok_or_else(|| Error::Unavailable("no coordination session".into()))?;

    let Some(entry) = session.get(&stale.path).await? else {
        tracing::info!("Stale primary key {} already gone", stale.path);
        link.clear_stale_key();
        return Ok(ReclaimOutcome::Reclaimed { deleted: false });
    };

    let (outcome, observed) = match stale.observed_revision {
        Some(seen) if seen == entry.mod_revision => {
            if session.compare_and_delete(&stale.path, seen).await? {
                tracing::info!(
                    "Reclaimed stale primary key {} at revision {}",
                    stale.path,
                    seen
                );
                link.clear_stale_key();
                return Ok(ReclaimOutcome::Reclaimed { deleted: true });
            }
            // Written between our read and the delete
            (ReclaimOutcome::StillRenewed { mod_revision: seen }, None)
        }
        Some(_) => {
            tracing::info!(
                "Stale primary key {} is still being renewed, deferring reclaim",
                stale.path
            );
            (
                ReclaimOutcome::StillRenewed {
                    mod_revision: entry.mod_revision,
                },
                Some(entry.mod_revision),
            )
        }
        None => (
            ReclaimOutcome::Observed {
                mod_revision: entry.mod_revision,
            },
            Some(entry.mod_revision),
        ),
    };

    if let Some(pending) = link.stale_key_mut() {
        pending.observed_revision = observed;
        pending.delete_after = now + grace;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Connector, MemoryStore, StoreOp};
    use crate::link::LinkEvent;

    const GRACE: Duration = Duration::from_secs(20);

    async fn connected_link(store: &MemoryStore) -> LinkState {
        let mut link = LinkState::new();
        link.install_session(store.connector().connect_plain("mem").await.unwrap());
        link.apply(LinkEvent::ConnectSucceeded);
        link
    }

    #[tokio::test]
    async fn test_nothing_recorded_fails() {
        let store = MemoryStore::new();
        let mut link = connected_link(&store).await;

        let outcome = try_reclaim_old_primary_path(&mut link, GRACE, Instant::now())
            .await
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::NothingRecorded);
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_never_touches_store_before_deadline() {
        let store = MemoryStore::new();
        let mut link = connected_link(&store).await;
        store.put_external("/old", "value", 10);
        store.clear_ops();

        let now = Instant::now();
        link.record_stale_key("/old", now + GRACE);

        let outcome = try_reclaim_old_primary_path(&mut link, GRACE, now)
            .await
            .unwrap();
        assert!(matches!(outcome, ReclaimOutcome::NotYetDue { .. }));
        assert!(!outcome.succeeded());
        assert!(store.ops().is_empty());
        assert!(store.value("/old").is_some());
    }

    #[tokio::test]
    async fn test_idle_stale_key_deleted_after_second_window() {
        let store = MemoryStore::new();
        let mut link = connected_link(&store).await;
        store.put_external("/old", "value", 10);
        let rev = store.revision_of("/old").unwrap();

        let start = Instant::now();
        link.record_stale_key("/old", start);

        let outcome = try_reclaim_old_primary_path(&mut link, GRACE, start)
            .await
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::Observed { mod_revision: rev });
        assert!(store.value("/old").is_some());

        // Still inside the extended window
        let outcome = try_reclaim_old_primary_path(&mut link, GRACE, start + GRACE / 2)
            .await
            .unwrap();
        assert!(matches!(outcome, ReclaimOutcome::NotYetDue { .. }));

        let outcome = try_reclaim_old_primary_path(&mut link, GRACE, start + GRACE)
            .await
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::Reclaimed { deleted: true });
        assert!(store.value("/old").is_none());
        assert!(link.stale_key().is_none());
        assert!(store.ops().contains(&StoreOp::CompareAndDelete {
            key: "/old".to_string(),
            mod_revision: rev
        }));
    }

    #[tokio::test]
    async fn test_renewed_key_is_kept() {
        let store = MemoryStore::new();
        let mut link = connected_link(&store).await;
        store.put_external("/old", "value", 10);

        let start = Instant::now();
        link.record_stale_key("/old", start);
        try_reclaim_old_primary_path(&mut link, GRACE, start)
            .await
            .unwrap();

        // Former primary is alive and renews
        store.put_external("/old", "value", 10);
        let renewed = store.revision_of("/old").unwrap();

        let outcome = try_reclaim_old_primary_path(&mut link, GRACE, start + GRACE)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReclaimOutcome::StillRenewed {
                mod_revision: renewed
            }
        );
        assert!(store.value("/old").is_some());
        assert_eq!(link.stale_key().unwrap().observed_revision, Some(renewed));
        assert_eq!(link.stale_key().unwrap().delete_after, start + GRACE + GRACE);
    }

    #[tokio::test]
    async fn test_vanished_key_counts_as_reclaimed() {
        let store = MemoryStore::new();
        let mut link = connected_link(&store).await;

        let now = Instant::now();
        link.record_stale_key("/old", now);
        let outcome = try_reclaim_old_primary_path(&mut link, GRACE, now)
            .await
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::Reclaimed { deleted: false });
        assert!(outcome.succeeded());
        assert!(store.ops().iter().all(|op| !op.is_write()));
    }
}
