//! Role-Conditional Work
//!
//! What a connected node does each tick depends on its role: a primary
//! renews the liveness key and reclaims stale keys, a replica watches.

pub mod cleanup;
pub mod primary;
pub mod replica;

pub use cleanup::{try_reclaim_old_primary_path, ReclaimOutcome};
pub use primary::{PrimaryRecord, PrimaryRegistrar};
pub use replica::{PrimaryObservation, ReplicaWatcher, WatchEvent};
