//! Resource synchronization channels.
//!
//! The server pushes `RESOURCES_UPDATED` whenever a player's resources change
//! and answers `FETCH_RESOURCES` with the current snapshot. Push gives the
//! client low latency; pull lets it recover after a reconnect or any
//! suspected gap in the pushes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelKind, ChannelRegistryBuilder, RemoteEvent, RemoteFunction, WireSchema};

/// Authoritative resource amounts for one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Bumped by the server on every change.
    pub revision: u64,
    pub amounts: BTreeMap<String, u64>,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(amounts: BTreeMap<String, u64>) -> Self {
        ResourceSnapshot {
            revision: 0,
            amounts,
            taken_at: Utc::now(),
        }
    }

    /// Amount held of `resource`, zero if absent.
    pub fn amount(&self, resource: &str) -> u64 {
        self.amounts.get(resource).copied().unwrap_or(0)
    }

    /// Applies a signed delta, saturating at zero, and bumps the revision.
    pub fn apply(&mut self, resource: &str, delta: i64) -> u64 {
        let entry = self.amounts.entry(resource.to_string()).or_insert(0);
        *entry = if delta >= 0 {
            entry.saturating_add(delta.unsigned_abs())
        } else {
            entry.saturating_sub(delta.unsigned_abs())
        };
        self.revision += 1;
        self.taken_at = Utc::now();
        *entry
    }

    /// True if `other` is a later revision of this snapshot.
    pub fn is_older_than(&self, other: &ResourceSnapshot) -> bool {
        self.revision < other.revision
    }
}

impl WireSchema for ResourceSnapshot {
    const SCHEMA: &'static str = "ResourceSnapshot";
}

/// `RESOURCES_UPDATED`: server pushes the current snapshot after a change.
pub struct ResourcesUpdated;

impl RemoteEvent for ResourcesUpdated {
    const NAME: &'static str = "RESOURCES_UPDATED";
    type Payload = ResourceSnapshot;
}

/// `FETCH_RESOURCES`: client pulls the current snapshot.
pub struct FetchResources;

impl RemoteFunction for FetchResources {
    const NAME: &'static str = "FETCH_RESOURCES";
    const KIND: ChannelKind = ChannelKind::ServerAsyncFunction;
    type Input = ();
    type Output = ResourceSnapshot;
}

/// Registers the resource channel set.
pub fn register_channels(builder: ChannelRegistryBuilder) -> ChannelRegistryBuilder {
    builder.event::<ResourcesUpdated>().function::<FetchResources>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_saturates_and_bumps_revision() {
        let mut snap = ResourceSnapshot::new(BTreeMap::from([("gold".to_string(), 10)]));
        assert_eq!(snap.apply("gold", -25), 0);
        assert_eq!(snap.apply("wood", 7), 7);
        assert_eq!(snap.revision, 2);
        assert_eq!(snap.amount("stone"), 0);
    }

    #[test]
    fn revision_orders_snapshots() {
        let old = ResourceSnapshot::new(BTreeMap::new());
        let mut new = old.clone();
        new.apply("gold", 1);
        assert!(old.is_older_than(&new));
        assert!(!new.is_older_than(&old));
    }
}
