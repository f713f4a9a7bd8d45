//! Per-session authoritative resources.

use std::collections::BTreeMap;

use skirmish_shared::{net::ClientId, resources::ResourceSnapshot};

/// Resource accounts keyed by session.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    starting: BTreeMap<String, u64>,
    accounts: BTreeMap<ClientId, ResourceSnapshot>,
}

impl ResourceLedger {
    pub fn new(starting: BTreeMap<String, u64>) -> Self {
        ResourceLedger {
            starting,
            accounts: BTreeMap::new(),
        }
    }

    /// Opens an account seeded with the starting resources.
    pub fn open(&mut self, client: ClientId) -> &ResourceSnapshot {
        self.accounts
            .entry(client)
            .or_insert_with(|| ResourceSnapshot::new(self.starting.clone()))
    }

    pub fn close(&mut self, client: ClientId) -> Option<ResourceSnapshot> {
        self.accounts.remove(&client)
    }

    pub fn snapshot(&self, client: ClientId) -> Option<&ResourceSnapshot> {
        self.accounts.get(&client)
    }

    /// Applies `delta` to one resource and returns the new snapshot.
    pub fn grant(&mut self, client: ClientId, resource: &str, delta: i64) -> Option<ResourceSnapshot> {
        let account = self.accounts.get_mut(&client)?;
        account.apply(resource, delta);
        Some(account.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_start_from_configured_amounts() {
        let mut ledger = ResourceLedger::new(BTreeMap::from([("gold".to_string(), 10)]));
        let snap = ledger.open(ClientId(5)).clone();
        assert_eq!(snap.amount("gold"), 10);
        assert_eq!(snap.revision, 0);

        let after = ledger.grant(ClientId(5), "gold", 5).unwrap();
        assert_eq!(after.amount("gold"), 15);
        assert_eq!(after.revision, 1);
        assert_eq!(ledger.snapshot(ClientId(5)), Some(&after));
    }

    #[test]
    fn grant_to_unknown_session_is_ignored() {
        let mut ledger = ResourceLedger::default();
        assert!(ledger.grant(ClientId(9), "gold", 1).is_none());
    }
}
