//! Client-side view of server state.
//!
//! Each piece of state lives in an [`ObservableCell`] so UI code can
//! subscribe to it. The server is authoritative: pushes overwrite whatever
//! the client showed optimistically.

use skirmish_shared::{cell::ObservableCell, ecs::EntityId, resources::ResourceSnapshot};

/// Observable state mirrored from the server.
#[derive(Debug, Clone, Default)]
pub struct ClientView {
    /// Last known resources; `None` until the first fetch or push.
    pub resources: ObservableCell<Option<ResourceSnapshot>>,
    /// Current target lock.
    pub target: ObservableCell<Option<EntityId>>,
}

impl ClientView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `snap` unless a newer revision is already shown. Returns
    /// whether it was applied.
    pub fn apply_resources(&self, snap: ResourceSnapshot) -> bool {
        if let Some(current) = self.resources.get() {
            if snap.is_older_than(&current) {
                return false;
            }
        }
        self.resources.set(Some(snap));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn stale_snapshot_does_not_overwrite_newer() {
        let view = ClientView::new();
        let mut snap = ResourceSnapshot::new(BTreeMap::new());
        snap.apply("gold", 5);
        let newer = snap.clone();
        let older = ResourceSnapshot::new(BTreeMap::new());

        assert!(view.apply_resources(newer.clone()));
        assert!(!view.apply_resources(older));
        assert_eq!(view.resources.get(), Some(newer));
    }
}
