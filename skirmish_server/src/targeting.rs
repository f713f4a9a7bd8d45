//! Authoritative target locks.
//!
//! Each session is either `Unlocked` or `LockedOn(entity)`, and an entity is
//! held by at most one session. All mutation happens on the server loop, so
//! racing requests are resolved in arrival order: the first valid request
//! wins and later ones are rejected.
//!
//! Policy:
//! - Re-locking the entity already held is idempotent (success, no transition).
//! - Locking a different legal entity while locked retargets atomically.
//! - A rejected lock leaves the caller's existing lock untouched.

use std::{collections::BTreeMap, fmt};

use skirmish_shared::{
    ecs::{EntityId, Targetable, World},
    net::ClientId,
};

/// Lock state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unlocked,
    LockedOn(EntityId),
}

impl TargetState {
    pub fn target(self) -> Option<EntityId> {
        match self {
            TargetState::Unlocked => None,
            TargetState::LockedOn(e) => Some(e),
        }
    }
}

/// A state change that must be pushed to `client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub client: ClientId,
    pub from: TargetState,
    pub to: TargetState,
}

/// Why a lock request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRejection {
    NoSuchEntity,
    NotTargetable,
    OwnEntity,
    HeldBy(ClientId),
}

impl fmt::Display for LockRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockRejection::NoSuchEntity => write!(f, "entity does not exist"),
            LockRejection::NotTargetable => write!(f, "entity is not targetable"),
            LockRejection::OwnEntity => write!(f, "cannot target own entity"),
            LockRejection::HeldBy(c) => write!(f, "already locked by client {}", c.0),
        }
    }
}

impl std::error::Error for LockRejection {}

/// Lock table indexed both ways.
#[derive(Debug, Default)]
pub struct TargetLocks {
    by_client: BTreeMap<ClientId, EntityId>,
    by_entity: BTreeMap<EntityId, ClientId>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, client: ClientId) -> TargetState {
        match self.by_client.get(&client) {
            Some(&e) => TargetState::LockedOn(e),
            None => TargetState::Unlocked,
        }
    }

    pub fn holder(&self, entity: EntityId) -> Option<ClientId> {
        self.by_entity.get(&entity).copied()
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    /// All held locks in client order.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, EntityId)> + '_ {
        self.by_client.iter().map(|(c, e)| (*c, *e))
    }

    fn check_legal(
        &self,
        world: &World,
        client: ClientId,
        own_entity: Option<EntityId>,
        entity: EntityId,
    ) -> Result<(), LockRejection> {
        if !world.contains(entity) {
            return Err(LockRejection::NoSuchEntity);
        }
        if world.get::<Targetable>(entity).is_none() {
            return Err(LockRejection::NotTargetable);
        }
        if own_entity == Some(entity) {
            return Err(LockRejection::OwnEntity);
        }
        match self.holder(entity) {
            Some(other) if other != client => Err(LockRejection::HeldBy(other)),
            _ => Ok(()),
        }
    }

    /// Handles `TryLockTarget`. `Ok(None)` means the caller already held it.
    pub fn try_lock(
        &mut self,
        world: &World,
        client: ClientId,
        own_entity: Option<EntityId>,
        entity: EntityId,
    ) -> Result<Option<Transition>, LockRejection> {
        let from = self.state(client);
        if from == TargetState::LockedOn(entity) {
            return Ok(None);
        }
        self.check_legal(world, client, own_entity, entity)?;

        if let TargetState::LockedOn(previous) = from {
            self.by_entity.remove(&previous);
        }
        self.by_client.insert(client, entity);
        self.by_entity.insert(entity, client);

        Ok(Some(Transition {
            client,
            from,
            to: TargetState::LockedOn(entity),
        }))
    }

    /// Handles `ClearTarget`. `None` means there was nothing to release.
    pub fn clear(&mut self, client: ClientId) -> Option<Transition> {
        let entity = self.by_client.remove(&client)?;
        self.by_entity.remove(&entity);
        Some(Transition {
            client,
            from: TargetState::LockedOn(entity),
            to: TargetState::Unlocked,
        })
    }

    /// Releases whoever holds `entity`, e.g. because it was despawned.
    pub fn release_entity(&mut self, entity: EntityId) -> Option<Transition> {
        let client = self.holder(entity)?;
        self.clear(client)
    }
}
