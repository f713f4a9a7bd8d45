//! Target locking channels.
//!
//! The server is the single source of truth for who holds which lock.
//! `TryLockTarget` and `ClearTarget` return whether the server accepted the
//! request; `TargetUpdated` carries the authoritative target (or `None`) after
//! every change, and clients treat it as overriding any local guess.

use crate::{
    channel::{ChannelKind, ChannelRegistryBuilder, RemoteEvent, RemoteFunction, WireSchema},
    ecs::EntityId,
};

impl WireSchema for EntityId {
    const SCHEMA: &'static str = "EntityId";
}

impl WireSchema for Option<EntityId> {
    const SCHEMA: &'static str = "Option<EntityId>";
}

/// `TryLockTarget(entity) -> bool`.
pub struct TryLockTarget;

impl RemoteFunction for TryLockTarget {
    const NAME: &'static str = "TryLockTarget";
    const KIND: ChannelKind = ChannelKind::ClientToServerRequest;
    type Input = EntityId;
    type Output = bool;
}

/// `ClearTarget() -> bool`; `true` if a lock was released.
pub struct ClearTarget;

impl RemoteFunction for ClearTarget {
    const NAME: &'static str = "ClearTarget";
    const KIND: ChannelKind = ChannelKind::ClientToServerRequest;
    type Input = ();
    type Output = bool;
}

/// `TargetUpdated(target?)`.
pub struct TargetUpdated;

impl RemoteEvent for TargetUpdated {
    const NAME: &'static str = "TargetUpdated";
    type Payload = Option<EntityId>;
}

/// Registers the targeting channel set.
pub fn register_channels(builder: ChannelRegistryBuilder) -> ChannelRegistryBuilder {
    builder
        .function::<TryLockTarget>()
        .function::<ClearTarget>()
        .event::<TargetUpdated>()
}
