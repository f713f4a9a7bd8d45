//! Closed unions of the traffic each half handles.
//!
//! Wire messages name their channel with a string; these enums are what game
//! logic actually sees after the registry has accepted the name and the
//! payload has decoded into the declared type.

use serde_json::Value;

use crate::{
    channel::{decode_payload, encode_payload, ChannelRegistry, RemoteEvent, RemoteFault, RemoteFunction},
    ecs::EntityId,
    resources::{FetchResources, ResourceSnapshot, ResourcesUpdated},
    targeting::{ClearTarget, TargetUpdated, TryLockTarget},
};

/// A decoded client→server call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    FetchResources,
    TryLockTarget(EntityId),
    ClearTarget,
}

impl RemoteCall {
    /// Validates and decodes an incoming request.
    pub fn decode(
        registry: &ChannelRegistry,
        channel: &str,
        payload: Value,
    ) -> Result<Self, RemoteFault> {
        registry.check_incoming_call(channel)?;
        match channel {
            c if c == FetchResources::NAME => {
                decode_payload::<<FetchResources as RemoteFunction>::Input>(c, payload)?;
                Ok(RemoteCall::FetchResources)
            }
            c if c == TryLockTarget::NAME => Ok(RemoteCall::TryLockTarget(decode_payload(c, payload)?)),
            c if c == ClearTarget::NAME => {
                decode_payload::<<ClearTarget as RemoteFunction>::Input>(c, payload)?;
                Ok(RemoteCall::ClearTarget)
            }
            // Declared in the registry but no handler on this side.
            other => Err(RemoteFault::UnknownChannel(other.to_string())),
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            RemoteCall::FetchResources => FetchResources::NAME,
            RemoteCall::TryLockTarget(_) => TryLockTarget::NAME,
            RemoteCall::ClearTarget => ClearTarget::NAME,
        }
    }
}

/// A server→client push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ResourcesUpdated(ResourceSnapshot),
    TargetUpdated(Option<EntityId>),
}

impl ServerEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            ServerEvent::ResourcesUpdated(_) => ResourcesUpdated::NAME,
            ServerEvent::TargetUpdated(_) => TargetUpdated::NAME,
        }
    }

    pub fn encode(&self) -> Result<(&'static str, Value), RemoteFault> {
        let channel = self.channel();
        let payload = match self {
            ServerEvent::ResourcesUpdated(snap) => encode_payload(channel, snap)?,
            ServerEvent::TargetUpdated(target) => encode_payload(channel, target)?,
        };
        Ok((channel, payload))
    }

    /// Validates and decodes an incoming push.
    pub fn decode(
        registry: &ChannelRegistry,
        channel: &str,
        payload: Value,
    ) -> Result<Self, RemoteFault> {
        registry.check_incoming_event(channel)?;
        match channel {
            c if c == ResourcesUpdated::NAME => {
                Ok(ServerEvent::ResourcesUpdated(decode_payload(c, payload)?))
            }
            c if c == TargetUpdated::NAME => Ok(ServerEvent::TargetUpdated(decode_payload(c, payload)?)),
            other => Err(RemoteFault::UnknownChannel(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_calls_from_both_sets() {
        let reg = ChannelRegistry::standard().unwrap();
        assert_eq!(
            RemoteCall::decode(&reg, "TryLockTarget", json!(7)).unwrap(),
            RemoteCall::TryLockTarget(EntityId(7))
        );
        assert_eq!(
            RemoteCall::decode(&reg, "ClearTarget", Value::Null).unwrap(),
            RemoteCall::ClearTarget
        );
        assert_eq!(
            RemoteCall::decode(&reg, "FETCH_RESOURCES", Value::Null).unwrap(),
            RemoteCall::FetchResources
        );
    }

    #[test]
    fn malformed_call_never_reaches_game_logic() {
        let reg = ChannelRegistry::standard().unwrap();
        assert!(matches!(
            RemoteCall::decode(&reg, "TryLockTarget", json!({"entity": "x"})),
            Err(RemoteFault::ShapeMismatch { .. })
        ));
        assert_eq!(
            RemoteCall::decode(&reg, "RESOURCES_UPDATED", Value::Null),
            Err(RemoteFault::WrongDirection("RESOURCES_UPDATED".into()))
        );
    }

    #[test]
    fn cleared_target_encodes_as_null() {
        let reg = ChannelRegistry::standard().unwrap();
        let (channel, payload) = ServerEvent::TargetUpdated(None).encode().unwrap();
        assert_eq!(channel, "TargetUpdated");
        assert_eq!(payload, Value::Null);
        assert_eq!(
            ServerEvent::decode(&reg, channel, payload).unwrap(),
            ServerEvent::TargetUpdated(None)
        );
    }
}
