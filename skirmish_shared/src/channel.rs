//! Typed remote channel contracts.
//!
//! A channel is a named path between the client and server halves. Each
//! channel is declared once by a marker type implementing [`RemoteFunction`]
//! or [`RemoteEvent`], which fixes its name and payload types at compile time.
//! A [`ChannelRegistry`] collects the declarations both halves agree on; it is
//! frozen once built.
//!
//! On the wire a channel is identified by its name and its payload travels as
//! JSON. The registry is the boundary where a name or payload that does not
//! match the declaration is rejected.

use std::{collections::HashMap, fmt, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Direction and reply semantics of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Client calls, server answers; handled inside the authoritative loop.
    ClientToServerRequest,
    /// Server pushes, no acknowledgment.
    ServerToClientEvent,
    /// Client calls, server answers; a read-side query on server state.
    ServerAsyncFunction,
}

impl ChannelKind {
    /// True for the kinds a client may invoke and await a reply from.
    pub fn is_callable(self) -> bool {
        matches!(
            self,
            ChannelKind::ClientToServerRequest | ChannelKind::ServerAsyncFunction
        )
    }
}

/// Stable name of a payload type as it appears in a [`ChannelDef`].
///
/// Spelled out per type rather than taken from `std::any::type_name`, whose
/// output may differ between compiler versions.
pub trait WireSchema {
    const SCHEMA: &'static str;
}

impl WireSchema for () {
    const SCHEMA: &'static str = "unit";
}

impl WireSchema for bool {
    const SCHEMA: &'static str = "bool";
}

impl WireSchema for u32 {
    const SCHEMA: &'static str = "u32";
}

impl WireSchema for u64 {
    const SCHEMA: &'static str = "u64";
}

impl WireSchema for String {
    const SCHEMA: &'static str = "string";
}

/// A client-invoked channel with a typed input and output.
pub trait RemoteFunction {
    const NAME: &'static str;
    const KIND: ChannelKind;
    type Input: Serialize + DeserializeOwned + WireSchema + Send + 'static;
    type Output: Serialize + DeserializeOwned + WireSchema + Send + 'static;
}

/// A server-pushed channel with a typed payload.
pub trait RemoteEvent {
    const NAME: &'static str;
    type Payload: Serialize + DeserializeOwned + WireSchema + Send + 'static;
}

/// One entry in a registry.
///
/// `input`/`output` hold the [`WireSchema`] names of the payloads, so two
/// halves built from different payload definitions disagree at handshake
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDef {
    pub name: String,
    pub kind: ChannelKind,
    pub input: String,
    pub output: String,
}

impl ChannelDef {
    pub fn function<F: RemoteFunction>() -> Self {
        ChannelDef {
            name: F::NAME.to_string(),
            kind: F::KIND,
            input: <F::Input as WireSchema>::SCHEMA.to_string(),
            output: <F::Output as WireSchema>::SCHEMA.to_string(),
        }
    }

    pub fn event<E: RemoteEvent>() -> Self {
        ChannelDef {
            name: E::NAME.to_string(),
            kind: ChannelKind::ServerToClientEvent,
            input: <E::Payload as WireSchema>::SCHEMA.to_string(),
            output: <() as WireSchema>::SCHEMA.to_string(),
        }
    }
}

/// Collects channel declarations before freezing them.
#[derive(Debug, Default)]
pub struct ChannelRegistryBuilder {
    defs: Vec<ChannelDef>,
}

impl ChannelRegistryBuilder {
    pub fn function<F: RemoteFunction>(mut self) -> Self {
        self.defs.push(ChannelDef::function::<F>());
        self
    }

    pub fn event<E: RemoteEvent>(mut self) -> Self {
        self.defs.push(ChannelDef::event::<E>());
        self
    }

    /// Applies a channel-set registration function.
    pub fn with(self, set: fn(ChannelRegistryBuilder) -> ChannelRegistryBuilder) -> Self {
        set(self)
    }

    /// Freezes the registry. Fails if two channels share a name.
    pub fn build(self) -> Result<ChannelRegistry, RegistryError> {
        let mut index = HashMap::with_capacity(self.defs.len());
        for (i, def) in self.defs.iter().enumerate() {
            if index.insert(def.name.clone(), i).is_some() {
                return Err(RegistryError::DuplicateChannel(def.name.clone()));
            }
        }
        Ok(ChannelRegistry {
            defs: self.defs,
            index,
        })
    }
}

/// Immutable set of channel declarations.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    defs: Vec<ChannelDef>,
    index: HashMap<String, usize>,
}

impl ChannelRegistry {
    pub fn builder() -> ChannelRegistryBuilder {
        ChannelRegistryBuilder::default()
    }

    /// The resource and targeting channel sets.
    pub fn standard() -> Result<Self, RegistryError> {
        Self::builder()
            .with(crate::resources::register_channels)
            .with(crate::targeting::register_channels)
            .build()
    }

    /// Declarations in registration order.
    pub fn definitions(&self) -> &[ChannelDef] {
        &self.defs
    }

    pub fn get(&self, name: &str) -> Option<&ChannelDef> {
        self.index.get(name).map(|&i| &self.defs[i])
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// True if `other` declares exactly the same channels in the same order.
    pub fn agrees_with(&self, other: &[ChannelDef]) -> bool {
        self.defs == other
    }

    /// Checks that `F` is declared here with a matching shape.
    pub fn check_function<F: RemoteFunction>(&self) -> Result<(), RemoteError> {
        match self.get(F::NAME) {
            Some(def) if *def == ChannelDef::function::<F>() => Ok(()),
            Some(_) => Err(RemoteError::ShapeMismatch {
                channel: F::NAME.to_string(),
                detail: "declaration differs from registry".to_string(),
            }),
            None => Err(RemoteError::UnknownChannel(F::NAME.to_string())),
        }
    }

    /// Server-side boundary check for an incoming call.
    pub fn check_incoming_call(&self, channel: &str) -> Result<&ChannelDef, RemoteFault> {
        let def = self
            .get(channel)
            .ok_or_else(|| RemoteFault::UnknownChannel(channel.to_string()))?;
        if !def.kind.is_callable() {
            return Err(RemoteFault::WrongDirection(channel.to_string()));
        }
        Ok(def)
    }

    /// Client-side boundary check for an incoming push.
    pub fn check_incoming_event(&self, channel: &str) -> Result<&ChannelDef, RemoteFault> {
        let def = self
            .get(channel)
            .ok_or_else(|| RemoteFault::UnknownChannel(channel.to_string()))?;
        if def.kind != ChannelKind::ServerToClientEvent {
            return Err(RemoteFault::WrongDirection(channel.to_string()));
        }
        Ok(def)
    }
}

/// Decodes a JSON payload into the type a channel declares.
pub fn decode_payload<T: DeserializeOwned>(channel: &str, payload: Value) -> Result<T, RemoteFault> {
    serde_json::from_value(payload).map_err(|e| RemoteFault::ShapeMismatch {
        channel: channel.to_string(),
        detail: e.to_string(),
    })
}

/// Encodes a payload for the wire.
pub fn encode_payload<T: Serialize>(channel: &str, payload: &T) -> Result<Value, RemoteFault> {
    serde_json::to_value(payload).map_err(|e| RemoteFault::ShapeMismatch {
        channel: channel.to_string(),
        detail: e.to_string(),
    })
}

/// Error building a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateChannel(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateChannel(name) => write!(f, "duplicate channel name '{name}'"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Failure reported by the remote side in place of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFault {
    /// No channel with this name is declared.
    UnknownChannel(String),
    /// The channel exists but cannot be used in this direction.
    WrongDirection(String),
    /// The payload does not match the declared type.
    ShapeMismatch { channel: String, detail: String },
    /// The handler failed for a reason unrelated to the caller's input.
    Internal(String),
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteFault::UnknownChannel(c) => write!(f, "unknown channel '{c}'"),
            RemoteFault::WrongDirection(c) => write!(f, "channel '{c}' used in the wrong direction"),
            RemoteFault::ShapeMismatch { channel, detail } => {
                write!(f, "payload mismatch on '{channel}': {detail}")
            }
            RemoteFault::Internal(msg) => write!(f, "remote handler failed: {msg}"),
        }
    }
}

impl std::error::Error for RemoteFault {}

/// Caller-side failure of a remote call.
///
/// Every variant is a transport or contract failure. A validation refusal
/// such as a rejected target lock is an `Ok(false)`, never a `RemoteError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// No reply arrived in time.
    Timeout { channel: String, after: Duration },
    /// The connection closed before a reply arrived.
    Disconnected,
    /// Writing the request failed.
    Transport(String),
    /// The channel is not in the caller's registry.
    UnknownChannel(String),
    /// The reply did not match the declared output type.
    ShapeMismatch { channel: String, detail: String },
    /// The remote side refused the call.
    Fault(RemoteFault),
}

impl RemoteError {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Timeout { .. } | RemoteError::Transport(_))
    }
}

impl From<RemoteFault> for RemoteError {
    fn from(fault: RemoteFault) -> Self {
        RemoteError::Fault(fault)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Timeout { channel, after } => {
                write!(f, "'{channel}' timed out after {}ms", after.as_millis())
            }
            RemoteError::Disconnected => write!(f, "connection closed"),
            RemoteError::Transport(msg) => write!(f, "transport error: {msg}"),
            RemoteError::UnknownChannel(c) => write!(f, "channel '{c}' is not registered"),
            RemoteError::ShapeMismatch { channel, detail } => {
                write!(f, "reply mismatch on '{channel}': {detail}")
            }
            RemoteError::Fault(fault) => write!(f, "{fault}"),
        }
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resources::{FetchResources, ResourcesUpdated},
        targeting::{ClearTarget, TargetUpdated, TryLockTarget},
    };

    struct Ping;

    impl RemoteFunction for Ping {
        const NAME: &'static str = "FETCH_RESOURCES";
        const KIND: ChannelKind = ChannelKind::ClientToServerRequest;
        type Input = u32;
        type Output = u32;
    }

    #[test]
    fn standard_registry_declares_both_sets() {
        let reg = ChannelRegistry::standard().unwrap();
        assert_eq!(reg.len(), 5);

        let names: Vec<_> = reg.definitions().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "RESOURCES_UPDATED",
                "FETCH_RESOURCES",
                "TryLockTarget",
                "ClearTarget",
                "TargetUpdated"
            ]
        );

        assert_eq!(
            reg.get(FetchResources::NAME).unwrap().kind,
            ChannelKind::ServerAsyncFunction
        );
        assert_eq!(
            reg.get(ResourcesUpdated::NAME).unwrap().kind,
            ChannelKind::ServerToClientEvent
        );
        assert_eq!(
            reg.get(TryLockTarget::NAME).unwrap().kind,
            ChannelKind::ClientToServerRequest
        );
        assert!(reg.check_function::<ClearTarget>().is_ok());
        assert!(reg.check_incoming_event(TargetUpdated::NAME).is_ok());
    }

    #[test]
    fn definitions_use_stable_schema_names() {
        assert_eq!(
            ChannelDef::function::<TryLockTarget>(),
            ChannelDef {
                name: "TryLockTarget".into(),
                kind: ChannelKind::ClientToServerRequest,
                input: "EntityId".into(),
                output: "bool".into(),
            }
        );
        let pushed = ChannelDef::event::<TargetUpdated>();
        assert_eq!(pushed.input, "Option<EntityId>");
        assert_eq!(pushed.output, "unit");
        assert_eq!(ChannelDef::function::<FetchResources>().output, "ResourceSnapshot");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ChannelRegistry::builder()
            .with(crate::resources::register_channels)
            .function::<Ping>()
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateChannel("FETCH_RESOURCES".into()));
    }

    #[test]
    fn mismatched_declaration_is_caught() {
        let reg = ChannelRegistry::standard().unwrap();
        assert!(matches!(
            reg.check_function::<Ping>(),
            Err(RemoteError::ShapeMismatch { .. })
        ));

        let empty = ChannelRegistry::builder().build().unwrap();
        assert_eq!(
            empty.check_function::<TryLockTarget>(),
            Err(RemoteError::UnknownChannel("TryLockTarget".into()))
        );
    }

    #[test]
    fn direction_is_enforced_at_the_boundary() {
        let reg = ChannelRegistry::standard().unwrap();
        assert_eq!(
            reg.check_incoming_call(TargetUpdated::NAME).unwrap_err(),
            RemoteFault::WrongDirection("TargetUpdated".into())
        );
        assert_eq!(
            reg.check_incoming_event(TryLockTarget::NAME).unwrap_err(),
            RemoteFault::WrongDirection("TryLockTarget".into())
        );
        assert_eq!(
            reg.check_incoming_call("Teleport").unwrap_err(),
            RemoteFault::UnknownChannel("Teleport".into())
        );
    }

    #[test]
    fn payload_shape_mismatch_is_reported() {
        let fault = decode_payload::<u64>("TryLockTarget", Value::String("x".into())).unwrap_err();
        assert!(matches!(fault, RemoteFault::ShapeMismatch { ref channel, .. } if channel == "TryLockTarget"));
    }
}
