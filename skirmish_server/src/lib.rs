//! `skirmish_server`
//!
//! Server-side systems:
//! - Connection handshake with protocol and channel-registry agreement
//! - Authoritative target locks (`TryLockTarget` / `ClearTarget` / `TargetUpdated`)
//! - Per-session resource ledger (`FETCH_RESOURCES` / `RESOURCES_UPDATED`)
//! - Operator console
//!
//! Networking model:
//! - TCP only: one ordered stream per client carries requests, responses and
//!   pushes.

pub mod ledger;
pub mod server;
pub mod targeting;

pub use server::GameServer;
