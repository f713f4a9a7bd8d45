//! `skirmish_client`
//!
//! Client-side systems:
//! - Connection management and handshake
//! - Typed remote calls with timeouts and retry
//! - Observable view of server state (resources, target lock)
//! - Local movement (jump counter)

pub mod client;
pub mod movement;
pub mod view;

pub use client::GameClient;
