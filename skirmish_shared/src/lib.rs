//! `skirmish_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Typed remote channels declared once and checked at the wire boundary.
//! - Observable cells for client-side state with ordered, isolated listeners.
//! - Explicitly constructed context objects instead of process globals.
//! - No `unsafe`.

pub mod cell;
pub mod channel;
pub mod config;
pub mod console;
pub mod ecs;
pub mod net;
pub mod protocol;
pub mod resources;
pub mod targeting;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::cell::*;
    pub use crate::channel::*;
    pub use crate::config::*;
    pub use crate::ecs::*;
    pub use crate::net::*;
    pub use crate::protocol::*;
}
