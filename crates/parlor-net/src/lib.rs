//! # parlor-net
//!
//! Push channel: one WebSocket connection per authenticated session,
//! driven through typed command/event channels.

pub mod connection;

pub use connection::{
    spawn_push, ConnectionState, PushCommand, PushConfig, PushError, PushEvent,
};
