//! # gigroom-client
//!
//! Consuming side of the job chat channel: a WebSocket client that speaks
//! the gigroom wire protocol, dispatches server events to handlers and
//! subscribers, and rejoins its rooms after a dropped connection. Also home
//! to client-side typing policy, which the server deliberately knows nothing
//! about.

pub mod channel;
pub mod error;
pub mod typing;

pub use channel::{ChannelOptions, ChannelState, ChatChannel};
pub use error::ClientError;
pub use typing::TypingNotifier;
