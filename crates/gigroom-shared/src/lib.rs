//! # gigroom-shared
//!
//! Types shared by the chat server, its store and the Rust client adapter:
//! validated identifiers, the JSON wire protocol spoken over the realtime
//! channel, and protocol-level constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{IdError, ProtocolError};
pub use types::{ConnectionId, JobId, UserId};
