//! # gigroom-store
//!
//! Durable storage for job chat, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the two things the
//! chat subsystem persists: messages (with their read state) and the
//! participant record of each job, which decides who may talk in its room.

pub mod database;
pub mod jobs;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
