//! # gigroom-server
//!
//! Realtime chat server for job rooms.
//!
//! This crate provides:
//! - **Realtime gateway** that relays messages, typing indicators and read
//!   receipts to every connection joined to a job's room
//! - **Delivery guard** that only lets a job's client, applicants and hired
//!   developer into its channel
//! - **REST API** (axum) for sending messages, reading history and syncing
//!   job participants from the job service
//! - **WebSocket transport** authenticated with the same bearer token as the
//!   REST API

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod jobs;
pub mod rooms;
pub mod store;
pub mod ws;

use std::sync::{Arc, Mutex};

use gigroom_store::Database;

use crate::api::AppState;
use crate::auth::JwtConfig;
use crate::config::ServerConfig;
use crate::gateway::Gateway;
use crate::guard::DeliveryGuard;
use crate::jobs::SqliteJobDirectory;
use crate::store::{SharedDatabase, SqliteMessageStore};

/// Wire the process-wide services around an opened database.
pub fn build_state(config: ServerConfig, db: Database) -> AppState {
    let db: SharedDatabase = Arc::new(Mutex::new(db));

    let jobs = Arc::new(SqliteJobDirectory::new(db.clone()));
    let store = Arc::new(SqliteMessageStore::new(db));
    let gateway = Gateway::new(store, DeliveryGuard::new(jobs.clone()), config.outbound_buffer);
    let jwt = JwtConfig::new(config.jwt_secret.clone(), config.jwt_issuer.clone());

    AppState {
        gateway: Arc::new(gateway),
        jwt: Arc::new(jwt),
        jobs,
        config: Arc::new(config),
    }
}
