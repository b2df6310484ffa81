//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use gigroom_shared::constants::DEFAULT_OUTBOUND_BUFFER;

/// Development-only signing secret used when `JWT_SECRET` is not set.
pub const DEV_JWT_SECRET: &str = "gigroom-dev-secret";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5001`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./gigroom.db`
    pub database_path: PathBuf,

    /// HS256 secret shared with the identity service that issues user tokens.
    /// Env: `JWT_SECRET`
    /// Default: [`DEV_JWT_SECRET`] (development only).
    pub jwt_secret: String,

    /// Expected `iss` claim, if the identity service sets one.
    /// Env: `JWT_ISSUER`
    pub jwt_issuer: Option<String>,

    /// Bearer token the job service presents to update participant records.
    /// Env: `SERVICE_TOKEN`
    /// Default: empty (participant sync endpoint disabled).
    pub service_token: Option<String>,

    /// Capacity of each connection's outbound event queue.
    /// Env: `OUTBOUND_BUFFER`
    /// Default: `256`
    pub outbound_buffer: usize,
}

// Secrets stay out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("jwt_issuer", &self.jwt_issuer)
            .field("service_token_set", &self.service_token.is_some())
            .field("outbound_buffer", &self.outbound_buffer)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 5001).into(),
            database_path: PathBuf::from("./gigroom.db"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_issuer: None,
            service_token: None,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        match lookup("JWT_SECRET") {
            Some(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ => tracing::warn!("JWT_SECRET not set, using development secret"),
        }

        if let Some(issuer) = lookup("JWT_ISSUER") {
            if !issuer.is_empty() {
                config.jwt_issuer = Some(issuer);
            }
        }

        if let Some(token) = lookup("SERVICE_TOKEN") {
            if !token.is_empty() {
                config.service_token = Some(token);
            }
        }

        if let Some(val) = lookup("OUTBOUND_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.outbound_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid OUTBOUND_BUFFER, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
