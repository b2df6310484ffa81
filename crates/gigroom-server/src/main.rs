use tracing::info;
use tracing_subscriber::EnvFilter;

use gigroom_server::api;
use gigroom_server::config::ServerConfig;
use gigroom_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gigroom_server=debug")),
        )
        .init();

    info!("Starting gigroom chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.service_token.is_none() {
        info!("SERVICE_TOKEN not set, participant sync endpoint disabled");
    }

    // -----------------------------------------------------------------------
    // 3. Open the message store (runs pending migrations)
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;

    // -----------------------------------------------------------------------
    // 4. Build the shared gateway and application state
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = gigroom_server::build_state(config, db);

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
