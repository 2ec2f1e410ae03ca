// FantaGTS server entry point.
//
// Startup sequence:
// 1. Initialize tracing
// 2. Load config
// 3. Open database
// 4. Create mpsc channels and application state
// 5. Spawn WebSocket server task
// 6. Run the application event loop until shutdown

use fantagts::app;
use fantagts::auction::engine::AuctionEngine;
use fantagts::config;
use fantagts::db::Database;
use fantagts::ws_server;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    info!("FantaGTS server starting up");

    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: port={}, db={}, initial credits={}",
        config.ws_port, config.db_path, config.game.initial_credits
    );

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("failed to create database directory")?;
        }
    }
    let db = Database::open(&config.db_path).context("failed to open database")?;
    info!("Database opened at {}", config.db_path);

    let (ws_tx, ws_rx) = mpsc::channel(256);
    let (tick_tx, tick_rx) = mpsc::channel(8);

    let ws_port = config.ws_port;
    let state = app::AppState::new(config, db, AuctionEngine::new(), tick_tx);

    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(ws_port, ws_tx).await {
            error!("WebSocket server error: {e}");
        }
    });

    info!("Application ready. WebSocket server listening on 0.0.0.0:{ws_port}");
    let result = tokio::select! {
        r = app::run(ws_rx, tick_rx, state) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            Ok(())
        }
    };

    ws_handle.abort();
    info!("FantaGTS server shut down cleanly");
    result
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fantagts=info,warn")),
        )
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
