use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use desk_core::Responder;
use desk_engine::ScriptedResponder;
use desk_server::{ConnectionRegistry, DeskConfig, OrchestratorSettings, SessionHub};
use desk_store::{Database, EventStore, SqliteEventStore};

/// Live support desk: AI agents with human takeover over WebSockets.
#[derive(Debug, Parser)]
#[command(name = "desk", version)]
struct Args {
    /// Config file (default: ~/.desk/config.json).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database for sessions and events.
    #[arg(long)]
    db: Option<PathBuf>,
    /// trace, debug, info, warn or error.
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut DeskConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(db) = self.db {
            config.storage.db_path = db;
        }
        if let Some(level) = self.log_level {
            config.telemetry.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = desk_server::load_config(args.config.as_deref()).context("loading config")?;
    args.apply(&mut config);
    config.validate()?;

    let telemetry = desk_telemetry::init_telemetry(config.telemetry.to_telemetry_config()?);
    tracing::info!("starting desk");

    let db = Database::open(&config.storage.db_path).context("opening database")?;
    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(db));
    let responder: Arc<dyn Responder> = Arc::new(ScriptedResponder::default());
    let connections = Arc::new(ConnectionRegistry::new(config.server.max_send_queue));
    let hub = Arc::new(SessionHub::new(
        store,
        responder,
        connections,
        OrchestratorSettings::from_config(&config),
    ));

    let handle = desk_server::start(config.server.clone(), hub, telemetry.logs())
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "desk ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
