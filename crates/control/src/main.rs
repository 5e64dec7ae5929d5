//! netmesh control plane daemon

use clap::Parser;
use netmesh_common::Database;
use netmesh_control::{ControlConfig, ControlServer};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "netmeshd")]
#[command(about = "netmesh control plane - mesh VPN configuration and distribution")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "NETMESH_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Admin API bearer token
    #[arg(long, env = "NETMESH_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("netmesh control plane v{}", netmesh_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(|| netmesh_common::default_store_path().join("netmeshd.toml"));
    let mut config = ControlConfig::load(&config_path)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }
    if let Some(token) = cli.admin_token {
        config.admin_token = Some(token);
    }
    if config.admin_token.is_none() {
        tracing::warn!("No admin token configured, the admin API is unauthenticated");
    }

    let db_path = config.db_path();
    info!("Using database {}", db_path.display());
    let db = Database::open(&db_path)?;

    let server = ControlServer::new(config, db)?;
    let shutdown = CancellationToken::new();
    let mut serve_handle = tokio::spawn(server.serve(shutdown.clone()));

    // Wait for shutdown signal
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown.cancel();
            None
        }
        result = &mut serve_handle => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => serve_handle.await,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Server error: {}", e);
            return Err(e);
        }
        Err(e) => return Err(e.into()),
    }

    info!("Shutdown complete");
    Ok(())
}
