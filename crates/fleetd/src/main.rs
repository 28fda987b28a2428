//! fleetd: the FleetGrid daemon.
//!
//! Single binary that assembles all FleetGrid subsystems:
//! - State store (redb)
//! - Worker pool + health monitor
//! - Autoscaler
//! - Admission front door
//! - Cache and data routers
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml --api-port 8443 --listen-port 8080
//! fleetd check-config --config fleet.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleet_core::FleetConfig;
use fleetd::{Collaborators, ControlPlane};
use fleetgrid_state::StateStore;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to fleet.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port for the REST API and /metrics.
        #[arg(long, default_value = "8443")]
        api_port: u16,

        /// Port for the admission front door.
        #[arg(long, default_value = "8080")]
        listen_port: u16,

        /// Data directory for persistent state (overrides `[state].data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Validate a config file and print the effective configuration.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Run {
            config,
            api_port,
            listen_port,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(data_dir) = data_dir {
                config.state.data_dir = data_dir;
            }
            run(config, api_port, listen_port).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(FleetConfig::default()),
    }
}

async fn run(config: FleetConfig, api_port: u16, listen_port: u16) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");

    // ── State store ────────────────────────────────────────────

    let data_dir = config.state.data_dir.clone();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let db_path = data_dir.join("fleetgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Subsystems ─────────────────────────────────────────────

    let collaborators = Collaborators::from_config(&config);
    let mut plane = ControlPlane::build(config, store, collaborators)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let handles = plane.spawn_background(shutdown_rx.clone());

    let front_addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
    let front_door = plane.front_door(front_addr);
    let front_handle = tokio::spawn(front_door.serve(shutdown_rx));

    // ── API server ─────────────────────────────────────────────

    let router = plane.api_router();
    let api_addr = SocketAddr::from(([0, 0, 0, 0], api_port));
    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .context("failed to bind API server")?;
    info!(addr = %api_addr, "API server listening");

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Wait for background tasks.
    for handle in handles {
        let _ = handle.await;
    }
    match front_handle.await {
        Ok(Err(e)) => error!(error = %e, "front door exited with error"),
        Err(e) => error!(error = %e, "front door task failed"),
        Ok(Ok(())) => {}
    }
    plane.stop_probes().await;

    info!("FleetGrid daemon stopped");
    Ok(())
}
