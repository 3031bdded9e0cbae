//! ClawBridge - Session bridge between browser clients and AI coding CLIs

use anyhow::Result;
use clap::{Parser, Subcommand};
use clawbridge::bridge::hub::Hub;
use clawbridge::config::BridgeConfig;
use clawbridge::handler::{router, AppState};
use clawbridge::launcher::{bridge_hooks, CliLauncher};
use clawbridge::store::SessionStore;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clawbridge")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Session bridge between browser clients and AI coding CLIs")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CLAWBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge server
    Serve {
        /// Host to bind to (overrides configuration)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides configuration)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run diagnostics
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clawbridge={},tower_http=info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            run_serve(config, host, port).await?;
        }
        Commands::Doctor => {
            run_doctor(&config).await?;
        }
        Commands::Config { default } => {
            let shown = if default {
                BridgeConfig::default()
            } else {
                config
            };
            println!("{}", toml::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

async fn run_serve(
    config: BridgeConfig,
    host_override: Option<String>,
    port_override: Option<u16>,
) -> Result<()> {
    let host = host_override.unwrap_or_else(|| config.server.host.clone());
    let port = port_override.unwrap_or(config.server.port);

    tracing::info!("Starting ClawBridge");

    let store = SessionStore::open(config.storage.data_dir.clone())?;
    let (hooks, receivers) = bridge_hooks();
    let hub = Hub::new(store.clone(), config.limits, hooks, None);
    hub.restore_from_disk().await;

    let launcher = CliLauncher::new(port, store.clone(), config.launcher.binary.clone());
    launcher.restore_from_disk().await;
    launcher.start(hub.clone(), receivers, config.launcher.watchdog_secs);

    let app = router(AppState {
        hub: hub.clone(),
        launcher,
    });

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("ClawBridge listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
        })
        .await?;

    // Make sure nothing parked in the debounce window is lost
    store.flush().await;

    Ok(())
}

async fn run_doctor(config: &BridgeConfig) -> Result<()> {
    println!("ClawBridge Doctor");
    println!();

    println!("Checking CLI binary...");
    match &config.launcher.binary {
        Some(path) if path.exists() => {
            println!("  ok: configured binary found: {}", path.display());
        }
        Some(path) => {
            println!("  missing: configured binary not found: {}", path.display());
        }
        None => {
            let found = std::process::Command::new("which")
                .arg("claude")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if found {
                println!("  ok: claude found on PATH");
            } else {
                println!("  missing: claude not found on PATH (set launcher.binary)");
            }
        }
    }

    println!();
    println!("Checking data directory...");
    let dir = &config.storage.data_dir;
    match std::fs::create_dir_all(dir) {
        Ok(()) => println!("  ok: {} is writable", dir.display()),
        Err(e) => println!("  error: {}: {}", dir.display(), e),
    }

    println!();
    println!("Doctor check complete");
    Ok(())
}
