//! taskgate - task dispatch gateway entry point

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use taskgate::config::{find_config_file, GatewayConfig};
use taskgate::dispatch::DispatchGateway;
use taskgate::observability::{init_default_logging, init_logging, metrics, LogSettings};
use taskgate::registry::{validate, RegistryError};
use taskgate::server::GatewayServer;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn, Level};

/// Task dispatch gateway
#[derive(Parser)]
#[command(name = "taskgate")]
#[command(about = "Routes task requests to local and platform-hosted backend agents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TASKGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the dispatch API
    Run,
    /// Probe every registered backend and exit non-zero on failure
    Preflight,
    /// Validate the backend registry
    Registry {
        /// Print the validated snapshot
        #[arg(long)]
        show: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 {
        init_logging(&LogSettings::from_env().with_level(Level::DEBUG));
    } else {
        init_default_logging();
    }

    let config_path = match find_config_file(cli.config.as_deref()) {
        Ok(path) => path,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    info!("Loading configuration from: {}", config_path.display());
    let config = match GatewayConfig::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_gateway(config, &config_path).await,
        Commands::Preflight => run_preflight(config, &config_path).await,
        Commands::Registry { show } => handle_registry_command(&config, &config_path, show),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

async fn run_gateway(
    config: GatewayConfig,
    config_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting taskgate v{} as '{}'",
        env!("CARGO_PKG_VERSION"),
        config.gateway.id
    );
    let collector = metrics();
    collector.set_gateway_state("initializing");

    let source = config.registry_source(Some(config_path));
    info!("Registry source: {}", source.describe());
    let gateway = Arc::new(DispatchGateway::from_config(&config, source)?);

    let report = gateway.preflight().await;
    if !report.passed {
        warn!("Startup preflight failed: {}", report.summary());
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = GatewayServer::new(Arc::clone(&gateway), config.gateway.listen_port);
    let server_task = tokio::spawn(server.run_until(async {
        let _ = shutdown_rx.await;
    }));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading registry");
                match gateway.reload_from_source().await {
                    Ok(snapshot) => info!(version = snapshot.version(), "Registry reloaded"),
                    Err(e) => error!("Registry reload rejected, keeping current snapshot: {}", e),
                }
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
        }
    }

    collector.set_gateway_state("stopping");
    let _ = shutdown_tx.send(());
    server_task.await??;
    info!("Gateway shutdown complete");
    Ok(())
}

async fn run_preflight(
    config: GatewayConfig,
    config_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = DispatchGateway::from_config(&config, config.registry_source(Some(config_path)))?;
    let report = gateway.preflight().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        return Err(format!("preflight failed: {}", report.summary()).into());
    }
    Ok(())
}

fn handle_registry_command(
    config: &GatewayConfig,
    config_path: &Path,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = config.registry_source(Some(config_path));
    let raw = source.load()?;
    let snapshot = match validate(&raw, 1) {
        Ok(snapshot) => snapshot,
        Err(RegistryError { issues }) => {
            for issue in &issues {
                eprintln!("  - {issue}");
            }
            return Err(format!("registry from {} has {} issue(s)", source.describe(), issues.len()).into());
        }
    };

    if show {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    info!(
        entries = snapshot.len(),
        "Registry from {} is valid",
        source.describe()
    );
    Ok(())
}

fn handle_config_command(
    config: &GatewayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
