mod admin_cmd;
mod app;
mod client;
mod config_cmd;
mod doctor_cmd;
mod sessions_cmd;
mod status_cmd;
mod terminal_output;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use labvm_config::{config_dir, config_file_path, load_and_prepare, validate, LabVmConfig, RuntimeKind};
use labvm_gateway::{build_router, start_server, AppState};
use labvm_logging::{init_logger, LogFormat};
use labvm_store::SqliteKvStore;

use client::ApiClient;
use config_cmd::ConfigCommands;

const PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser)]
#[command(name = "labvm")]
#[command(about = "labvm: per-user lab sandbox lifecycle manager")]
#[command(version)]
struct Cli {
    /// Base URL of a running server (client commands)
    #[arg(long, global = true, env = "LABVM_URL")]
    url: Option<String>,

    /// Admin identity sent with client commands
    #[arg(long = "as", global = true, env = "LABVM_ADMIN_USER", default_value = "admin")]
    admin_user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RuntimeArg {
    Docker,
    Memory,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and the reclamation loop
    Serve {
        /// Port to bind the HTTP server to
        #[arg(short, long)]
        port: Option<u16>,
        /// Sandbox engine
        #[arg(long, value_enum)]
        runtime: Option<RuntimeArg>,
    },
    /// Show server health and reclamation status
    Status,
    /// Run one reclamation tick now
    Optimize,
    /// Drop dead sessions and orphaned sandboxes
    Cleanup,
    /// List active sessions
    Sessions {
        /// Only this user's sessions
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Inspect or create the config file
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Check config, engine and registry
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = config_file_path(&config_dir());
    let mut config = load_and_prepare(&config_path).await?;

    init_logger(
        config.logging.dir.as_deref(),
        &config.logging.level,
        LogFormat::parse(&config.logging.format),
    )?;

    let url = cli
        .url
        .unwrap_or_else(|| client::local_base_url(&config.server.bind, config.server.port));
    let client = ApiClient::new(url, cli.admin_user);

    match cli.command {
        Commands::Serve { port, runtime } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(runtime) = runtime {
                config.runtime.kind = match runtime {
                    RuntimeArg::Docker => RuntimeKind::Docker,
                    RuntimeArg::Memory => RuntimeKind::Memory,
                };
            }
            run_server(config).await?;
        }
        Commands::Status => status_cmd::run(&client).await?,
        Commands::Optimize => admin_cmd::optimize(&client).await?,
        Commands::Cleanup => admin_cmd::cleanup(&client).await?,
        Commands::Sessions { user } => sessions_cmd::run(&client, user.as_deref()).await?,
        Commands::Config(cmd) => config_cmd::run(cmd, &config, &config_path).await?,
        Commands::Doctor => doctor_cmd::run(&config, &config_path).await?,
    }

    Ok(())
}

async fn run_server(config: LabVmConfig) -> Result<()> {
    for warning in validate(&config).warnings {
        warn!(path = %warning.path, message = %warning.message, "Config warning");
    }

    let ip: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind))?;
    let addr = SocketAddr::new(ip, config.server.port);

    info!(
        addr = %addr,
        runtime = ?config.runtime.kind,
        registry = ?config.registry.backend,
        "Starting labvm"
    );

    let services = app::build_services(&config)?;
    let cancel = CancellationToken::new();

    let optimizer_task = if config.reclamation.enabled {
        Some(services.optimizer.clone().spawn(cancel.child_token()))
    } else {
        warn!("Reclamation loop disabled; idle sandboxes are only reclaimed on demand");
        None
    };

    let purge_task = services
        .sqlite
        .clone()
        .map(|store| tokio::spawn(purge_expired(store, cancel.child_token())));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        shutdown.cancel();
    });

    let state = Arc::new(AppState {
        manager: services.manager,
        optimizer: services.optimizer,
    });
    let served = start_server(addr, build_router(state), cancel.clone()).await;
    cancel.cancel();

    for task in [optimizer_task, purge_task].into_iter().flatten() {
        if let Err(e) = task.await {
            error!(error = %e, "Background task ended abnormally");
        }
    }
    info!("labvm stopped");
    served
}

/// Drop expired registry rows now and then; reads already ignore them.
async fn purge_expired(store: Arc<SqliteKvStore>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "Purged expired sessions"),
                Err(e) => warn!(error = %e, "Registry purge failed"),
            },
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
