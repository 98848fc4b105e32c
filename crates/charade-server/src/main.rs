//! Charade server binary.
//!
//! ```bash
//! charade                          # control plane on port 2525
//! charade --port 3535              # control plane on port 3535
//! charade --configfile mocks.json  # create imposters at boot
//! charade --datadir ./charade-data # persist imposters to disk
//! charade stop --pidfile charade.pid
//! ```

use charade_server::admin_api::{AdminApiServer, ApiOptions};
use charade_server::imposter::{ImposterConfig, ImposterManager};
use charade_server::repository::{FilesystemRepository, InMemoryRepository, Repository};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Charade - programmable multi-protocol service virtualization
#[derive(Parser, Debug)]
#[command(name = "charade")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Port for the control plane
    #[arg(long, default_value = "2525", env = "CHARADE_PORT")]
    port: u16,

    /// Hostname to bind the control plane to
    #[arg(long, default_value = "0.0.0.0", env = "CHARADE_HOST")]
    host: String,

    /// Load imposters from a JSON file on startup
    #[arg(long, value_name = "FILE", env = "CHARADE_CONFIGFILE")]
    configfile: Option<PathBuf>,

    /// Directory for persistent imposter storage
    #[arg(long, value_name = "DIR", env = "CHARADE_DATADIR")]
    datadir: Option<PathBuf>,

    /// Allow scripted responses, predicates and behaviors
    #[arg(long, visible_alias = "allowInjection", env = "CHARADE_ALLOW_INJECTION")]
    allow_injection: bool,

    /// Only accept control-plane requests from localhost
    #[arg(long, env = "CHARADE_LOCAL_ONLY")]
    local_only: bool,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CHARADE_LOGLEVEL")]
    loglevel: String,

    /// CORS origin for the control plane (default *)
    #[arg(long)]
    origin: Option<String>,

    /// PID file path
    #[arg(long, value_name = "FILE")]
    pidfile: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server (default command)
    Start,

    /// Stop a running server
    Stop {
        /// PID file of the process to stop
        #[arg(long, default_value = "charade.pid")]
        pidfile: PathBuf,
    },
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    let log_level = match cli.loglevel.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    if let Some(Commands::Stop { pidfile }) = &cli.command {
        return stop_server(pidfile);
    }

    if let Some(pidfile) = &cli.pidfile {
        std::fs::write(pidfile, std::process::id().to_string())?;
        info!("wrote PID {} to {:?}", std::process::id(), pidfile);
    }

    info!("starting charade on port {}", cli.port);
    run_server(cli)
}

fn run_server(cli: Cli) -> Result<(), anyhow::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let repo: Arc<dyn Repository> = match &cli.datadir {
            Some(datadir) => Arc::new(FilesystemRepository::new(datadir)?),
            None => Arc::new(InMemoryRepository::new()),
        };
        let manager = Arc::new(ImposterManager::new(Arc::clone(&repo), cli.port));

        if let Some(datadir) = &cli.datadir {
            restore_imposters(&manager, datadir).await;
        }
        if let Some(configfile) = &cli.configfile {
            load_imposters_from_file(&manager, configfile).await?;
        }

        let host = if cli.local_only { "127.0.0.1" } else { &cli.host };
        let addr: SocketAddr = format!("{}:{}", host, cli.port).parse()?;
        let options = ApiOptions {
            port: cli.port,
            origin: cli.origin.clone(),
            allow_injection: cli.allow_injection,
        };

        if cli.allow_injection {
            info!("script injection enabled");
        }

        let server = AdminApiServer::new(addr, manager, options);
        server.run().await
    })
}

/// Restore imposters persisted in a previous run.
async fn restore_imposters(manager: &Arc<ImposterManager>, datadir: &Path) {
    for config in FilesystemRepository::load_configs(datadir) {
        let port = config.port;
        match manager.start(config).await {
            Ok(imposter) => info!(port = imposter.port(), "imposter restored from datadir"),
            Err(e) => error!("failed to restore imposter on port {port:?}: {e}"),
        }
    }
}

/// Create imposters from a JSON config file: either `{"imposters": [...]}`
/// or a bare array.
async fn load_imposters_from_file(
    manager: &Arc<ImposterManager>,
    path: &PathBuf,
) -> Result<(), anyhow::Error> {
    info!("loading imposters from {:?}", path);
    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    let imposters: Vec<ImposterConfig> = match value.get("imposters") {
        Some(list) => serde_json::from_value(list.clone())?,
        None => serde_json::from_value(value)?,
    };

    for config in imposters {
        let port = config.port;
        match manager.start(config).await {
            Ok(imposter) => info!(port = imposter.port(), "imposter created from configfile"),
            Err(e) => error!("failed to create imposter on port {port:?}: {e}"),
        }
    }
    Ok(())
}

/// Stop a running server by PID file. Idempotent: a missing pidfile means
/// there is nothing to stop, which is success.
fn stop_server(pidfile: &PathBuf) -> Result<(), anyhow::Error> {
    if !pidfile.exists() {
        info!("no pidfile at {:?}, nothing to stop", pidfile);
        return Ok(());
    }

    let pid: i32 = std::fs::read_to_string(pidfile)?.trim().parse()?;
    info!("stopping server with PID {}", pid);

    #[cfg(unix)]
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    std::fs::remove_file(pidfile)?;
    Ok(())
}
