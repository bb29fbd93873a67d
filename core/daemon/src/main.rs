//! Kinetic scan daemon entrypoint.
//!
//! A small, single-instance HTTP service. The phone client drives the scan
//! lifecycle and does all analysis; the daemon keeps the shared scan state
//! consistent under concurrent requests and persists finished scans as
//! write-once JSON records through a single background writer.

use clap::Parser;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod frame;
mod handlers;
mod history;
mod persist;
mod records;
mod reducer;
mod server;
mod state;

use config::{default_config_path, default_data_dir, load_config, DaemonConfig, StoragePaths};
use handlers::AppState;
use state::SharedState;

#[derive(Parser)]
#[command(name = "kinetic-scan-daemon")]
#[command(about = "Scan session daemon for the kinetic detector app")]
#[command(version)]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Interface to bind
    #[arg(long)]
    host: Option<String>,

    /// Directory holding records, the history log and daemon.toml
    #[arg(long, env = "KINETIC_SCAN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file path (defaults to <data-dir>/daemon.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let base_dir = match args.data_dir.clone() {
        Some(dir) => Ok(dir),
        None => default_data_dir(),
    };
    let (config, config_warning) = match &base_dir {
        Ok(dir) => {
            let path = args
                .config
                .clone()
                .unwrap_or_else(|| default_config_path(dir));
            match load_config(&path) {
                Ok(config) => (config, None),
                Err(err) => (DaemonConfig::default(), Some(err)),
            }
        }
        Err(_) => (DaemonConfig::default(), None),
    };

    let data_dir = match (args.data_dir.clone(), config.storage.data_dir.clone(), base_dir) {
        (Some(dir), _, _) | (None, Some(dir), _) => dir,
        (None, None, Ok(dir)) => dir,
        (None, None, Err(err)) => {
            init_logging(&config, None);
            error!(error = %err, "Failed to resolve daemon data directory");
            std::process::exit(1);
        }
    };
    let paths = StoragePaths::new(data_dir);
    let _logging_guard = init_logging(&config, Some(&paths));

    if let Some(err) = config_warning {
        warn!(error = %err, "Failed to load daemon config; using safe defaults");
    }

    let shared = match SharedState::open(&config, &paths) {
        Ok(shared) => shared,
        Err(err) => {
            error!(error = %err, data_dir = %paths.data_dir.display(), "Failed to open daemon state");
            std::process::exit(1);
        }
    };

    let addr = match bind_address(&args, &config) {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, "Invalid bind address");
            std::process::exit(1);
        }
    };

    let (app_state, shutdown) = AppState::new(shared);
    let (local_addr, server) =
        match server::start_server(addr, Arc::clone(&app_state), config.server.max_frame_bytes)
            .await
        {
            Ok(bound) => bound,
            Err(err) => {
                error!(error = %err, "Failed to start HTTP server");
                std::process::exit(1);
            }
        };

    info!(
        addr = %local_addr,
        data_dir = %paths.data_dir.display(),
        profile = %config.profile.name,
        queue_capacity = config.persistence.queue_capacity,
        require_scanning = config.frames.require_scanning,
        attach_frames = config.frames.attach_to_session,
        "Kinetic scan daemon started"
    );

    wait_for_signal().await;
    info!("Shutdown requested");
    shutdown.cancel();
    if let Err(err) = server.await {
        warn!(error = %err, "HTTP server task ended abnormally");
    }

    match app_state.shared.flush().await {
        Ok(()) => info!(metrics = ?app_state.shared.persist_metrics(), "Persist queue drained"),
        Err(err) => error!(error = %err, "Failed to drain persist queue"),
    }
}

fn init_logging(config: &DaemonConfig, paths: Option<&StoragePaths>) -> Option<WorkerGuard> {
    let debug_enabled = env::var("KINETIC_SCAN_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let logs_dir = match log_file_dir(config, paths) {
        Ok(dir) => dir,
        Err(err) => {
            // The subscriber is not installed yet.
            eprintln!("{}; logging to stderr only", err);
            None
        }
    };

    match logs_dir {
        Some(logs_dir) => {
            let appender = tracing_appender::rolling::daily(logs_dir, "daemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Directory for rolling log files, created on demand. `None` when file
/// logging is off.
fn log_file_dir(
    config: &DaemonConfig,
    paths: Option<&StoragePaths>,
) -> Result<Option<PathBuf>, String> {
    let Some(paths) = paths.filter(|_| config.logging.file) else {
        return Ok(None);
    };
    let logs_dir = paths.logs_dir();
    fs_err::create_dir_all(&logs_dir)
        .map_err(|err| format!("Failed to create log directory: {}", err))?;
    Ok(Some(logs_dir))
}

fn bind_address(args: &Args, config: &DaemonConfig) -> Result<SocketAddr, String> {
    let host = args.host.as_deref().unwrap_or(&config.server.host);
    let ip: IpAddr = host
        .parse()
        .map_err(|err| format!("Invalid host {:?}: {}", host, err))?;
    Ok(SocketAddr::new(ip, args.port.unwrap_or(config.server.port)))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
