#![forbid(unsafe_code)]

//! `session-node`: one session of the distributed analysis service.
//!
//! Bootstraps configuration, opens the session log, connects to the
//! configured subordinates and serves the single control connection until
//! the session terminates or the process is signalled.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

use session_node::config::GlobalConfig;
use session_node::executor::{CommandExecutor, StaticCatalog};
use session_node::log_channel::LogChannel;
use session_node::log_level::LogLevelControl;
use session_node::packages::ShellPackageActions;
use session_node::session::{NodeServices, Session, SessionCoordinator, Subordinates};
use session_node::transport::{channel_pair, client, server, CHANNEL_CAPACITY};
use session_node::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "session-node", about = "Session coordinator of an analysis node", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the ordinal from the configuration.
    #[arg(long)]
    ordinal: Option<String>,

    /// Override the control socket name from the configuration.
    #[arg(long)]
    ipc_name: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(ordinal) = args.ordinal.clone() {
        config.ordinal = ordinal;
    }
    if let Some(ipc_name) = args.ipc_name.clone() {
        config.ipc_name = ipc_name;
    }
    config.validate()?;

    let session = Session::new(
        config.role,
        &config.ordinal,
        config.protocol_version,
        config.work_dir.clone(),
    )?;
    std::fs::create_dir_all(&config.work_dir)?;
    let log = LogChannel::open(
        config
            .work_dir
            .join(format!("{}.log", session.tag().dir_name())),
    )?;
    let log_level = init_tracing(args.log_format, log.clone())?;
    info!(tag = %session.tag(), "session-node bootstrap");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(Arc::new(config), session, log, log_level))
}

async fn run(
    config: Arc<GlobalConfig>,
    session: Session,
    log: LogChannel,
    log_level: LogLevelControl,
) -> Result<()> {
    let Some(executor_config) = config.executor.as_ref() else {
        return Err(AppError::Config("missing [executor] section".into()));
    };
    let services = NodeServices {
        executor: Arc::new(CommandExecutor::new(executor_config, config.work_dir.clone())),
        catalog: Arc::new(StaticCatalog::from_config(&config.datasets)),
        package_actions: Arc::new(ShellPackageActions),
        log_level,
    };

    let ct = CancellationToken::new();

    // ── Connect subordinates ────────────────────────────
    let mut links = Vec::with_capacity(config.subordinates.len());
    for subordinate in &config.subordinates {
        links.push(client::connect_subordinate(subordinate, ct.clone()).await?);
    }
    let subordinates = Subordinates::new(links, config.fanout_timeout());

    // ── Start listeners ─────────────────────────────────
    let (channels, peer) = channel_pair(CHANNEL_CAPACITY);
    let server_handles =
        server::spawn_session_server(&config.ipc_name, &config.urgent_ipc_name(), peer, ct.clone())?;

    let coordinator = SessionCoordinator::open(session, &config, log, services, channels, subordinates)?;
    info!("session ready");

    // ── Serve until terminated ──────────────────────────
    let outcome = tokio::select! {
        result = coordinator.run() => result,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };
    if let Err(err) = &outcome {
        error!(%err, "session failed");
    }

    ct.cancel();
    for handle in server_handles {
        let _ = handle.await;
    }
    info!("session-node shut down");
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat, log: LogChannel) -> Result<LogLevelControl> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let initial = env_filter.to_string();
    let (filter, handle) = reload::Layer::new(env_filter);
    let layer = fmt::layer().with_ansi(false).with_writer(log);

    match log_format {
        LogFormat::Text => tracing_subscriber::registry().with(filter).with(layer).try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init(),
    }
    .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?;

    Ok(LogLevelControl::from_handle(handle, &initial))
}
