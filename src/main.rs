//! PQCrypta Control - control plane for PQCrypta reverse-proxy fleets
//!
//! Loads declared routing state, reconciles the proxy engine with it on startup
//! and serves the admin API until shutdown. SIGHUP reloads the config file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pqcrypta_control::admin::AdminServer;
use pqcrypta_control::audit_logger::AuditLogger;
use pqcrypta_control::backup::BackupWriter;
use pqcrypta_control::config::{ConfigManager, ControlConfig};
use pqcrypta_control::engine::AdminApiEngine;
use pqcrypta_control::geo::resolver_from_config;
use pqcrypta_control::orchestrator::{ApplyPolicy, ControlPlane};
use pqcrypta_control::store::{MemoryStore, Store};

/// PQCrypta Control - reverse-proxy fleet control plane
#[derive(Parser, Debug)]
#[command(name = "pqcrypta-control")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "/etc/pqcrypta/control.toml",
        env = "PQCRYPTA_CONTROL_CONFIG"
    )]
    config: PathBuf,

    /// Override admin API port
    #[arg(long, env = "PQCRYPTA_CONTROL_ADMIN_PORT")]
    admin_port: Option<u16>,

    /// Override proxy engine admin URL
    #[arg(long, env = "PQCRYPTA_CONTROL_ENGINE_URL")]
    engine_url: Option<String>,

    /// Override state file path
    #[arg(long, env = "PQCRYPTA_CONTROL_STATE")]
    state: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PQCRYPTA_CONTROL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log format
    #[arg(long, env = "PQCRYPTA_CONTROL_JSON_LOGS")]
    json_logs: bool,

    /// Skip the startup reconcile
    #[arg(long)]
    no_reconcile: bool,

    /// Run configuration validation only (don't start server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_manager = Arc::new(ConfigManager::new(&args.config)?);

    // Apply CLI overrides
    let mut config = (*config_manager.get()).clone();
    if let Some(port) = args.admin_port {
        config.admin.port = port;
    }
    if let Some(ref url) = args.engine_url {
        config.engine.admin_url = url.clone();
    }
    if let Some(ref path) = args.state {
        config.store.state_path = Some(path.clone());
    }
    if let Some(ref level) = args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.format = "json".to_string();
    }

    init_logging(&config.logging.level, config.logging.format == "json")?;

    info!("Starting PQCrypta Control v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    config_manager.store(config)?;
    let config = config_manager.get();
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    let store: Arc<dyn Store> = match config.store.state_path {
        Some(ref path) => Arc::new(MemoryStore::open(path)?),
        None => {
            warn!("store.state_path not set; declared state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    let audit = Arc::new(AuditLogger::new(&config.logging));
    let engine = Arc::new(AdminApiEngine::new(&config.engine)?);
    let geo = resolver_from_config(&config.geo)?;

    let plane = Arc::new(ControlPlane::new(
        store,
        engine.clone(),
        geo,
        BackupWriter::new(&config.backup.dir),
        audit.clone(),
        ApplyPolicy::from(&config.engine),
    ));

    print_startup_summary(&config, engine.load_url(), &plane);

    if config.engine.reconcile_on_start && !args.no_reconcile {
        match plane.reconcile().await {
            Ok(outcome) => info!("Startup reconcile applied config {}", outcome.hash()),
            // The admin API stays up so the operator can fix the state
            Err(e) => error!("Startup reconcile failed: {}", e),
        }
    }

    spawn_reload_handler(config_manager.clone(), plane.clone());

    let admin = AdminServer::new(config.admin.clone(), plane, audit);
    admin.run(shutdown()).await?;

    info!("PQCrypta Control shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()?;
    }

    Ok(())
}

/// Resolves on Ctrl+C or an OS termination signal
async fn shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigquit) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) {
        (Ok(term), Ok(quit)) => (term, quit),
        _ => {
            warn!("Failed to install SIGTERM/SIGQUIT handlers; relying on Ctrl+C");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}

/// Re-read the config file on SIGHUP. Only the engine retry settings are live;
/// every other section is read once at startup.
#[cfg(unix)]
fn spawn_reload_handler(config_manager: Arc<ConfigManager>, plane: Arc<ControlPlane>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Failed to install SIGHUP handler, config reload disabled: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading configuration");
            if config_manager.reload().is_ok() {
                let config = config_manager.get();
                plane.set_apply_policy(ApplyPolicy::from(&config.engine));
                info!("Admin, store and logging changes take effect on restart");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_handler(_config_manager: Arc<ConfigManager>, _plane: Arc<ControlPlane>) {}

/// Print startup summary
fn print_startup_summary(config: &ControlConfig, engine_url: &str, plane: &ControlPlane) {
    let snapshot = plane.store().snapshot();
    info!("═══════════════════════════════════════════════════════════════");
    info!("  PQCrypta Control v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Admin API:        {}:{}", config.admin.bind_address, config.admin.port);
    info!("  Proxy engine:     {}", engine_url);
    info!("  Hosts:            {}", snapshot.hosts.len());
    info!("  Certificates:     {}", snapshot.certificates.len());
    info!("  Access policies:  {}", snapshot.access_policies.len());
    info!("  Rule sets:        {}", snapshot.security_rule_sets.len());
    info!(
        "  Last applied:     {}",
        plane
            .applier()
            .last_applied_hash()
            .unwrap_or_else(|| "never".to_string())
    );
    info!("═══════════════════════════════════════════════════════════════");
}
