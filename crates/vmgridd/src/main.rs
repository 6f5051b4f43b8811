//! vmgridd — the VMGrid node daemon.
//!
//! Assembles one cluster node:
//! - node identity and the singleton lock
//! - configuration document (created, or migrated to the current version)
//! - TLS material, transport and the RPC server
//! - hypervisor and host statistics collaborators
//! - autostart, host statistics, session purge and watchdog timers
//!
//! # Usage
//!
//! ```text
//! vmgridd init --admin-user admin --admin-password …
//! vmgridd run --config /etc/vmgrid/vmgridd.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use vmgrid_api::{CommandHypervisor, ProcStatsSource};
use vmgrid_cluster::{RpcServer, TlsTransport};
use vmgrid_core::hypervisor::{Hypervisor, NullHypervisor};
use vmgrid_core::settings::{DEFAULT_SETTINGS_PATH, HypervisorMode};
use vmgrid_core::{DaemonSettings, NodeIdentity};
use vmgrid_health::{VirshAgentPinger, WatchdogMonitor, run_autostart, run_host_stats, run_session_purge};
use vmgrid_state::HostStatsStore;
use vmgrid_state::lockfile::FileLock;
use vmgridd::{Parts, assemble, certificates, logging, open_configuration, run_hook_provisioning, seed_admin};

/// How often the watchdog reconciles its loops with the running VMs.
const WATCHDOG_SYNC: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "vmgridd", about = "VMGrid node daemon")]
struct Cli {
    /// Daemon settings file.
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve this node until interrupted.
    Run,
    /// Prepare a fresh node: settings, identity, configuration, certificates.
    Init {
        /// Create a LOCAL superuser with this name.
        #[arg(long)]
        admin_user: Option<String>,

        #[arg(long, requires = "admin_user")]
        admin_password: Option<String>,

        /// Override the listen port written to new settings.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run => run(&cli.config).await,
        Command::Init {
            admin_user,
            admin_password,
            port,
        } => init(&cli.config, admin_user, admin_password, port),
    }
}

fn load_settings(path: &Path) -> anyhow::Result<DaemonSettings> {
    if path.exists() {
        DaemonSettings::from_file(path).with_context(|| format!("read settings {}", path.display()))
    } else {
        Ok(DaemonSettings::default())
    }
}

fn identity(settings: &DaemonSettings) -> anyhow::Result<NodeIdentity> {
    let hostname = vmgridd::socket_hostname()?;
    Ok(NodeIdentity::load_or_init(&settings.hostname_file, &hostname)?)
}

fn init(
    config: &Path,
    admin_user: Option<String>,
    admin_password: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    logging::init(&DaemonSettings::default())?;

    let mut settings = load_settings(config)?;
    if !config.exists() {
        if let Some(port) = port {
            settings.listen.port = port;
        }
        if let Some(parent) = config.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config, settings.to_toml_string()?)?;
        info!(path = %config.display(), "settings written");
    }

    let _lock = FileLock::try_exclusive(&settings.lock_path())
        .with_context(|| format!("another vmgridd holds {}", settings.lock_path().display()))?;
    let node = identity(&settings)?;
    let document = open_configuration(&settings, &node)?;
    certificates(&settings, &node)?;

    if let Some(user) = admin_user {
        let password = admin_password.context("--admin-password is required with --admin-user")?;
        seed_admin(&document, &user, &password)?;
    }
    info!(node = node.as_str(), root = %settings.node_root.display(), "node initialised");
    Ok(())
}

async fn run(config: &Path) -> anyhow::Result<()> {
    let settings = load_settings(config)?;
    logging::init(&settings)?;
    if !config.exists() {
        warn!(path = %config.display(), "settings file missing, using defaults");
    }
    info!("VMGrid daemon starting");

    let _lock = FileLock::try_exclusive(&settings.lock_path())
        .with_context(|| format!("another vmgridd holds {}", settings.lock_path().display()))?;
    info!(path = %settings.lock_path().display(), "daemon lock acquired");

    // ── Node state ─────────────────────────────────────────────

    let node = identity(&settings)?;
    let document = open_configuration(&settings, &node)?;
    let certs = certificates(&settings, &node)?;

    // ── Collaborators ──────────────────────────────────────────

    let transport = Arc::new(TlsTransport::new(
        Arc::clone(&certs),
        settings.connect_timeout(),
        settings.call_timeout(),
    ));
    let hypervisor: Arc<dyn Hypervisor> = match settings.hypervisor {
        HypervisorMode::Command => Arc::new(CommandHypervisor::new(settings.clone(), node.clone())),
        HypervisorMode::Null => {
            warn!("null hypervisor selected, no VM will actually run");
            Arc::new(NullHypervisor::new())
        }
    };
    let host_stats = HostStatsStore::open(&settings.stats_db_path())?;
    info!(path = %settings.stats_db_path().display(), "host statistics store opened");

    let listen = format!("{}:{}", settings.listen.address, settings.listen.port);
    let dispatcher = assemble(
        settings,
        &node,
        document,
        Parts {
            certs: Arc::clone(&certs),
            transport,
            hypervisor,
            host_stats,
            stats_source: Arc::new(ProcStatsSource::new()),
        },
    )?;
    let env = Arc::clone(dispatcher.env());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_autostart(Arc::clone(&dispatcher), shutdown_rx.clone())));
    tasks.push(tokio::spawn(run_host_stats(Arc::clone(&dispatcher), shutdown_rx.clone())));
    tasks.push(tokio::spawn(run_session_purge(Arc::clone(&env), shutdown_rx.clone())));
    tasks.push(tokio::spawn(run_hook_provisioning(Arc::clone(&dispatcher), shutdown_rx.clone())));
    let watchdog = Arc::new(WatchdogMonitor::new(Arc::clone(&env), Arc::new(VirshAgentPinger)));
    tasks.push(tokio::spawn(Arc::clone(&watchdog).run(WATCHDOG_SYNC, shutdown_rx.clone())));

    // ── RPC server ─────────────────────────────────────────────

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    let server = RpcServer::new(certs, dispatcher);
    let server_handle = tokio::spawn(server.serve(listener, shutdown_rx));
    info!(node = node.as_str(), %listen, "node ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    match server_handle.await {
        Ok(Err(e)) => warn!(error = %e, "rpc server stopped with an error"),
        Err(e) => warn!(error = %e, "rpc server task failed"),
        Ok(Ok(())) => {}
    }
    for task in tasks {
        let _ = task.await;
    }
    watchdog.stop_all().await;

    info!("VMGrid daemon stopped");
    Ok(())
}
