//! vmgrid-drbd-hook — DRBD resync handler.
//!
//! ```text
//! DRBD_RESOURCE=<drive id> vmgrid-drbd-hook <0|1>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use vmgrid_cluster::{CertificateStore, Endpoint, Target, TlsTransport};
use vmgrid_core::settings::DEFAULT_SETTINGS_PATH;
use vmgrid_core::{DaemonSettings, NodeIdentity};
use vmgridd::hook::{HookConfig, report_sync_state, sync_state_from_arg};

#[derive(Parser)]
#[command(name = "vmgrid-drbd-hook", about = "Record a replicated drive's sync state")]
struct Cli {
    /// `1` after a resync finished, `0` when one starts.
    state: String,

    /// Daemon settings file.
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    /// The drive id, normally set by DRBD.
    #[arg(long)]
    resource: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(vmgridd::logging::filter(None)?)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let state = sync_state_from_arg(&cli.state)?;
    let resource = match cli.resource {
        Some(resource) => resource,
        None => std::env::var("DRBD_RESOURCE").context("DRBD_RESOURCE is not set")?,
    };

    let settings = if cli.config.exists() {
        DaemonSettings::from_file(&cli.config)?
    } else {
        DaemonSettings::default()
    };
    let hook_path = settings.drbd_hook_config_path();
    let hook = HookConfig::load(&hook_path).with_context(|| format!("read {}", hook_path.display()))?;

    // The daemon's certificate names the node, not the loopback address.
    let stored = std::fs::read_to_string(&settings.hostname_file)
        .with_context(|| format!("read {}", settings.hostname_file.display()))?;
    let node = NodeIdentity::new(stored.trim())?;

    let certs = Arc::new(CertificateStore::new(&settings.ssl_dir(), node.as_str()));
    let transport = TlsTransport::new(certs, settings.connect_timeout(), settings.call_timeout());
    let target = Target::new(Endpoint::new(node.as_str(), &hook.host, hook.port));

    report_sync_state(&transport, &target, &hook, &resource, state).await?;
    Ok(())
}
