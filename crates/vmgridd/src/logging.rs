//! Tracing set-up.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing_subscriber::EnvFilter;
use vmgrid_core::DaemonSettings;

pub const DEFAULT_FILTER: &str = "info,vmgridd=debug,vmgrid=debug";

/// `log_level` from the cluster configuration, read before the document is
/// opened so the migration itself is logged at the configured level.
pub fn configured_level(config_path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(config_path).ok()?;
    let doc: Value = serde_json::from_str(&content).ok()?;
    doc.get("log_level")?.as_str().map(str::to_string)
}

/// `RUST_LOG` wins over the configured level, which wins over the default.
pub fn filter(level: Option<&str>) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::try_new(level.unwrap_or(DEFAULT_FILTER))?)
}

/// Human-readable lines on stderr, or JSON lines appended to
/// `log_file` when one is configured.
pub fn init(settings: &DaemonSettings) -> anyhow::Result<()> {
    let filter = filter(configured_level(&settings.config_path()).as_deref())?;
    let installed = match &settings.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}
