//! vmgridd.toml daemon settings parser.
//!
//! These are node-local settings (paths, ports, timeouts). Cluster-wide
//! settings live in the replicated configuration document instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/vmgrid/vmgridd.toml";
pub const DEFAULT_PORT: u16 = 8089;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Root of all node-local state (`config.json`, `vm/`, `ssl/`, …).
    pub node_root: PathBuf,
    /// File holding the canonical node identity.
    pub hostname_file: PathBuf,
    /// Directory for the daemon singleton lock.
    pub lock_dir: PathBuf,
    /// Structured audit/log output. Logs go to stderr when unset.
    pub log_file: Option<PathBuf>,
    pub listen: ListenSettings,
    pub timeouts: TimeoutSettings,
    pub session_ttl_secs: u64,
    /// Entries retained in the in-memory audit ring.
    pub audit_capacity: usize,
    pub hypervisor: HypervisorMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_secs: u64,
    pub call_secs: u64,
}

/// Which hypervisor collaborator the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorMode {
    /// Shell out to virsh, lvm and drbdadm.
    #[default]
    Command,
    /// Record calls only; for development clusters without KVM.
    Null,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            node_root: PathBuf::from("/var/lib/vmgrid"),
            hostname_file: PathBuf::from("/etc/vmgrid/hostname.conf"),
            lock_dir: PathBuf::from("/var/run/vmgrid"),
            log_file: None,
            listen: ListenSettings::default(),
            timeouts: TimeoutSettings::default(),
            session_ttl_secs: 30 * 60,
            audit_capacity: 256,
            hypervisor: HypervisorMode::default(),
        }
    }
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            call_secs: 300,
        }
    }
}

impl DaemonSettings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: DaemonSettings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Settings rooted in a scratch directory.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            node_root: root.join("node"),
            hostname_file: root.join("hostname.conf"),
            lock_dir: root.join("run"),
            ..Self::default()
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn config_path(&self) -> PathBuf {
        self.node_root.join("config.json")
    }

    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.node_root.join("vm").join(vm_id)
    }

    pub fn iso_dir(&self) -> PathBuf {
        self.node_root.join("iso")
    }

    pub fn ssl_dir(&self) -> PathBuf {
        self.node_root.join("ssl")
    }

    pub fn stats_db_path(&self) -> PathBuf {
        self.node_root.join("stats.redb")
    }

    pub fn drbd_hook_config_path(&self) -> PathBuf {
        self.node_root.join("drbd-hook-config.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_dir.join("lock")
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.call_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_partial_file_fills_defaults() {
        let toml_str = r#"
node_root = "/srv/vmgrid"
hypervisor = "null"

[listen]
port = 9000
"#;
        let settings: DaemonSettings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.node_root, PathBuf::from("/srv/vmgrid"));
        assert_eq!(settings.listen.port, 9000);
        assert_eq!(settings.listen.address, "0.0.0.0");
        assert_eq!(settings.hypervisor, HypervisorMode::Null);
        assert_eq!(settings.config_path(), PathBuf::from("/srv/vmgrid/config.json"));
    }

    #[test]
    fn round_trips_through_toml() {
        let settings = DaemonSettings::rooted_at(Path::new("/tmp/x"));
        let text = settings.to_toml_string().unwrap();
        let back: DaemonSettings = toml::from_str(&text).unwrap();
        assert_eq!(back.lock_path(), PathBuf::from("/tmp/x/run/lock"));
        assert_eq!(back.session_ttl(), Duration::from_secs(1800));
    }
}
