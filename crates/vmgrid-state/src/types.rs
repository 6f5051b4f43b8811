//! Typed schema of the current configuration document version.
//!
//! Maps use `BTreeMap` so the serialized document is stable across
//! rewrites. Every section defaults when absent, so a freshly initialised
//! node only needs `version`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vmgrid_core::settings::DEFAULT_PORT;
use vmgrid_core::{GridError, GridResult, Permission, UserType};

use crate::migration::CURRENT_VERSION;

// ── Collection keys ────────────────────────────────────────────────

pub const VIRTUAL_MACHINES: &str = "virtual_machines";
pub const HARD_DRIVES: &str = "hard_drives";
pub const STORAGE_BACKENDS: &str = "storage_backends";
pub const NETWORKS: &str = "networks";
pub const USERS: &str = "users";
pub const GROUPS: &str = "groups";
pub const CLUSTER: &str = "cluster";
pub const NODES: &str = "nodes";
pub const PEER_CREDENTIALS: &str = "peer_credentials";
pub const DRBD: &str = "drbd";

// ── Document ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u32,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub virtual_machines: BTreeMap<String, VirtualMachineConfig>,
    #[serde(default)]
    pub hard_drives: BTreeMap<String, HardDriveConfig>,
    #[serde(default)]
    pub storage_backends: BTreeMap<String, StorageBackendConfig>,
    /// Network name → bridge interface.
    #[serde(default)]
    pub networks: BTreeMap<String, String>,
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
    #[serde(default)]
    pub drbd: DrbdConfig,
    /// Seconds between autostart polls. Zero disables polling.
    #[serde(default)]
    pub autostart_interval: u64,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl ClusterConfig {
    /// The document a node starts with before it joins or founds a cluster.
    pub fn initial(node: &str, ip: &str, port: u16) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            node.to_string(),
            NodeEntry {
                ip: ip.to_string(),
                port,
                fingerprint: String::new(),
            },
        );
        Self {
            version: CURRENT_VERSION,
            revision: 0,
            cluster: ClusterSection {
                cluster_ip: None,
                nodes,
                peer_credentials: BTreeMap::new(),
            },
            virtual_machines: BTreeMap::new(),
            hard_drives: BTreeMap::new(),
            storage_backends: BTreeMap::new(),
            networks: BTreeMap::new(),
            users: BTreeMap::new(),
            groups: BTreeMap::new(),
            drbd: DrbdConfig::default(),
            autostart_interval: 0,
            statistics: StatisticsConfig::default(),
            log_level: None,
        }
    }

    pub fn from_value(value: Value) -> GridResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| GridError::bug(format!("configuration does not match schema: {e}")))
    }

    pub fn to_value(&self) -> GridResult<Value> {
        serde_json::to_value(self).map_err(|e| GridError::bug(e.to_string()))
    }

    /// Find an entity id by its `name` attribute.
    pub fn vm_by_name(&self, name: &str) -> Option<(&String, &VirtualMachineConfig)> {
        self.virtual_machines.iter().find(|(_, vm)| vm.name == name)
    }

    pub fn group_by_name(&self, name: &str) -> Option<(&String, &GroupConfig)> {
        self.groups.iter().find(|(_, g)| g.name == name)
    }

    pub fn backend_by_name(&self, name: &str) -> Option<(&String, &StorageBackendConfig)> {
        self.storage_backends.iter().find(|(_, b)| b.name == name)
    }

    /// Cluster node names, sorted.
    pub fn node_names(&self) -> Vec<String> {
        self.cluster.nodes.keys().cloned().collect()
    }
}

// ── Cluster ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeEntry>,
    /// Credentials this node presents when calling each peer. Node-local.
    #[serde(default)]
    pub peer_credentials: BTreeMap<String, PeerCredential>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hex SHA-256 of the node's CA certificate (DER).
    #[serde(default)]
    pub fingerprint: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerCredential {
    pub username: String,
    pub password: String,
}

// ── Virtual machines ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    #[default]
    Unlocked,
    Locked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutostartPolicy {
    #[default]
    None,
    OnBoot,
    OnPoll,
}

impl AutostartPolicy {
    /// Whether a VM with this policy starts during a sweep of `trigger`.
    ///
    /// Boot sweeps start every autostart VM; poll sweeps only ON_POLL ones.
    pub fn applies_to(&self, trigger: AutostartPolicy) -> bool {
        match trigger {
            AutostartPolicy::None => false,
            AutostartPolicy::OnBoot => *self != AutostartPolicy::None,
            AutostartPolicy::OnPoll => *self == AutostartPolicy::OnPoll,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub reset_fail_count: u32,
    pub boot_wait_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30,
            reset_fail_count: 3,
            boot_wait_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineConfig {
    pub name: String,
    #[serde(default)]
    pub available_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    pub cpu_cores: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub lock: LockState,
    #[serde(default)]
    pub autostart: AutostartPolicy,
    /// Attachment index → hard drive id.
    #[serde(default)]
    pub hard_drives: BTreeMap<String, String>,
    /// MAC address → network name.
    #[serde(default)]
    pub network_interfaces: BTreeMap<String, String>,
    /// Permission name → users granted it on this VM.
    #[serde(default)]
    pub permissions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

impl VirtualMachineConfig {
    pub fn grants(&self, user: &str, permission: Permission) -> bool {
        self.permissions
            .get(permission.as_str())
            .is_some_and(|users| users.iter().any(|u| u == user))
    }

    /// Hard drive ids in attachment order.
    pub fn drive_ids(&self) -> Vec<String> {
        let mut drives: Vec<(u32, &String)> = self
            .hard_drives
            .iter()
            .map(|(idx, id)| (idx.parse().unwrap_or(u32::MAX), id))
            .collect();
        drives.sort();
        drives.into_iter().map(|(_, id)| id.clone()).collect()
    }
}

// ── Storage ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HardDriveType {
    #[default]
    Local,
    Replicated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    #[default]
    InSync,
    OutOfSync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub minor: u32,
    pub port: u16,
    #[serde(default)]
    pub sync_state: SyncState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardDriveConfig {
    pub backend: String,
    #[serde(rename = "type", default)]
    pub drive_type: HardDriveType,
    pub base_volume: String,
    pub size_mib: u64,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Lvm,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageBackendConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub storage_type: StorageType,
    pub location: String,
    #[serde(default)]
    pub node_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub shared: bool,
}

impl StorageBackendConfig {
    /// The location to use on `node`, honouring per-node overrides.
    pub fn location_for(&self, node: &str) -> &str {
        self.node_overrides
            .get(node)
            .map(String::as_str)
            .unwrap_or(&self.location)
    }
}

// ── Users and groups ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub user_type: UserType,
    /// Hex PBKDF2 output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Hex salt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default)]
    pub global_permissions: Vec<Permission>,
    /// For cluster-peer users, the node this identity belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub users: Vec<String>,
    /// VM ids the group applies to. Empty means every VM.
    #[serde(default)]
    pub vms: Vec<String>,
}

impl GroupConfig {
    pub fn covers(&self, vm_id: Option<&str>) -> bool {
        match vm_id {
            _ if self.vms.is_empty() => true,
            Some(id) => self.vms.iter().any(|v| v == id),
            None => false,
        }
    }
}

// ── Misc sections ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrbdConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "default_sync_rate")]
    pub sync_rate: String,
}

fn default_sync_rate() -> String {
    "10M".to_string()
}

impl Default for DrbdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            sync_rate: default_sync_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Seconds between host samples. Zero disables sampling.
    #[serde(default)]
    pub interval: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self { interval: 60 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_document_decodes_with_defaults() {
        let cfg = ClusterConfig::from_value(json!({"version": 22})).unwrap();
        assert!(cfg.virtual_machines.is_empty());
        assert_eq!(cfg.drbd.sync_rate, "10M");
        assert_eq!(cfg.statistics.interval, 60);
    }

    #[test]
    fn initial_round_trips() {
        let cfg = ClusterConfig::initial("alpha", "10.0.0.1", 8089);
        let back = ClusterConfig::from_value(cfg.to_value().unwrap()).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.node_names(), vec!["alpha".to_string()]);
    }

    #[test]
    fn autostart_sweeps() {
        assert!(AutostartPolicy::OnBoot.applies_to(AutostartPolicy::OnBoot));
        assert!(AutostartPolicy::OnPoll.applies_to(AutostartPolicy::OnBoot));
        assert!(!AutostartPolicy::OnBoot.applies_to(AutostartPolicy::OnPoll));
        assert!(!AutostartPolicy::None.applies_to(AutostartPolicy::OnBoot));
    }

    #[test]
    fn drive_ids_follow_attachment_index() {
        let vm: VirtualMachineConfig = serde_json::from_value(json!({
            "name": "web",
            "cpu_cores": 1,
            "memory_mib": 512,
            "hard_drives": {"10": "hd-b", "2": "hd-a"}
        }))
        .unwrap();
        assert_eq!(vm.drive_ids(), vec!["hd-a".to_string(), "hd-b".to_string()]);
    }

    #[test]
    fn storage_override_wins() {
        let mut backend = StorageBackendConfig {
            name: "default".into(),
            storage_type: StorageType::Lvm,
            location: "vg0".into(),
            node_overrides: BTreeMap::new(),
            shared: false,
        };
        assert_eq!(backend.location_for("beta"), "vg0");
        backend.node_overrides.insert("beta".into(), "vg_beta".into());
        assert_eq!(backend.location_for("beta"), "vg_beta");
    }

    #[test]
    fn group_with_empty_vm_list_covers_everything() {
        let group = GroupConfig {
            name: "ops".into(),
            permissions: vec![Permission::ChangeVmPowerState],
            users: vec!["alice".into()],
            vms: vec![],
        };
        assert!(group.covers(Some("vm-1")));
        assert!(group.covers(None));

        let scoped = GroupConfig {
            vms: vec!["vm-1".into()],
            ..group
        };
        assert!(scoped.covers(Some("vm-1")));
        assert!(!scoped.covers(Some("vm-2")));
        assert!(!scoped.covers(None));
    }
}
