//! Permissions and user types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GridError};

/// The closed set of permissions. Serialized in SCREAMING_SNAKE_CASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ChangeVmPowerState,
    CreateVm,
    ModifyVm,
    DeleteVm,
    MigrateVm,
    SetVmLock,
    ManageUsers,
    ManageGroups,
    ManageHostNetworks,
    ManageStorage,
    ManageCluster,
    ManageDrbd,
    CanIgnoreCluster,
    Superuser,
}

impl Permission {
    pub const ALL: [Permission; 14] = [
        Self::ChangeVmPowerState,
        Self::CreateVm,
        Self::ModifyVm,
        Self::DeleteVm,
        Self::MigrateVm,
        Self::SetVmLock,
        Self::ManageUsers,
        Self::ManageGroups,
        Self::ManageHostNetworks,
        Self::ManageStorage,
        Self::ManageCluster,
        Self::ManageDrbd,
        Self::CanIgnoreCluster,
        Self::Superuser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChangeVmPowerState => "CHANGE_VM_POWER_STATE",
            Self::CreateVm => "CREATE_VM",
            Self::ModifyVm => "MODIFY_VM",
            Self::DeleteVm => "DELETE_VM",
            Self::MigrateVm => "MIGRATE_VM",
            Self::SetVmLock => "SET_VM_LOCK",
            Self::ManageUsers => "MANAGE_USERS",
            Self::ManageGroups => "MANAGE_GROUPS",
            Self::ManageHostNetworks => "MANAGE_HOST_NETWORKS",
            Self::ManageStorage => "MANAGE_STORAGE",
            Self::ManageCluster => "MANAGE_CLUSTER",
            Self::ManageDrbd => "MANAGE_DRBD",
            Self::CanIgnoreCluster => "CAN_IGNORE_CLUSTER",
            Self::Superuser => "SUPERUSER",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                GridError::new(ErrorKind::InvalidPermission, format!("unknown permission '{s}'"))
            })
    }
}

/// How a user authenticates, and what it may assert on behalf of others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
    #[default]
    Local,
    Ldap,
    ClusterPeer,
    Bootstrap,
}

impl UserType {
    /// Only node-to-node identities may act on behalf of another user.
    pub fn can_proxy(&self) -> bool {
        matches!(self, Self::ClusterPeer | Self::Bootstrap)
    }

    /// Node-local identities are never replicated to other nodes.
    pub fn is_node_local(&self) -> bool {
        matches!(self, Self::ClusterPeer | Self::Bootstrap)
    }
}
