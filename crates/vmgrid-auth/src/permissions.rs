//! Permission checks.
//!
//! A user holds a permission if any of these hold:
//! SUPERUSER or the permission is in their global set;
//! the target VM grants it to them directly;
//! a group they belong to grants it (or SUPERUSER) and covers the VM.

use vmgrid_core::{GridError, GridResult, Permission};
use vmgrid_state::ClusterConfig;

use crate::handshake::AuthContext;

/// Whether `user` holds `permission`, optionally on `vm_id`.
pub fn has_permission(
    config: &ClusterConfig,
    user: &str,
    permission: Permission,
    vm_id: Option<&str>,
) -> bool {
    let Some(cfg) = config.users.get(user) else {
        return false;
    };
    let grants = |p: &Permission| *p == permission || *p == Permission::Superuser;

    if cfg.global_permissions.iter().any(grants) {
        return true;
    }
    if let Some(vm) = vm_id.and_then(|id| config.virtual_machines.get(id))
        && vm.grants(user, permission)
    {
        return true;
    }
    config.groups.values().any(|group| {
        group.users.iter().any(|u| u == user)
            && group.permissions.iter().any(grants)
            && group.covers(vm_id)
    })
}

/// Fail with `InsufficientPrivileges` unless the caller holds `permission`.
///
/// Internal calls and node identities acting for themselves always pass.
pub fn check_permission(
    ctx: &AuthContext,
    config: &ClusterConfig,
    permission: Permission,
    vm_id: Option<&str>,
) -> GridResult<()> {
    if ctx.internal || ctx.is_node_identity() {
        return Ok(());
    }
    if has_permission(config, &ctx.effective_user, permission, vm_id) {
        return Ok(());
    }
    Err(GridError::insufficient_privileges(format!(
        "user '{}' does not hold {permission}",
        ctx.effective_user
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vmgrid_core::{ErrorKind, UserType};

    fn config() -> ClusterConfig {
        ClusterConfig::from_value(json!({
            "version": 22,
            "users": {
                "root": {"global_permissions": ["SUPERUSER"]},
                "netops": {"global_permissions": ["MANAGE_HOST_NETWORKS"]},
                "dev": {},
                "ops": {},
                "nobody": {}
            },
            "virtual_machines": {
                "vm-1": {"name": "a", "cpu_cores": 1, "memory_mib": 256,
                          "permissions": {"CHANGE_VM_POWER_STATE": ["dev"]}},
                "vm-2": {"name": "b", "cpu_cores": 1, "memory_mib": 256}
            },
            "groups": {
                "gp-1": {"name": "operators", "permissions": ["MIGRATE_VM"], "users": ["ops"], "vms": []},
                "gp-2": {"name": "scoped", "permissions": ["DELETE_VM"], "users": ["ops"], "vms": ["vm-2"]}
            }
        }))
        .unwrap()
    }

    fn ctx(user: &str) -> AuthContext {
        AuthContext {
            username: user.into(),
            user_type: UserType::Local,
            effective_user: user.into(),
            session: None,
            internal: false,
            lock_claim: false,
            task_id: None,
        }
    }

    #[test]
    fn closure_over_all_grant_paths() {
        let cfg = config();
        assert!(has_permission(&cfg, "root", Permission::ManageCluster, None));
        assert!(has_permission(&cfg, "netops", Permission::ManageHostNetworks, None));
        assert!(!has_permission(&cfg, "netops", Permission::ManageUsers, None));

        assert!(has_permission(&cfg, "dev", Permission::ChangeVmPowerState, Some("vm-1")));
        assert!(!has_permission(&cfg, "dev", Permission::ChangeVmPowerState, Some("vm-2")));

        assert!(has_permission(&cfg, "ops", Permission::MigrateVm, Some("vm-1")));
        assert!(has_permission(&cfg, "ops", Permission::DeleteVm, Some("vm-2")));
        assert!(!has_permission(&cfg, "ops", Permission::DeleteVm, Some("vm-1")));

        assert!(!has_permission(&cfg, "nobody", Permission::CreateVm, None));
        assert!(!has_permission(&cfg, "ghost", Permission::CreateVm, None));
    }

    #[test]
    fn check_maps_to_insufficient_privileges() {
        let cfg = config();
        let err = check_permission(&ctx("nobody"), &cfg, Permission::ManageUsers, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);
        assert!(check_permission(&ctx("root"), &cfg, Permission::ManageUsers, None).is_ok());
    }

    #[test]
    fn internal_and_node_identities_bypass() {
        let cfg = config();
        assert!(check_permission(&AuthContext::internal("alpha"), &cfg, Permission::Superuser, None).is_ok());

        let mut peer = ctx("vmgrid-peer-beta");
        peer.user_type = UserType::ClusterPeer;
        assert!(check_permission(&peer, &cfg, Permission::ManageCluster, None).is_ok());

        // Acting for a user, the peer only has that user's permissions.
        peer.effective_user = "nobody".into();
        assert!(check_permission(&peer, &cfg, Permission::ManageCluster, None).is_err());
    }
}
