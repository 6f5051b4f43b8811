//! vmgrid-api — the objects a VMGrid node exposes.
//!
//! # Objects
//!
//! | Name | Type | Responsibility |
//! |---|---|---|
//! | `cluster` | [`ClusterService`] | connect strings, add/remove node, CA and peer-user plumbing |
//! | `task_scheduler` | [`TaskService`] | cancel the running task, audit log |
//! | `session` | `vmgrid_rpc::session_service::SessionService` | login, logout, whoami |
//! | `user_manager` | [`UserManager`] | users, passwords, global permissions |
//! | `group_manager` | [`GroupManager`] | groups and their members |
//! | `network_factory` | [`NetworkFactory`] | network name → bridge interface |
//! | `storage_backend_factory` | [`StorageBackendFactory`] | LVM / file backends |
//! | `hard_drive_factory` | [`HardDriveFactory`] | local and replicated volumes |
//! | `virtual_machine_factory` | [`VirtualMachineFactory`] | VM creation, autostart sweeps |
//! | `vm-…` | [`VirtualMachine`] | one object per VM: power, lock, rename, migrate |
//! | `drbd` | [`DrbdService`] | replication settings |
//! | `host_statistics` | [`HostStatistics`] | CPU/memory samples |
//!
//! Every state change is declared as a fan-out: it runs on the originating
//! node under the cluster lock, is replayed on each peer, and is reverted
//! through its undo method when a peer fails. Reverting usually means
//! reinstalling the entity as it was before the call; `prepare` captures
//! that copy on the originator under the `key` and `entity` keywords.

pub mod cluster;
pub mod command;
pub mod drbd;
pub mod groups;
pub mod join;
pub mod networks;
pub mod stats;
pub mod storage;
pub mod tasks;
pub mod users;
pub mod vms;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use vmgrid_core::{ErrorKind, GridError, GridResult, UserType};
use vmgrid_rpc::session_service::SESSION_SERVICE;
use vmgrid_rpc::{CallArgs, CallContext, Environment};

pub use cluster::ClusterService;
pub use command::CommandHypervisor;
pub use drbd::DrbdService;
pub use groups::GroupManager;
pub use networks::NetworkFactory;
pub use stats::{HostStatistics, HostStatsSource, ProcStatsSource};
pub use storage::{HardDriveFactory, StorageBackendFactory};
pub use tasks::TaskService;
pub use users::UserManager;
pub use vms::{VirtualMachine, VirtualMachineFactory};

// ── Object names ───────────────────────────────────────────────────

pub const CLUSTER: &str = "cluster";
pub const TASK_SCHEDULER: &str = "task_scheduler";
pub const SESSION: &str = SESSION_SERVICE;
pub const USER_MANAGER: &str = "user_manager";
pub const GROUP_MANAGER: &str = "group_manager";
pub const NETWORK_FACTORY: &str = "network_factory";
pub const STORAGE_BACKEND_FACTORY: &str = "storage_backend_factory";
pub const HARD_DRIVE_FACTORY: &str = "hard_drive_factory";
pub const VIRTUAL_MACHINE_FACTORY: &str = "virtual_machine_factory";
pub const DRBD: &str = "drbd";
pub const HOST_STATISTICS: &str = "host_statistics";

/// Register every service object, plus one object per configured VM.
pub fn register_services(env: &Environment, stats_source: Arc<dyn HostStatsSource>) -> GridResult<()> {
    let registry = env.registry();
    registry.register(CLUSTER, Arc::new(ClusterService));
    registry.register(TASK_SCHEDULER, Arc::new(TaskService));
    registry.register(USER_MANAGER, Arc::new(UserManager));
    registry.register(GROUP_MANAGER, Arc::new(GroupManager));
    registry.register(NETWORK_FACTORY, Arc::new(NetworkFactory));
    registry.register(STORAGE_BACKEND_FACTORY, Arc::new(StorageBackendFactory));
    registry.register(HARD_DRIVE_FACTORY, Arc::new(HardDriveFactory));
    registry.register(VIRTUAL_MACHINE_FACTORY, Arc::new(VirtualMachineFactory));
    registry.register(DRBD, Arc::new(DrbdService));
    registry.register(HOST_STATISTICS, Arc::new(HostStatistics::new(stats_source)));
    for id in env.config()?.virtual_machines.keys() {
        registry.register(id, Arc::new(VirtualMachine::new(id)));
    }
    Ok(())
}

// ── Captured entities ──────────────────────────────────────────────

pub(crate) const KEY: &str = "key";
pub(crate) const ENTITY: &str = "entity";

/// Record `entity` as it is now, so an undo can reinstall it.
pub(crate) fn capture<T: Serialize>(args: &mut CallArgs, key: &str, entity: &T) -> GridResult<()> {
    args.set(KEY, key);
    args.set(ENTITY, serde_json::to_value(entity)?);
    Ok(())
}

/// The `(key, entity)` pair of a `*_from_user_config` call or an undo.
pub(crate) fn captured<T: DeserializeOwned>(args: &CallArgs) -> GridResult<(String, T)> {
    Ok((args.get(0, KEY)?, args.get(1, ENTITY)?))
}

/// Who may drive node-local plumbing:
/// - this node's own task
/// - the lock holder's peer identity, replaying its task here
/// - a cluster adopting this node through its bootstrap user
pub(crate) fn require_lock_holder(ctx: &CallContext) -> GridResult<()> {
    let auth = ctx.auth();
    let own_task = ctx.task().is_some() && !auth.lock_claim;
    let holder_replay = auth.lock_claim && auth.user_type == UserType::ClusterPeer;
    let adopting = auth.user_type == UserType::Bootstrap && auth.is_node_identity();
    if auth.internal || own_task || holder_replay || adopting {
        return Ok(());
    }
    Err(GridError::new(
        ErrorKind::LockContended,
        "only the cluster lock holder may change node membership",
    ))
}
