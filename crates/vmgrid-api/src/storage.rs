//! Storage: the `storage_backend_factory` and `hard_drive_factory` objects.
//!
//! A backend names a volume group (or directory) that may differ per node.
//! A hard drive is one volume on one node (LOCAL) or a DRBD-replicated
//! pair of volumes (REPLICATED). Drive definitions are replicated to every
//! node; the volumes only exist on the drive's own nodes.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::{info, warn};
use vmgrid_core::hypervisor::{ReplicationSpec, VolumeSpec};
use vmgrid_core::id::{IdKind, generate_id, validate_id};
use vmgrid_core::validate::{validate_entity_name, validate_volume_group_name};
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult, Permission};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, MethodSpec, RpcObject};
use vmgrid_state::{
    ClusterConfig, HardDriveConfig, HardDriveType, ReplicationConfig, StorageBackendConfig, StorageType, SyncState,
};

use crate::{KEY, capture, captured};

/// First TCP port used for DRBD resources; minor `n` listens on `BASE + n`.
const DRBD_BASE_PORT: u16 = 7789;

// ── Helpers ────────────────────────────────────────────────────────

/// The volume backing drive `id` on `node`.
pub fn volume_spec(config: &ClusterConfig, id: &str, node: &str) -> GridResult<VolumeSpec> {
    let drive = config
        .hard_drives
        .get(id)
        .ok_or_else(|| GridError::not_found(format!("hard drive {id} does not exist")))?;
    let backend = config
        .storage_backends
        .get(&drive.backend)
        .ok_or_else(|| GridError::bug(format!("hard drive {id} refers to missing backend {}", drive.backend)))?;
    let replication = drive.replication.as_ref().map(|r| ReplicationSpec {
        resource: id.to_string(),
        minor: r.minor,
        port: r.port,
        peers: drive.nodes.iter().filter(|n| *n != node).cloned().collect(),
    });
    Ok(VolumeSpec {
        id: id.to_string(),
        location: backend.location_for(node).to_string(),
        name: drive.base_volume.clone(),
        size_mib: drive.size_mib,
        replication,
    })
}

/// The VM a drive is attached to, if any.
pub fn attached_to<'c>(config: &'c ClusterConfig, drive_id: &str) -> Option<&'c str> {
    config
        .virtual_machines
        .values()
        .find(|vm| vm.hard_drives.values().any(|d| d == drive_id))
        .map(|vm| vm.name.as_str())
}

fn next_minor(config: &ClusterConfig) -> u32 {
    config
        .hard_drives
        .values()
        .filter_map(|d| d.replication.as_ref().map(|r| r.minor))
        .max()
        .map_or(1, |m| m + 1)
}

fn backend_id(config: &ClusterConfig, name: &str) -> GridResult<String> {
    config
        .backend_by_name(name)
        .map(|(id, _)| id.clone())
        .ok_or_else(|| GridError::not_found(format!("storage backend '{name}' does not exist")))
}

// ── storage_backend_factory ────────────────────────────────────────

const BACKEND_METHODS: &[MethodSpec] = &[
    MethodSpec::read("list"),
    MethodSpec::fan_out("create", Some("remove_backend_config")).requires(Permission::ManageStorage),
    MethodSpec::fan_out("delete", Some("backend_from_user_config")).requires(Permission::ManageStorage),
    MethodSpec::fan_out("set_node_override", Some("backend_from_user_config")).requires(Permission::ManageStorage),
    MethodSpec::fan_out("backend_from_user_config", Some("remove_backend_config")).requires(Permission::ManageCluster),
    MethodSpec::fan_out("remove_backend_config", None).requires(Permission::ManageCluster),
];

pub struct StorageBackendFactory;

impl RpcObject for StorageBackendFactory {
    fn type_name(&self) -> &'static str {
        "StorageBackendFactory"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        BACKEND_METHODS
    }

    fn prepare<'a>(&'a self, ctx: &'a CallContext, method: &'a str, mut args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move {
            let config = ctx.config()?;
            match method {
                "create" => {
                    let name: String = args.get(0, "name")?;
                    validate_entity_name(&name)?;
                    if config.backend_by_name(&name).is_some() {
                        return Err(GridError::already_exists(format!("storage backend '{name}' already exists")));
                    }
                    let storage_type: StorageType = args.opt(1, "storage_type")?.unwrap_or_default();
                    let location: String = args.get(2, "location")?;
                    let node_overrides: BTreeMap<String, String> = args.opt(4, "node_overrides")?.unwrap_or_default();
                    if storage_type == StorageType::Lvm {
                        validate_volume_group_name(&location)?;
                        for vg in node_overrides.values() {
                            validate_volume_group_name(vg)?;
                        }
                    }
                    let backend = StorageBackendConfig {
                        name: name.clone(),
                        storage_type,
                        location,
                        node_overrides,
                        shared: args.opt(3, "shared")?.unwrap_or(false),
                    };
                    capture(&mut args, &generate_id(IdKind::StorageBackend, &name), &backend)?;
                }
                "delete" | "set_node_override" => {
                    let name: String = args.get(0, "name")?;
                    let id = backend_id(&config, &name)?;
                    if method == "delete"
                        && let Some((drive, _)) = config.hard_drives.iter().find(|(_, d)| d.backend == id)
                    {
                        return Err(GridError::invalid_argument(format!(
                            "storage backend '{name}' is used by hard drive {drive}"
                        )));
                    }
                    if method == "set_node_override" {
                        let location: String = args.get(2, "location")?;
                        if config.storage_backends[&id].storage_type == StorageType::Lvm {
                            validate_volume_group_name(&location)?;
                        }
                    }
                    capture(&mut args, &id, &config.storage_backends[&id])?;
                }
                _ => {}
            }
            Ok(args)
        })
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "list" => Ok(serde_json::to_value(ctx.config()?.storage_backends)?),
                "create" | "backend_from_user_config" => {
                    let (id, backend): (String, StorageBackendConfig) = captured(&args)?;
                    let name = backend.name.clone();
                    ctx.env().update_config(&format!("install storage backend {name}"), |cfg| {
                        if method == "create" && cfg.backend_by_name(&name).is_some() {
                            return Err(GridError::already_exists(format!("storage backend '{name}' already exists")));
                        }
                        cfg.storage_backends.insert(id.clone(), backend);
                        Ok(())
                    })?;
                    info!(backend = %name, %id, "storage backend installed");
                    Ok(json!(id))
                }
                "delete" | "remove_backend_config" => {
                    let id: String = args.get(0, KEY)?;
                    ctx.env().update_config(&format!("remove storage backend {id}"), |cfg| {
                        cfg.storage_backends.remove(&id);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "set_node_override" => {
                    let id: String = args.required_keyword(KEY)?;
                    let node: String = args.get(1, "node")?;
                    let location: String = args.get(2, "location")?;
                    ctx.env().update_config(&format!("override storage backend {id} on {node}"), |cfg| {
                        if let Some(backend) = cfg.storage_backends.get_mut(&id) {
                            backend.node_overrides.insert(node.clone(), location.clone());
                        }
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}

// ── hard_drive_factory ─────────────────────────────────────────────

const DRIVE_METHODS: &[MethodSpec] = &[
    MethodSpec::read("list"),
    MethodSpec::fan_out("create", Some("delete")).requires(Permission::ManageStorage),
    MethodSpec::fan_out("delete", None).requires(Permission::ManageStorage),
    MethodSpec::fan_out("set_sync_state", Some("drive_from_user_config")).requires(Permission::ManageDrbd),
    MethodSpec::fan_out("drive_from_user_config", Some("remove_drive_config")).requires(Permission::ManageCluster),
    MethodSpec::fan_out("remove_drive_config", None).requires(Permission::ManageCluster),
];

pub struct HardDriveFactory;

impl HardDriveFactory {
    fn plan(ctx: &CallContext, config: &ClusterConfig, args: &CallArgs) -> GridResult<HardDriveConfig> {
        let backend = backend_id(config, &args.get::<String>(0, "backend")?)?;
        let size_mib: u64 = args.get(1, "size_mib")?;
        if size_mib == 0 {
            return Err(GridError::invalid_argument("hard drive size must be positive"));
        }
        let drive_type: HardDriveType = args.opt(2, "drive_type")?.unwrap_or_default();
        let members = config.node_names();
        let nodes: Vec<String> = match args.opt(3, "drive_nodes")? {
            Some(nodes) => nodes,
            None if drive_type == HardDriveType::Replicated => {
                let mut nodes = vec![ctx.node().to_string()];
                nodes.extend(members.iter().find(|n| *n != ctx.node()).cloned());
                nodes
            }
            None if config.storage_backends[&backend].shared => members.clone(),
            None => vec![ctx.node().to_string()],
        };
        if let Some(unknown) = nodes.iter().find(|n| !members.contains(n)) {
            return Err(GridError::invalid_argument(format!("'{unknown}' is not a cluster member")));
        }

        let replication = match drive_type {
            HardDriveType::Local => None,
            HardDriveType::Replicated => {
                if !config.drbd.enabled {
                    return Err(GridError::invalid_argument("DRBD is not enabled on this cluster"));
                }
                if nodes.len() != 2 {
                    return Err(GridError::invalid_argument("replicated drives need exactly two nodes"));
                }
                let minor = next_minor(config);
                let offset = u16::try_from(minor)
                    .map_err(|_| GridError::invalid_argument("no free DRBD minor"))?;
                Some(ReplicationConfig {
                    minor,
                    port: DRBD_BASE_PORT.saturating_add(offset),
                    sync_state: SyncState::InSync,
                })
            }
        };
        Ok(HardDriveConfig {
            backend,
            drive_type,
            base_volume: String::new(),
            size_mib,
            nodes,
            replication,
        })
    }

    async fn create(ctx: &CallContext, id: &str, drive: HardDriveConfig) -> GridResult<()> {
        let on_this_node = drive.nodes.iter().any(|n| n == ctx.node());
        ctx.env().update_config(&format!("create hard drive {id}"), |cfg| {
            if cfg.hard_drives.contains_key(id) {
                return Err(GridError::already_exists(format!("hard drive {id} already exists")));
            }
            cfg.hard_drives.insert(id.to_string(), drive);
            Ok(())
        })?;
        if on_this_node {
            let spec = volume_spec(&ctx.config()?, id, ctx.node())?;
            if let Err(e) = ctx.env().hypervisor().create_volume(&spec).await {
                ctx.env().update_config(&format!("forget hard drive {id}"), |cfg| {
                    cfg.hard_drives.remove(id);
                    Ok(())
                })?;
                return Err(e);
            }
        }
        info!(drive = %id, local = on_this_node, "hard drive created");
        Ok(())
    }

    async fn delete(ctx: &CallContext, id: &str) -> GridResult<()> {
        let config = ctx.config()?;
        let Some(drive) = config.hard_drives.get(id) else {
            return Ok(());
        };
        if let Some(vm) = attached_to(&config, id) {
            return Err(GridError::invalid_argument(format!("hard drive {id} is attached to VM '{vm}'")));
        }
        if drive.nodes.iter().any(|n| n == ctx.node()) {
            let spec = volume_spec(&config, id, ctx.node())?;
            match ctx.env().hypervisor().delete_volume(&spec).await {
                Err(e) if e.kind == ErrorKind::VolumeDoesNotExist => {
                    warn!(drive = %id, "volume already gone");
                }
                other => other?,
            }
        }
        ctx.env().update_config(&format!("delete hard drive {id}"), |cfg| {
            cfg.hard_drives.remove(id);
            Ok(())
        })?;
        info!(drive = %id, "hard drive deleted");
        Ok(())
    }
}

impl RpcObject for HardDriveFactory {
    fn type_name(&self) -> &'static str {
        "HardDriveFactory"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        DRIVE_METHODS
    }

    fn prepare<'a>(&'a self, ctx: &'a CallContext, method: &'a str, mut args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move {
            let config = ctx.config()?;
            match method {
                "create" => {
                    let mut drive = Self::plan(ctx, &config, &args)?;
                    let id = generate_id(IdKind::HardDrive, &drive.backend);
                    drive.base_volume = format!("vmgrid-{}", &id[22..]);
                    capture(&mut args, &id, &drive)?;
                }
                "delete" => {
                    let id: String = args.get(0, "id")?;
                    validate_id(IdKind::HardDrive, &id)?;
                    if !config.hard_drives.contains_key(&id) {
                        return Err(GridError::not_found(format!("hard drive {id} does not exist")));
                    }
                    if let Some(vm) = attached_to(&config, &id) {
                        return Err(GridError::invalid_argument(format!("hard drive {id} is attached to VM '{vm}'")));
                    }
                    args.set(KEY, id);
                }
                "set_sync_state" => {
                    let id: String = args.get(0, "id")?;
                    let drive = config
                        .hard_drives
                        .get(&id)
                        .ok_or_else(|| GridError::not_found(format!("hard drive {id} does not exist")))?;
                    if drive.replication.is_none() {
                        return Err(GridError::invalid_argument(format!("hard drive {id} is not replicated")));
                    }
                    args.get::<SyncState>(1, "sync_state")?;
                    capture(&mut args, &id, drive)?;
                }
                _ => {}
            }
            Ok(args)
        })
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "list" => Ok(serde_json::to_value(ctx.config()?.hard_drives)?),
                "create" => {
                    let (id, drive): (String, HardDriveConfig) = captured(&args)?;
                    Self::create(ctx, &id, drive).await?;
                    Ok(json!(id))
                }
                "delete" => {
                    Self::delete(ctx, &args.required_keyword::<String>(KEY)?).await?;
                    Ok(Value::Null)
                }
                "set_sync_state" => {
                    let id: String = args.required_keyword(KEY)?;
                    let state: SyncState = args.get(1, "sync_state")?;
                    ctx.env().update_config(&format!("set sync state of {id}"), |cfg| {
                        if let Some(r) = cfg.hard_drives.get_mut(&id).and_then(|d| d.replication.as_mut()) {
                            r.sync_state = state;
                        }
                        Ok(())
                    })?;
                    info!(drive = %id, ?state, "sync state updated");
                    Ok(Value::Null)
                }
                "drive_from_user_config" => {
                    let (id, drive): (String, HardDriveConfig) = captured(&args)?;
                    ctx.env().update_config(&format!("install hard drive {id}"), |cfg| {
                        cfg.hard_drives.insert(id.clone(), drive);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "remove_drive_config" => {
                    let id: String = args.get(0, KEY)?;
                    ctx.env().update_config(&format!("remove hard drive {id}"), |cfg| {
                        cfg.hard_drives.remove(&id);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ClusterConfig {
        ClusterConfig::from_value(json!({
            "version": 22,
            "storage_backends": {
                "sb-1": {"name": "default", "type": "lvm", "location": "vg0",
                         "node_overrides": {"beta": "vg_beta"}}
            },
            "hard_drives": {
                "hd-1": {"backend": "sb-1", "type": "REPLICATED", "base_volume": "vmgrid-a",
                         "size_mib": 1024, "nodes": ["alpha", "beta"],
                         "replication": {"minor": 3, "port": 7792}},
                "hd-2": {"backend": "sb-1", "base_volume": "vmgrid-b", "size_mib": 512, "nodes": ["alpha"]}
            },
            "virtual_machines": {
                "vm-1": {"name": "web", "cpu_cores": 1, "memory_mib": 512, "hard_drives": {"0": "hd-2"}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn volume_spec_uses_node_override_and_peers() {
        let cfg = config();
        let spec = volume_spec(&cfg, "hd-1", "beta").unwrap();
        assert_eq!(spec.location, "vg_beta");
        assert_eq!(spec.device_path(), "/dev/drbd3");
        assert_eq!(spec.replication.unwrap().peers, vec!["alpha".to_string()]);

        let local = volume_spec(&cfg, "hd-2", "alpha").unwrap();
        assert_eq!(local.device_path(), "/dev/vg0/vmgrid-b");
    }

    #[test]
    fn minors_and_attachments() {
        let cfg = config();
        assert_eq!(next_minor(&cfg), 4);
        assert_eq!(attached_to(&cfg, "hd-2"), Some("web"));
        assert_eq!(attached_to(&cfg, "hd-1"), None);
        assert_eq!(next_minor(&ClusterConfig::from_value(json!({"version": 22})).unwrap()), 1);
    }
}
