//! Virtual machines.
//!
//! `virtual_machine_factory` creates VMs and runs autostart sweeps. Every
//! VM is then exposed as its own object, named by its id, whose permission
//! checks are scoped to that VM.
//!
//! ```text
//! create ─► prepare (id, MACs, nodes) ─► every node: config + object
//!                                       └─ available nodes: define domain
//! start/stop/reset ─► every node: config; the VM's node: hypervisor
//! migrate          ─► offline: current_node moves, domain defined there
//! delete           ─► every node: undefine, forget; reinstalled on failure
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use vmgrid_auth::password::random_bytes;
use vmgrid_core::hypervisor::DomainSpec;
use vmgrid_core::id::{IdKind, generate_id};
use vmgrid_core::validate::validate_entity_name;
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult, Permission};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, MethodSpec, RpcObject, fanout};
use vmgrid_state::{
    AutostartPolicy, ClusterConfig, HardDriveType, LockState, SyncState, VirtualMachineConfig, WatchdogConfig,
};

use crate::storage::{attached_to, volume_spec};
use crate::{KEY, VIRTUAL_MACHINE_FACTORY, capture, captured};

// ── Shared helpers ─────────────────────────────────────────────────

/// Everything the hypervisor on `node` needs to define VM `id`.
pub fn domain_spec(config: &ClusterConfig, id: &str, node: &str) -> GridResult<DomainSpec> {
    let vm = vm_config(config, id)?;
    let disks = vm
        .drive_ids()
        .iter()
        .map(|drive| volume_spec(config, drive, node).map(|v| v.device_path()))
        .collect::<GridResult<Vec<_>>>()?;
    let interfaces = vm
        .network_interfaces
        .iter()
        .map(|(mac, network)| {
            config
                .networks
                .get(network)
                .map(|bridge| (mac.clone(), bridge.clone()))
                .ok_or_else(|| GridError::bug(format!("VM {id} uses missing network '{network}'")))
        })
        .collect::<GridResult<Vec<_>>>()?;
    Ok(DomainSpec {
        id: id.to_string(),
        name: vm.name.clone(),
        cpu_cores: vm.cpu_cores,
        memory_mib: vm.memory_mib,
        disks,
        interfaces,
    })
}

fn vm_config<'c>(config: &'c ClusterConfig, id: &str) -> GridResult<&'c VirtualMachineConfig> {
    config
        .virtual_machines
        .get(id)
        .ok_or_else(|| GridError::not_found(format!("VM {id} does not exist")))
}

fn random_mac() -> GridResult<String> {
    let mut b = [0u8; 3];
    random_bytes(&mut b)?;
    Ok(format!("52:54:00:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2]))
}

fn defined_on(vm: &VirtualMachineConfig, node: &str) -> bool {
    vm.available_nodes.iter().any(|n| n == node)
}

/// Record `vm` on this node, register its object and define its domain
/// when this node may run it. `fresh` refuses an existing id or name.
async fn install(ctx: &CallContext, id: &str, vm: VirtualMachineConfig, fresh: bool) -> GridResult<()> {
    let define = defined_on(&vm, ctx.node());
    let name = vm.name.clone();
    ctx.env().update_config(&format!("install VM {name}"), |cfg| {
        if fresh && (cfg.virtual_machines.contains_key(id) || cfg.vm_by_name(&name).is_some()) {
            return Err(GridError::already_exists(format!("VM '{name}' already exists")));
        }
        cfg.virtual_machines.insert(id.to_string(), vm);
        Ok(())
    })?;
    ctx.env().registry().register(id, Arc::new(VirtualMachine::new(id)));
    if define {
        let spec = domain_spec(&ctx.config()?, id, ctx.node())?;
        if let Err(e) = ctx.env().hypervisor().define_domain(&spec).await {
            forget(ctx, id)?;
            return Err(e);
        }
    }
    info!(vm = %name, %id, defined = define, "VM installed");
    Ok(())
}

/// Undefine VM `id` here and drop it from the configuration.
async fn teardown(ctx: &CallContext, id: &str) -> GridResult<()> {
    let config = ctx.config()?;
    let Some(vm) = config.virtual_machines.get(id) else {
        return Ok(());
    };
    if defined_on(vm, ctx.node()) {
        ctx.env().hypervisor().undefine_domain(id).await?;
    }
    forget(ctx, id)?;
    info!(vm = %vm.name, %id, "VM removed");
    Ok(())
}

fn forget(ctx: &CallContext, id: &str) -> GridResult<()> {
    ctx.env().update_config(&format!("remove VM {id}"), |cfg| {
        cfg.virtual_machines.remove(id);
        Ok(())
    })?;
    ctx.env().registry().deregister(id);
    Ok(())
}

/// Whether VM `id` is running, asking the node it lives on.
async fn is_running(ctx: &CallContext, id: &str, vm: &VirtualMachineConfig) -> GridResult<bool> {
    match vm.current_node.as_deref() {
        None => Ok(false),
        Some(node) if node == ctx.node() => ctx.env().hypervisor().is_running(id).await,
        Some(node) => Ok(ctx
            .call_node(node, id, "is_running", CallArgs::new())
            .await?
            .as_bool()
            .unwrap_or(false)),
    }
}

// ── virtual_machine_factory ────────────────────────────────────────

const FACTORY_METHODS: &[MethodSpec] = &[
    MethodSpec::read("list"),
    MethodSpec::read("get_id"),
    MethodSpec::fan_out("create", Some("remove_vm_config")).requires(Permission::CreateVm),
    MethodSpec::write("autostart").requires(Permission::Superuser),
    MethodSpec::fan_out("vm_from_user_config", Some("remove_vm_config")).requires(Permission::ManageCluster),
    MethodSpec::fan_out("remove_vm_config", None).requires(Permission::ManageCluster),
];

#[derive(Debug, Serialize)]
struct VmSummary<'a> {
    id: &'a str,
    name: &'a str,
    current_node: Option<&'a str>,
    lock: LockState,
    autostart: AutostartPolicy,
}

pub struct VirtualMachineFactory;

impl VirtualMachineFactory {
    fn plan(ctx: &CallContext, config: &ClusterConfig, args: &CallArgs) -> GridResult<VirtualMachineConfig> {
        let name: String = args.get(0, "name")?;
        validate_entity_name(&name)?;
        if config.vm_by_name(&name).is_some() {
            return Err(GridError::already_exists(format!("VM '{name}' already exists")));
        }
        let cpu_cores: u32 = args.get(1, "cpu_cores")?;
        let memory_mib: u64 = args.get(2, "memory_mib")?;
        if cpu_cores == 0 || memory_mib == 0 {
            return Err(GridError::invalid_argument("a VM needs at least one core and some memory"));
        }

        let drives: Vec<String> = args.opt(3, "hard_drives")?.unwrap_or_default();
        let mut available: Vec<String> = config.node_names();
        for drive_id in &drives {
            let drive = config
                .hard_drives
                .get(drive_id)
                .ok_or_else(|| GridError::not_found(format!("hard drive {drive_id} does not exist")))?;
            if let Some(vm) = attached_to(config, drive_id) {
                return Err(GridError::invalid_argument(format!(
                    "hard drive {drive_id} is attached to VM '{vm}'"
                )));
            }
            available.retain(|n| drive.nodes.contains(n));
        }

        let networks: Vec<String> = args.opt(4, "networks")?.unwrap_or_default();
        let mut network_interfaces = std::collections::BTreeMap::new();
        for network in networks {
            if !config.networks.contains_key(&network) {
                return Err(GridError::not_found(format!("network '{network}' does not exist")));
            }
            network_interfaces.insert(random_mac()?, network);
        }

        let available_nodes = match args.opt::<Vec<String>>(5, "available_nodes")? {
            Some(requested) => {
                if let Some(bad) = requested.iter().find(|n| !available.contains(n)) {
                    return Err(GridError::invalid_argument(format!(
                        "VM '{name}' cannot run on '{bad}': its drives are not there"
                    )));
                }
                requested
            }
            None if drives.is_empty() => vec![ctx.node().to_string()],
            None => available,
        };
        if available_nodes.is_empty() {
            return Err(GridError::invalid_argument(format!("no node can run VM '{name}'")));
        }

        Ok(VirtualMachineConfig {
            name,
            available_nodes,
            current_node: None,
            cpu_cores,
            memory_mib,
            lock: LockState::Unlocked,
            autostart: AutostartPolicy::None,
            hard_drives: drives
                .into_iter()
                .enumerate()
                .map(|(i, d)| (i.to_string(), d))
                .collect(),
            network_interfaces,
            permissions: Default::default(),
            watchdog: WatchdogConfig::default(),
        })
    }

    /// Start every VM homed here whose policy matches `trigger`.
    async fn autostart(ctx: &CallContext, trigger: AutostartPolicy) -> GridResult<Vec<String>> {
        let config = ctx.config()?;
        let targets = fanout::targets(ctx, &CallArgs::new())?;
        let mut started = Vec::new();
        for (id, vm) in &config.virtual_machines {
            let home = vm
                .current_node
                .as_deref()
                .or_else(|| vm.available_nodes.first().map(String::as_str));
            if home != Some(ctx.node()) || !vm.autostart.applies_to(trigger) || vm.lock == LockState::Locked {
                continue;
            }
            if ctx.env().hypervisor().is_running(id).await? {
                continue;
            }
            ctx.checkpoint()?;
            let object = ctx.env().registry().get(id)?;
            let args = object
                .prepare(ctx, "start", CallArgs::new().kwarg("node", ctx.node()))
                .await?;
            match fanout::replay(ctx, &targets, id, "start", Some("undo_start"), &args).await {
                Ok(_) => started.push(vm.name.clone()),
                Err(e) => warn!(vm = %vm.name, error = %e, "autostart failed"),
            }
        }
        if !started.is_empty() {
            info!(?trigger, started = ?started, "autostart sweep");
        }
        Ok(started)
    }
}

impl RpcObject for VirtualMachineFactory {
    fn type_name(&self) -> &'static str {
        "VirtualMachineFactory"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        FACTORY_METHODS
    }

    fn prepare<'a>(&'a self, ctx: &'a CallContext, method: &'a str, mut args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move {
            if method == "create" {
                let vm = Self::plan(ctx, &ctx.config()?, &args)?;
                capture(&mut args, &generate_id(IdKind::VirtualMachine, &vm.name), &vm)?;
            }
            Ok(args)
        })
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "list" => {
                    let config = ctx.config()?;
                    let vms: Vec<VmSummary> = config
                        .virtual_machines
                        .iter()
                        .map(|(id, vm)| VmSummary {
                            id,
                            name: &vm.name,
                            current_node: vm.current_node.as_deref(),
                            lock: vm.lock,
                            autostart: vm.autostart,
                        })
                        .collect();
                    Ok(serde_json::to_value(vms)?)
                }
                "get_id" => {
                    let name: String = args.get(0, "name")?;
                    let config = ctx.config()?;
                    let (id, _) = config
                        .vm_by_name(&name)
                        .ok_or_else(|| GridError::not_found(format!("VM '{name}' does not exist")))?;
                    Ok(json!(id))
                }
                "create" | "vm_from_user_config" => {
                    let (id, vm): (String, VirtualMachineConfig) = captured(&args)?;
                    install(ctx, &id, vm, method == "create").await?;
                    Ok(json!(id))
                }
                "remove_vm_config" => {
                    teardown(ctx, &args.get::<String>(0, KEY)?).await?;
                    Ok(Value::Null)
                }
                "autostart" => {
                    let trigger: AutostartPolicy = args.get(0, "trigger")?;
                    Ok(json!(Self::autostart(ctx, trigger).await?))
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}

// ── One VM ─────────────────────────────────────────────────────────

const VM_METHODS: &[MethodSpec] = &[
    MethodSpec::read("info"),
    MethodSpec::read("is_running"),
    MethodSpec::fan_out("start", Some("undo_start")).requires(Permission::ChangeVmPowerState),
    MethodSpec::fan_out("stop", Some("undo_stop")).requires(Permission::ChangeVmPowerState),
    MethodSpec::fan_out("reset", None).requires(Permission::ChangeVmPowerState),
    MethodSpec::fan_out("rename", Some("restore")).requires(Permission::ModifyVm),
    MethodSpec::fan_out("set_autostart", Some("restore")).requires(Permission::ModifyVm),
    MethodSpec::fan_out("set_watchdog", Some("restore")).requires(Permission::ModifyVm),
    MethodSpec::fan_out("set_lock", Some("restore")).requires(Permission::SetVmLock),
    MethodSpec::fan_out("grant", Some("restore")).requires(Permission::ManageUsers),
    MethodSpec::fan_out("revoke", Some("restore")).requires(Permission::ManageUsers),
    MethodSpec::fan_out("migrate", Some("restore")).requires(Permission::MigrateVm),
    MethodSpec::write("delete").requires(Permission::DeleteVm),
    MethodSpec::fan_out("restore", None).requires(Permission::ModifyVm),
    MethodSpec::fan_out("undo_start", None).requires(Permission::ChangeVmPowerState),
    MethodSpec::fan_out("undo_stop", None).requires(Permission::ChangeVmPowerState),
];

pub struct VirtualMachine {
    id: String,
}

impl VirtualMachine {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn config(&self, ctx: &CallContext) -> GridResult<VirtualMachineConfig> {
        Ok(vm_config(&ctx.config()?, &self.id)?.clone())
    }

    fn update<F>(&self, ctx: &CallContext, reason: &str, f: F) -> GridResult<()>
    where
        F: FnOnce(&mut VirtualMachineConfig) -> GridResult<()>,
    {
        ctx.env().update_config(&format!("{reason} VM {}", self.id), |cfg| {
            let vm = cfg
                .virtual_machines
                .get_mut(&self.id)
                .ok_or_else(|| GridError::not_found(format!("VM {} does not exist", self.id)))?;
            f(vm)
        })
    }

    fn unlocked(vm: &VirtualMachineConfig) -> GridResult<()> {
        if vm.lock == LockState::Locked {
            return Err(GridError::new(ErrorKind::VmLocked, format!("VM '{}' is locked", vm.name)));
        }
        Ok(())
    }

    async fn stopped(&self, ctx: &CallContext, vm: &VirtualMachineConfig) -> GridResult<()> {
        if is_running(ctx, &self.id, vm).await? {
            return Err(GridError::new(ErrorKind::VmRunning, format!("VM '{}' is running", vm.name)));
        }
        Ok(())
    }

    /// Checks that only the originator runs, and the node the call acts on.
    async fn plan(&self, ctx: &CallContext, method: &str, args: &mut CallArgs) -> GridResult<()> {
        let config = ctx.config()?;
        let vm = vm_config(&config, &self.id)?.clone();
        match method {
            "start" => {
                Self::unlocked(&vm)?;
                let node = match args.keyword::<String>("node")? {
                    Some(node) => node,
                    None => match &vm.current_node {
                        Some(node) => node.clone(),
                        None if defined_on(&vm, ctx.node()) => ctx.node().to_string(),
                        None => vm.available_nodes.first().cloned().ok_or_else(|| {
                            GridError::invalid_argument(format!("VM '{}' has no available node", vm.name))
                        })?,
                    },
                };
                if !defined_on(&vm, &node) {
                    return Err(GridError::invalid_argument(format!("VM '{}' cannot run on '{node}'", vm.name)));
                }
                for drive in vm.drive_ids() {
                    let replication = config.hard_drives.get(&drive).and_then(|d| d.replication.as_ref());
                    if replication.is_some_and(|r| r.sync_state == SyncState::OutOfSync) {
                        return Err(GridError::new(
                            ErrorKind::ReplicatedVolumeNotInSync,
                            format!("hard drive {drive} is not in sync"),
                        ));
                    }
                }
                args.set("node", node);
            }
            "stop" | "reset" => {
                Self::unlocked(&vm)?;
                let node = vm
                    .current_node
                    .clone()
                    .ok_or_else(|| GridError::new(ErrorKind::VmStopped, format!("VM '{}' is not running", vm.name)))?;
                args.set("node", node);
            }
            "rename" => {
                Self::unlocked(&vm)?;
                let new_name: String = args.get(0, "new_name")?;
                validate_entity_name(&new_name)?;
                if config.vm_by_name(&new_name).is_some() {
                    return Err(GridError::already_exists(format!("VM '{new_name}' already exists")));
                }
                self.stopped(ctx, &vm).await?;
            }
            "delete" => {
                Self::unlocked(&vm)?;
                self.stopped(ctx, &vm).await?;
            }
            "migrate" => {
                Self::unlocked(&vm)?;
                let destination: String = args.get(0, "destination")?;
                if !config.cluster.nodes.contains_key(&destination) {
                    return Err(GridError::invalid_argument(format!("'{destination}' is not a cluster member")));
                }
                if vm.current_node.as_deref() == Some(destination.as_str()) {
                    return Err(GridError::invalid_argument(format!(
                        "VM '{}' is already on '{destination}'",
                        vm.name
                    )));
                }
                for drive_id in vm.drive_ids() {
                    let Some(drive) = config.hard_drives.get(&drive_id) else {
                        continue;
                    };
                    if !drive.nodes.contains(&destination) {
                        let kind = if drive.drive_type == HardDriveType::Local {
                            ErrorKind::CannotMigrateLocalDisk
                        } else {
                            ErrorKind::InvalidArgument
                        };
                        return Err(GridError::new(
                            kind,
                            format!("hard drive {drive_id} is not available on '{destination}'"),
                        ));
                    }
                    if drive.replication.as_ref().is_some_and(|r| r.sync_state == SyncState::OutOfSync) {
                        return Err(GridError::new(
                            ErrorKind::ReplicatedVolumeNotInSync,
                            format!("hard drive {drive_id} is not in sync"),
                        ));
                    }
                }
                self.stopped(ctx, &vm).await?;
            }
            "grant" | "revoke" => {
                let user: String = args.get(0, "user")?;
                args.get::<String>(1, "permission")?.parse::<Permission>()?;
                if !config.users.contains_key(&user) {
                    return Err(GridError::not_found(format!("user '{user}' does not exist")));
                }
            }
            "set_autostart" => {
                args.get::<AutostartPolicy>(0, "policy")?;
            }
            _ => {}
        }
        capture(args, &self.id, &vm)
    }

    /// Tear the VM down on every member. Members already done get the VM
    /// reinstalled when a later one fails.
    async fn delete(&self, ctx: &CallContext, mut args: CallArgs) -> GridResult<()> {
        self.plan(ctx, "delete", &mut args).await?;
        let (id, vm): (String, VirtualMachineConfig) = captured(&args)?;
        let targets = fanout::targets(ctx, &args)?;
        let mut reinstall = CallArgs::new();
        capture(&mut reinstall, &id, &vm)?;

        let nodes = &ctx.with_node_authority();
        let (id, reinstall) = (&id, &reinstall);
        fanout::all_or_nothing(
            &targets,
            |node| async move {
                nodes.checkpoint()?;
                let args = CallArgs::new().kwarg(KEY, id.as_str());
                nodes.call_node(&node, VIRTUAL_MACHINE_FACTORY, "remove_vm_config", args).await
            },
            |node| async move {
                nodes
                    .call_node(&node, VIRTUAL_MACHINE_FACTORY, "vm_from_user_config", reinstall.clone())
                    .await
                    .map(|_| ())
            },
        )
        .await?;
        info!(vm = %vm.name, %id, nodes = targets.len(), "VM deleted");
        Ok(())
    }

    /// Put back the captured configuration, renaming the domain back if
    /// the name changed.
    async fn restore(&self, ctx: &CallContext, args: &CallArgs) -> GridResult<()> {
        let (_, previous): (String, VirtualMachineConfig) = captured(args)?;
        let current = self.config(ctx)?;
        if current.name != previous.name && defined_on(&previous, ctx.node()) {
            ctx.env().hypervisor().rename_domain(&self.id, &previous.name).await?;
        }
        self.update(ctx, "restore", |vm| {
            *vm = previous;
            Ok(())
        })
    }
}

impl RpcObject for VirtualMachine {
    fn type_name(&self) -> &'static str {
        "VirtualMachine"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        VM_METHODS
    }

    fn vm_scope(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn prepare<'a>(&'a self, ctx: &'a CallContext, method: &'a str, mut args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move {
            self.plan(ctx, method, &mut args).await?;
            Ok(args)
        })
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            let id = self.id.as_str();
            let here = ctx.node();
            let hypervisor = ctx.env().hypervisor();
            match method {
                "info" => {
                    let vm = self.config(ctx)?;
                    let running = is_running(ctx, id, &vm).await.unwrap_or(false);
                    let mut info = serde_json::to_value(&vm)?;
                    info["id"] = json!(id);
                    info["running"] = json!(running);
                    Ok(info)
                }
                "is_running" => Ok(json!(hypervisor.is_running(id).await?)),
                "start" => {
                    let node: String = args.required_keyword("node")?;
                    if node == here {
                        if hypervisor.is_running(id).await? {
                            return Err(GridError::new(ErrorKind::VmRunning, format!("VM {id} is already running")));
                        }
                        hypervisor.start_domain(id).await?;
                    }
                    self.update(ctx, "start", |vm| {
                        vm.current_node = Some(node.clone());
                        Ok(())
                    })?;
                    Ok(json!(node))
                }
                "undo_start" => {
                    let node: String = args.required_keyword("node")?;
                    if node == here && hypervisor.is_running(id).await? {
                        hypervisor.stop_domain(id).await?;
                    }
                    self.restore(ctx, &args).await?;
                    Ok(Value::Null)
                }
                "stop" => {
                    let node: String = args.required_keyword("node")?;
                    if node == here {
                        if !hypervisor.is_running(id).await? {
                            return Err(GridError::new(ErrorKind::VmStopped, format!("VM {id} is not running")));
                        }
                        hypervisor.stop_domain(id).await?;
                    }
                    Ok(Value::Null)
                }
                "undo_stop" => {
                    let node: String = args.required_keyword("node")?;
                    if node == here && !hypervisor.is_running(id).await? {
                        hypervisor.start_domain(id).await?;
                    }
                    Ok(Value::Null)
                }
                "reset" => {
                    let node: String = args.required_keyword("node")?;
                    if node == here {
                        if !hypervisor.is_running(id).await? {
                            return Err(GridError::new(ErrorKind::VmStopped, format!("VM {id} is not running")));
                        }
                        hypervisor.reset_domain(id).await?;
                        info!(vm = %id, "VM reset");
                    }
                    Ok(Value::Null)
                }
                "rename" => {
                    let new_name: String = args.get(0, "new_name")?;
                    let vm = self.config(ctx)?;
                    if defined_on(&vm, here) {
                        hypervisor.rename_domain(id, &new_name).await?;
                    }
                    self.update(ctx, "rename", |vm| {
                        vm.name = new_name.clone();
                        Ok(())
                    })?;
                    info!(vm = %id, from = %vm.name, to = %new_name, "VM renamed");
                    Ok(Value::Null)
                }
                "set_autostart" => {
                    let policy: AutostartPolicy = args.get(0, "policy")?;
                    self.update(ctx, "set autostart of", |vm| {
                        vm.autostart = policy;
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "set_watchdog" => {
                    let enabled: Option<bool> = args.opt(0, "enabled")?;
                    let interval: Option<u64> = args.opt(1, "interval_secs")?;
                    let fail_count: Option<u32> = args.opt(2, "reset_fail_count")?;
                    let boot_wait: Option<u64> = args.opt(3, "boot_wait_secs")?;
                    self.update(ctx, "set watchdog of", |vm| {
                        let w = &mut vm.watchdog;
                        w.enabled = enabled.unwrap_or(w.enabled);
                        w.interval_secs = interval.unwrap_or(w.interval_secs).max(1);
                        w.reset_fail_count = fail_count.unwrap_or(w.reset_fail_count).max(1);
                        w.boot_wait_secs = boot_wait.unwrap_or(w.boot_wait_secs);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "set_lock" => {
                    let state: LockState = args.get(0, "lock")?;
                    self.update(ctx, "set lock of", |vm| {
                        vm.lock = state;
                        Ok(())
                    })?;
                    info!(vm = %id, ?state, "VM lock changed");
                    Ok(Value::Null)
                }
                "grant" | "revoke" => {
                    let user: String = args.get(0, "user")?;
                    let permission: Permission = args.get::<String>(1, "permission")?.parse()?;
                    let granting = method == "grant";
                    self.update(ctx, method, |vm| {
                        let users = vm.permissions.entry(permission.as_str().to_string()).or_default();
                        users.retain(|u| *u != user);
                        if granting {
                            users.push(user.clone());
                        }
                        vm.permissions.retain(|_, users| !users.is_empty());
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "migrate" => {
                    let destination: String = args.get(0, "destination")?;
                    let vm = self.config(ctx)?;
                    let newly_available = !defined_on(&vm, &destination);
                    self.update(ctx, "migrate", |vm| {
                        vm.current_node = Some(destination.clone());
                        if newly_available {
                            vm.available_nodes.push(destination.clone());
                        }
                        Ok(())
                    })?;
                    ctx.checkpoint()?;
                    if newly_available && destination == here {
                        let spec = domain_spec(&ctx.config()?, id, here)?;
                        hypervisor.define_domain(&spec).await?;
                    }
                    info!(vm = %id, %destination, "VM migrated");
                    Ok(Value::Null)
                }
                "delete" => {
                    self.delete(ctx, args).await?;
                    Ok(Value::Null)
                }
                "restore" => {
                    self.restore(ctx, &args).await?;
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

    #[test]
    fn domain_spec_resolves_drives_and_bridges() {
        let cfg = ClusterConfig::from_value(json!({
            "version": 22,
            "networks": {"prod": "br0"},
            "storage_backends": {"sb-1": {"name": "default", "type": "lvm", "location": "vg0"}},
            "hard_drives": {
                "hd-a": {"backend": "sb-1", "base_volume": "vmgrid-a", "size_mib": 512, "nodes": ["alpha"]},
                "hd-b": {"backend": "sb-1", "base_volume": "vmgrid-b", "size_mib": 512, "nodes": ["alpha"]}
            },
            "virtual_machines": {
                "vm-1": {"name": "web", "cpu_cores": 2, "memory_mib": 1024,
                         "available_nodes": ["alpha"],
                         "hard_drives": {"1": "hd-b", "0": "hd-a"},
                         "network_interfaces": {"52:54:00:00:00:01": "prod"}}
            }
        }))
        .unwrap();
        let spec = domain_spec(&cfg, "vm-1", "alpha").unwrap();
        assert_eq!(spec.disks, vec!["/dev/vg0/vmgrid-a", "/dev/vg0/vmgrid-b"]);
        assert_eq!(spec.interfaces, vec![("52:54:00:00:00:01".to_string(), "br0".to_string())]);
        assert_eq!(domain_spec(&cfg, "vm-2", "alpha").unwrap_err().kind, ErrorKind::ObjectNotFound);
    }

    #[test]
    fn macs_are_locally_administered_qemu_range() {
        let mac = random_mac().unwrap();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }
}
