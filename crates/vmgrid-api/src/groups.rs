//! The `group_manager` object: named permission sets applied to their
//! members, on every VM or on a listed subset.

use serde_json::{Value, json};
use tracing::info;
use vmgrid_core::id::{IdKind, generate_id};
use vmgrid_core::validate::validate_entity_name;
use vmgrid_core::{BoxFuture, GridError, GridResult, Permission};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, MethodSpec, RpcObject};
use vmgrid_state::{ClusterConfig, GroupConfig};

use crate::{KEY, capture, captured};

const METHODS: &[MethodSpec] = &[
    MethodSpec::read("list"),
    MethodSpec::fan_out("create", Some("remove_group_config")).requires(Permission::ManageGroups),
    MethodSpec::fan_out("delete", Some("group_from_user_config")).requires(Permission::ManageGroups),
    MethodSpec::fan_out("add_user", Some("group_from_user_config")).requires(Permission::ManageGroups),
    MethodSpec::fan_out("remove_user", Some("group_from_user_config")).requires(Permission::ManageGroups),
    MethodSpec::fan_out("add_permission", Some("group_from_user_config")).requires(Permission::ManageGroups),
    MethodSpec::fan_out("remove_permission", Some("group_from_user_config")).requires(Permission::ManageGroups),
    MethodSpec::fan_out("set_vms", Some("group_from_user_config")).requires(Permission::ManageGroups),
    MethodSpec::fan_out("group_from_user_config", Some("remove_group_config")).requires(Permission::ManageCluster),
    MethodSpec::fan_out("remove_group_config", None).requires(Permission::ManageCluster),
];

pub struct GroupManager;

fn group_id(config: &ClusterConfig, name: &str) -> GridResult<String> {
    config
        .group_by_name(name)
        .map(|(id, _)| id.clone())
        .ok_or_else(|| GridError::not_found(format!("group '{name}' does not exist")))
}

impl GroupManager {
    /// Apply `edit` to the group `id` on this node.
    fn edit<F>(ctx: &CallContext, id: &str, reason: &str, edit: F) -> GridResult<()>
    where
        F: FnOnce(&ClusterConfig, &mut GroupConfig) -> GridResult<()>,
    {
        ctx.env().update_config(reason, |cfg| {
            let snapshot = cfg.clone();
            let group = cfg
                .groups
                .get_mut(id)
                .ok_or_else(|| GridError::not_found(format!("group {id} does not exist")))?;
            edit(&snapshot, group)
        })
    }
}

impl RpcObject for GroupManager {
    fn type_name(&self) -> &'static str {
        "GroupManager"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn prepare<'a>(&'a self, ctx: &'a CallContext, method: &'a str, mut args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move {
            let config = ctx.config()?;
            match method {
                "create" => {
                    let name: String = args.get(0, "name")?;
                    validate_entity_name(&name)?;
                    if config.group_by_name(&name).is_some() {
                        return Err(GridError::already_exists(format!("group '{name}' already exists")));
                    }
                    args.set(KEY, generate_id(IdKind::Group, &name));
                }
                "delete" | "add_user" | "remove_user" | "add_permission" | "remove_permission" | "set_vms" => {
                    let name: String = args.get(0, "name")?;
                    let id = group_id(&config, &name)?;
                    if method == "add_user" {
                        let user: String = args.get(1, "user")?;
                        if !config.users.contains_key(&user) {
                            return Err(GridError::not_found(format!("user '{user}' does not exist")));
                        }
                    }
                    if method == "add_permission" || method == "remove_permission" {
                        args.get::<String>(1, "permission")?.parse::<Permission>()?;
                    }
                    if method == "set_vms" {
                        let vms: Vec<String> = args.get(1, "vms")?;
                        if let Some(missing) = vms.iter().find(|v| !config.virtual_machines.contains_key(*v)) {
                            return Err(GridError::not_found(format!("VM {missing} does not exist")));
                        }
                    }
                    capture(&mut args, &id, &config.groups[&id])?;
                }
                _ => {}
            }
            Ok(args)
        })
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "list" => Ok(serde_json::to_value(ctx.config()?.groups)?),
                "create" => {
                    let name: String = args.get(0, "name")?;
                    let id: String = args.required_keyword(KEY)?;
                    ctx.env().update_config(&format!("create group {name}"), |cfg| {
                        if cfg.group_by_name(&name).is_some() {
                            return Err(GridError::already_exists(format!("group '{name}' already exists")));
                        }
                        cfg.groups.insert(
                            id.clone(),
                            GroupConfig {
                                name: name.clone(),
                                permissions: Vec::new(),
                                users: Vec::new(),
                                vms: Vec::new(),
                            },
                        );
                        Ok(())
                    })?;
                    info!(group = %name, %id, "group created");
                    Ok(json!(id))
                }
                "delete" => {
                    let id: String = args.required_keyword(KEY)?;
                    ctx.env().update_config(&format!("delete group {id}"), |cfg| {
                        cfg.groups.remove(&id);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "add_user" | "remove_user" => {
                    let id: String = args.required_keyword(KEY)?;
                    let user: String = args.get(1, "user")?;
                    let adding = method == "add_user";
                    Self::edit(ctx, &id, &format!("{method} {user} in group {id}"), |_, group| {
                        group.users.retain(|u| *u != user);
                        if adding {
                            group.users.push(user.clone());
                        }
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "add_permission" | "remove_permission" => {
                    let id: String = args.required_keyword(KEY)?;
                    let permission: Permission = args.get::<String>(1, "permission")?.parse()?;
                    let adding = method == "add_permission";
                    Self::edit(ctx, &id, &format!("{method} {permission} in group {id}"), |_, group| {
                        group.permissions.retain(|p| *p != permission);
                        if adding {
                            group.permissions.push(permission);
                            group.permissions.sort();
                        }
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "set_vms" => {
                    let id: String = args.required_keyword(KEY)?;
                    let vms: Vec<String> = args.get(1, "vms")?;
                    Self::edit(ctx, &id, &format!("set VMs of group {id}"), |cfg, group| {
                        if let Some(missing) = vms.iter().find(|v| !cfg.virtual_machines.contains_key(*v)) {
                            return Err(GridError::not_found(format!("VM {missing} does not exist")));
                        }
                        group.vms = vms;
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "group_from_user_config" => {
                    let (id, group): (String, GroupConfig) = captured(&args)?;
                    ctx.env().update_config(&format!("install group {id}"), |cfg| {
                        cfg.groups.insert(id.clone(), group);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "remove_group_config" => {
                    let id: String = args.get(0, KEY)?;
                    ctx.env().update_config(&format!("remove group {id}"), |cfg| {
                        cfg.groups.remove(&id);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}
