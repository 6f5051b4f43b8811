//! The `user_manager` object.
//!
//! Users are replicated to every node except node-local identities
//! (cluster peers and the bootstrap user), which each node keeps for
//! itself. Passwords are hashed once on the originating node so every
//! member stores the same hash and salt.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use vmgrid_auth::hash_password;
use vmgrid_core::validate::validate_username;
use vmgrid_core::{BoxFuture, GridError, GridResult, Permission, UserType};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, MethodSpec, RpcObject};
use vmgrid_state::{ClusterConfig, UserConfig};

use crate::{KEY, capture, captured};

const METHODS: &[MethodSpec] = &[
    MethodSpec::read("list"),
    MethodSpec::fan_out("create", Some("remove_user_config")).requires(Permission::ManageUsers),
    MethodSpec::fan_out("delete", Some("restore")).requires(Permission::ManageUsers),
    // Users may change their own password; see `may_set_password`.
    MethodSpec::fan_out("set_password", Some("user_from_user_config")),
    MethodSpec::fan_out("add_permission", Some("user_from_user_config")).requires(Permission::ManageUsers),
    MethodSpec::fan_out("remove_permission", Some("user_from_user_config")).requires(Permission::ManageUsers),
    MethodSpec::fan_out("user_from_user_config", Some("remove_user_config")).requires(Permission::ManageCluster),
    MethodSpec::fan_out("remove_user_config", None).requires(Permission::ManageCluster),
    MethodSpec::fan_out("restore", None).requires(Permission::ManageUsers),
];

/// A user together with every reference to it, as removed by `delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserSnapshot {
    user: UserConfig,
    groups: Vec<String>,
    /// `(vm id, permission name)` grants.
    vm_grants: Vec<(String, String)>,
}

#[derive(Debug, Serialize)]
struct UserSummary<'a> {
    username: &'a str,
    user_type: UserType,
    global_permissions: &'a [Permission],
}

pub struct UserManager;

fn user<'c>(config: &'c ClusterConfig, username: &str) -> GridResult<&'c UserConfig> {
    config
        .users
        .get(username)
        .ok_or_else(|| GridError::not_found(format!("user '{username}' does not exist")))
}

fn editable(config: &ClusterConfig, username: &str) -> GridResult<UserConfig> {
    let user = user(config, username)?;
    if user.user_type.is_node_local() {
        return Err(GridError::invalid_argument(format!(
            "user '{username}' is a node identity and cannot be changed"
        )));
    }
    Ok(user.clone())
}

/// Anyone may change their own password; other users' need MANAGE_USERS.
/// Checked on the originator and again wherever the change is applied.
fn may_set_password(ctx: &CallContext, username: &str) -> GridResult<()> {
    if username != ctx.auth().effective_user {
        ctx.require(Permission::ManageUsers, None)?;
    }
    Ok(())
}

/// Replace the plaintext password in `args` with its hash.
fn hash_into(args: &mut CallArgs, username: &str, password: &str) -> GridResult<()> {
    let stored = hash_password(password)?;
    args.args.truncate(1);
    args.kwargs.remove("password");
    args.set("username", username);
    args.set("password_hash", stored.hash);
    args.set("salt", stored.salt);
    Ok(())
}

impl UserManager {
    fn snapshot(config: &ClusterConfig, username: &str) -> GridResult<UserSnapshot> {
        let user = editable(config, username)?;
        let groups = config
            .groups
            .iter()
            .filter(|(_, g)| g.users.iter().any(|u| u == username))
            .map(|(id, _)| id.clone())
            .collect();
        let vm_grants = config
            .virtual_machines
            .iter()
            .flat_map(|(id, vm)| {
                vm.permissions
                    .iter()
                    .filter(|(_, users)| users.iter().any(|u| u == username))
                    .map(move |(perm, _)| (id.clone(), perm.clone()))
            })
            .collect();
        Ok(UserSnapshot { user, groups, vm_grants })
    }

    fn delete(ctx: &CallContext, username: &str) -> GridResult<()> {
        ctx.env().update_config(&format!("delete user {username}"), |cfg| {
            editable(cfg, username)?;
            cfg.users.remove(username);
            for group in cfg.groups.values_mut() {
                group.users.retain(|u| u != username);
            }
            for vm in cfg.virtual_machines.values_mut() {
                for users in vm.permissions.values_mut() {
                    users.retain(|u| u != username);
                }
                vm.permissions.retain(|_, users| !users.is_empty());
            }
            Ok(())
        })?;
        let ended = ctx.env().sessions().remove_user(username)?;
        info!(user = %username, sessions = ended, "user deleted");
        Ok(())
    }

    fn restore(ctx: &CallContext, username: &str, snapshot: UserSnapshot) -> GridResult<()> {
        ctx.env().update_config(&format!("restore user {username}"), |cfg| {
            cfg.users.insert(username.to_string(), snapshot.user);
            for id in &snapshot.groups {
                if let Some(group) = cfg.groups.get_mut(id)
                    && !group.users.iter().any(|u| u == username)
                {
                    group.users.push(username.to_string());
                }
            }
            for (vm_id, permission) in &snapshot.vm_grants {
                if let Some(vm) = cfg.virtual_machines.get_mut(vm_id) {
                    let users = vm.permissions.entry(permission.clone()).or_default();
                    if !users.iter().any(|u| u == username) {
                        users.push(username.to_string());
                    }
                }
            }
            Ok(())
        })
    }

    fn set_permission(ctx: &CallContext, username: &str, permission: Permission, granted: bool) -> GridResult<()> {
        ctx.env().update_config(&format!("set {permission} on {username}"), |cfg| {
            editable(cfg, username)?;
            let Some(user) = cfg.users.get_mut(username) else {
                return Ok(());
            };
            user.global_permissions.retain(|p| *p != permission);
            if granted {
                user.global_permissions.push(permission);
                user.global_permissions.sort();
            }
            Ok(())
        })
    }
}

impl RpcObject for UserManager {
    fn type_name(&self) -> &'static str {
        "UserManager"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn prepare<'a>(&'a self, ctx: &'a CallContext, method: &'a str, mut args: CallArgs) -> BoxFuture<'a, GridResult<CallArgs>> {
        Box::pin(async move {
            let config = ctx.config()?;
            match method {
                "create" => {
                    let username: String = args.get(0, "username")?;
                    validate_username(&username)?;
                    if config.users.contains_key(&username) {
                        return Err(GridError::already_exists(format!("user '{username}' already exists")));
                    }
                    let user_type = args.opt::<UserType>(2, "user_type")?.unwrap_or_default();
                    if user_type.is_node_local() {
                        return Err(GridError::invalid_argument("node identities are created by the cluster"));
                    }
                    match args.opt::<String>(1, "password")? {
                        Some(password) => hash_into(&mut args, &username, &password)?,
                        None if user_type == UserType::Local => {
                            return Err(GridError::invalid_argument("LOCAL users need a password"));
                        }
                        None => args.args.truncate(1),
                    }
                    args.set("user_type", serde_json::to_value(user_type)?);
                    args.set(KEY, username.as_str());
                }
                "delete" => {
                    let username: String = args.get(0, "username")?;
                    if username == ctx.auth().effective_user {
                        return Err(GridError::invalid_argument("users cannot delete themselves"));
                    }
                    let snapshot = Self::snapshot(&config, &username)?;
                    capture(&mut args, &username, &snapshot)?;
                }
                "set_password" => {
                    let username: String = args.get(0, "username")?;
                    may_set_password(ctx, &username)?;
                    let previous = editable(&config, &username)?;
                    if previous.user_type != UserType::Local {
                        return Err(GridError::invalid_argument(format!(
                            "user '{username}' does not authenticate with a password"
                        )));
                    }
                    let password: String = args.get(1, "password")?;
                    hash_into(&mut args, &username, &password)?;
                    capture(&mut args, &username, &previous)?;
                }
                "add_permission" | "remove_permission" => {
                    let username: String = args.get(0, "username")?;
                    let permission: String = args.get(1, "permission")?;
                    permission.parse::<Permission>()?;
                    let previous = editable(&config, &username)?;
                    capture(&mut args, &username, &previous)?;
                }
                _ => {}
            }
            Ok(args)
        })
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "list" => {
                    let config = ctx.config()?;
                    let users: Vec<UserSummary> = config
                        .users
                        .iter()
                        .map(|(name, u)| UserSummary {
                            username: name,
                            user_type: u.user_type,
                            global_permissions: &u.global_permissions,
                        })
                        .collect();
                    Ok(serde_json::to_value(users)?)
                }
                "create" => {
                    let username: String = args.get(0, "username")?;
                    let user = UserConfig {
                        user_type: args.required_keyword("user_type")?,
                        password: args.keyword("password_hash")?,
                        salt: args.keyword("salt")?,
                        global_permissions: Vec::new(),
                        node: None,
                    };
                    ctx.env().update_config(&format!("create user {username}"), |cfg| {
                        if cfg.users.contains_key(&username) {
                            return Err(GridError::already_exists(format!("user '{username}' already exists")));
                        }
                        cfg.users.insert(username.clone(), user);
                        Ok(())
                    })?;
                    info!(user = %username, "user created");
                    Ok(json!(username))
                }
                "delete" => {
                    Self::delete(ctx, &args.get::<String>(0, "username")?)?;
                    Ok(Value::Null)
                }
                "restore" => {
                    let (username, snapshot): (String, UserSnapshot) = captured(&args)?;
                    Self::restore(ctx, &username, snapshot)?;
                    Ok(Value::Null)
                }
                "set_password" => {
                    let username: String = args.get(0, "username")?;
                    may_set_password(ctx, &username)?;
                    let hash: String = args.required_keyword("password_hash")?;
                    let salt: String = args.required_keyword("salt")?;
                    ctx.env().update_config(&format!("set password of {username}"), |cfg| {
                        editable(cfg, &username)?;
                        if let Some(user) = cfg.users.get_mut(&username) {
                            user.password = Some(hash);
                            user.salt = Some(salt);
                        }
                        Ok(())
                    })?;
                    info!(user = %username, "password changed");
                    Ok(Value::Null)
                }
                "add_permission" | "remove_permission" => {
                    let username: String = args.get(0, "username")?;
                    let permission: Permission = args.get::<String>(1, "permission")?.parse()?;
                    Self::set_permission(ctx, &username, permission, method == "add_permission")?;
                    Ok(Value::Null)
                }
                "user_from_user_config" => {
                    let (username, user): (String, UserConfig) = captured(&args)?;
                    ctx.env().update_config(&format!("install user {username}"), |cfg| {
                        cfg.users.insert(username.clone(), user);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "remove_user_config" => {
                    let username: String = args.get(0, KEY)?;
                    ctx.env().update_config(&format!("remove user {username}"), |cfg| {
                        cfg.users.remove(&username);
                        Ok(())
                    })?;
                    ctx.env().sessions().remove_user(&username)?;
                    Ok(Value::Null)
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}
