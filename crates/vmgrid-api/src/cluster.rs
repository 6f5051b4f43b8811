//! The `cluster` object: membership, connect strings and the node-local
//! plumbing that `add_node` and `remove_node` drive on each member.
//!
//! Plumbing methods are declared as reads so they run in place on the
//! member being changed. `require_lock_holder` admits:
//! - this node's own task
//! - a replay from the lock holder's `CLUSTER_PEER` identity carrying the
//!   holder's task id
//! - the bootstrap user of a node being adopted
//!
//! Dispatch refuses replays from any other identity before they get here.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use vmgrid_auth::{hash_password, random_token};
use vmgrid_cluster::{ConnectString, Endpoint};
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult, Permission, UserType};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, MethodSpec, RpcObject, fanout};
use vmgrid_state::{NodeEntry, PeerCredential, UserConfig};

use crate::{CLUSTER, join, require_lock_holder};

/// The one-time user a fresh node is adopted through.
pub const BOOTSTRAP_USER: &str = "vmgrid-bootstrap";

/// The identity `node` presents when calling other members.
pub fn peer_username(node: &str) -> String {
    format!("vmgrid-peer-{node}")
}

pub(crate) fn cert_error(action: &str) -> impl FnOnce(anyhow::Error) -> GridError + '_ {
    move |e| GridError::bug(format!("{action}: {e:#}"))
}

const METHODS: &[MethodSpec] = &[
    MethodSpec::read("config_version"),
    MethodSpec::read("get_ca"),
    MethodSpec::read("list_nodes"),
    MethodSpec::read("check_cluster").requires(Permission::ManageCluster),
    MethodSpec::write("get_connect_string").requires(Permission::ManageCluster),
    MethodSpec::write("add_node").requires(Permission::ManageCluster),
    MethodSpec::write("remove_node").requires(Permission::ManageCluster),
    // Plumbing.
    MethodSpec::read("add_peer_ca"),
    MethodSpec::read("remove_peer_ca"),
    MethodSpec::read("add_peer_user"),
    MethodSpec::read("remove_peer_user"),
    MethodSpec::read("set_peer_credential"),
    MethodSpec::read("remove_peer_credential"),
    MethodSpec::read("add_node_config"),
    MethodSpec::read("remove_node_config"),
    MethodSpec::read("restore_node_config"),
    MethodSpec::read("remove_bootstrap_user"),
];

/// Everything a member knew about a node before `remove_node_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NodeSnapshot {
    entry: Option<NodeEntry>,
    peer_user: Option<UserConfig>,
    credential: Option<PeerCredential>,
    ca_pem: Option<String>,
    /// VMs that listed the node among their available nodes.
    vms: Vec<String>,
}

pub struct ClusterService;

impl ClusterService {
    fn connect_string(ctx: &CallContext) -> GridResult<String> {
        let config = ctx.config()?;
        if config.cluster.nodes.len() > 1 {
            return Err(GridError::invalid_argument(format!(
                "'{}' is already a member of a cluster",
                ctx.node()
            )));
        }
        let entry = config
            .cluster
            .nodes
            .get(ctx.node())
            .ok_or_else(|| GridError::bug(format!("'{}' missing from its own node table", ctx.node())))?;
        let token = random_token()?;
        let stored = hash_password(&token)?;
        ctx.env().update_config("create bootstrap user", |cfg| {
            cfg.users.insert(
                BOOTSTRAP_USER.to_string(),
                UserConfig {
                    user_type: UserType::Bootstrap,
                    password: Some(stored.hash),
                    salt: Some(stored.salt),
                    global_permissions: Vec::new(),
                    node: None,
                },
            );
            Ok(())
        })?;
        info!(node = %ctx.node(), "connect string issued");
        ConnectString {
            hostname: ctx.node().to_string(),
            ip: entry.ip.clone(),
            port: entry.port,
            token,
            ca_pem: ctx.env().certs().ca_pem().map_err(cert_error("read CA"))?,
        }
        .encode()
    }

    async fn check_cluster(ctx: &CallContext) -> GridResult<Value> {
        let mut report = serde_json::Map::new();
        for node in ctx.config()?.node_names() {
            let status = match ctx.call_node(&node, CLUSTER, "config_version", CallArgs::new()).await {
                Ok(version) => json!({"reachable": true, "version": version}),
                Err(e) => {
                    warn!(%node, error = %e, "cluster check failed");
                    json!({"reachable": !e.kind.is_unreachable(), "error": e.to_string()})
                }
            };
            report.insert(node, status);
        }
        Ok(Value::Object(report))
    }

    async fn remove_node(ctx: &CallContext, node: &str) -> GridResult<Value> {
        if node == ctx.node() {
            return Err(GridError::invalid_argument("a node cannot remove itself"));
        }
        let config = ctx.config()?;
        if !config.cluster.nodes.contains_key(node) {
            return Err(GridError::not_found(format!("'{node}' is not a cluster member")));
        }
        if let Some(vm) = config
            .virtual_machines
            .values()
            .find(|vm| vm.current_node.as_deref() == Some(node))
        {
            return Err(GridError::new(
                ErrorKind::VmRunning,
                format!("VM '{}' is located on '{node}'", vm.name),
            ));
        }

        let remaining: Vec<String> = fanout::targets(ctx, &CallArgs::new())?
            .into_iter()
            .filter(|n| n != node)
            .collect();
        // Its lock is freed while we still hold credentials for it.
        if let Some(task) = ctx.task()
            && task.locked_nodes().iter().any(|n| n == node)
        {
            task.release_node(node).await?;
        }

        let snapshots: Mutex<BTreeMap<String, Value>> = Mutex::new(BTreeMap::new());
        let snapshots = &snapshots;
        fanout::all_or_nothing(
            &remaining,
            |member| async move {
                ctx.checkpoint()?;
                let snapshot = ctx
                    .call_node(&member, CLUSTER, "remove_node_config", CallArgs::new().arg(node))
                    .await?;
                snapshots
                    .lock()
                    .map_err(|_| GridError::bug("snapshot map poisoned"))?
                    .insert(member, snapshot);
                Ok(())
            },
            |member| async move {
                let snapshot = snapshots
                    .lock()
                    .map_err(|_| GridError::bug("snapshot map poisoned"))?
                    .get(&member)
                    .cloned()
                    .unwrap_or(Value::Null);
                let args = CallArgs::new().arg(node).arg(snapshot);
                ctx.call_node(&member, CLUSTER, "restore_node_config", args).await.map(|_| ())
            },
        )
        .await?;
        info!(%node, members = remaining.len(), "node removed from cluster");
        Ok(json!(remaining))
    }

    // ── Plumbing ───────────────────────────────────────────────────

    fn refuse_self(ctx: &CallContext, node: &str) -> GridResult<()> {
        if node == ctx.node() {
            return Err(GridError::invalid_argument(format!("'{node}' is this node")));
        }
        Ok(())
    }

    fn remove_node_config(ctx: &CallContext, node: &str) -> GridResult<NodeSnapshot> {
        Self::refuse_self(ctx, node)?;
        let certs = ctx.env().certs();
        let ca_pem = certs.peer_ca(node).map_err(cert_error("read peer CA"))?;
        let peer = peer_username(node);
        let mut snapshot = ctx.env().update_config(&format!("remove node {node}"), |cfg| {
            let mut vms = Vec::new();
            for (id, vm) in cfg.virtual_machines.iter_mut() {
                if vm.available_nodes.iter().any(|n| n == node) {
                    vm.available_nodes.retain(|n| n != node);
                    vms.push(id.clone());
                }
            }
            Ok(NodeSnapshot {
                entry: cfg.cluster.nodes.remove(node),
                peer_user: cfg.users.remove(&peer),
                credential: cfg.cluster.peer_credentials.remove(node),
                ca_pem: None,
                vms,
            })
        })?;
        certs.remove_peer_ca(node).map_err(cert_error("remove peer CA"))?;
        snapshot.ca_pem = ca_pem;
        ctx.env().directory().remove_node(node);
        ctx.env().forget_peer_session(node)?;
        ctx.env().sessions().remove_user(&peer)?;
        info!(%node, "node forgotten");
        Ok(snapshot)
    }

    fn restore_node_config(ctx: &CallContext, node: &str, snapshot: NodeSnapshot) -> GridResult<()> {
        Self::refuse_self(ctx, node)?;
        if let Some(pem) = &snapshot.ca_pem {
            ctx.env().certs().add_peer_ca(node, pem).map_err(cert_error("restore peer CA"))?;
        }
        let endpoint = snapshot.entry.as_ref().map(|e| Endpoint::new(node, &e.ip, e.port));
        ctx.env().update_config(&format!("restore node {node}"), |cfg| {
            if let Some(entry) = snapshot.entry {
                cfg.cluster.nodes.insert(node.to_string(), entry);
            }
            if let Some(user) = snapshot.peer_user {
                cfg.users.insert(peer_username(node), user);
            }
            if let Some(credential) = snapshot.credential {
                cfg.cluster.peer_credentials.insert(node.to_string(), credential);
            }
            for id in &snapshot.vms {
                if let Some(vm) = cfg.virtual_machines.get_mut(id)
                    && !vm.available_nodes.iter().any(|n| n == node)
                {
                    vm.available_nodes.push(node.to_string());
                }
            }
            Ok(())
        })?;
        if let Some(endpoint) = endpoint {
            ctx.env().directory().set_node(endpoint);
        }
        Ok(())
    }

    fn plumbing(ctx: &CallContext, method: &str, args: &CallArgs) -> GridResult<Value> {
        require_lock_holder(ctx)?;
        let env = ctx.env();
        match method {
            "add_peer_ca" => {
                let node: String = args.get(0, "node")?;
                let pem: String = args.get(1, "ca_pem")?;
                Self::refuse_self(ctx, &node)?;
                env.certs().add_peer_ca(&node, &pem).map_err(cert_error("store peer CA"))?;
                info!(%node, "peer CA trusted");
                Ok(Value::Null)
            }
            "remove_peer_ca" => {
                let node: String = args.get(0, "node")?;
                Ok(json!(env.certs().remove_peer_ca(&node).map_err(cert_error("remove peer CA"))?))
            }
            "add_peer_user" => {
                let node: String = args.get(0, "node")?;
                let password: String = args.get(1, "password")?;
                Self::refuse_self(ctx, &node)?;
                let stored = hash_password(&password)?;
                let username = peer_username(&node);
                env.update_config(&format!("add peer user for {node}"), |cfg| {
                    cfg.users.insert(
                        username.clone(),
                        UserConfig {
                            user_type: UserType::ClusterPeer,
                            password: Some(stored.hash),
                            salt: Some(stored.salt),
                            global_permissions: Vec::new(),
                            node: Some(node.clone()),
                        },
                    );
                    Ok(())
                })?;
                Ok(json!(username))
            }
            "remove_peer_user" => {
                let node: String = args.get(0, "node")?;
                let username = peer_username(&node);
                env.update_config(&format!("remove peer user for {node}"), |cfg| {
                    cfg.users.remove(&username);
                    Ok(())
                })?;
                env.sessions().remove_user(&username)?;
                Ok(Value::Null)
            }
            "set_peer_credential" => {
                let node: String = args.get(0, "node")?;
                let credential = PeerCredential {
                    username: args.get(1, "username")?,
                    password: args.get(2, "password")?,
                };
                env.update_config(&format!("set credential for {node}"), |cfg| {
                    cfg.cluster.peer_credentials.insert(node.clone(), credential);
                    Ok(())
                })?;
                env.forget_peer_session(&node)?;
                Ok(Value::Null)
            }
            "remove_peer_credential" => {
                let node: String = args.get(0, "node")?;
                env.update_config(&format!("remove credential for {node}"), |cfg| {
                    cfg.cluster.peer_credentials.remove(&node);
                    Ok(())
                })?;
                env.forget_peer_session(&node)?;
                Ok(Value::Null)
            }
            "add_node_config" => {
                let node: String = args.get(0, "node")?;
                let entry = NodeEntry {
                    ip: args.get(1, "ip")?,
                    port: args.get(2, "port")?,
                    fingerprint: args.opt(3, "fingerprint")?.unwrap_or_default(),
                };
                let endpoint = Endpoint::new(&node, &entry.ip, entry.port);
                env.update_config(&format!("add node {node}"), |cfg| {
                    cfg.cluster.nodes.insert(node.clone(), entry);
                    Ok(())
                })?;
                env.directory().set_node(endpoint);
                info!(%node, "cluster member recorded");
                Ok(Value::Null)
            }
            "remove_node_config" => {
                let node: String = args.get(0, "node")?;
                Ok(serde_json::to_value(Self::remove_node_config(ctx, &node)?)?)
            }
            "restore_node_config" => {
                let node: String = args.get(0, "node")?;
                let snapshot: Option<NodeSnapshot> = args.opt(1, "snapshot")?;
                Self::restore_node_config(ctx, &node, snapshot.unwrap_or_default())?;
                Ok(Value::Null)
            }
            "remove_bootstrap_user" => {
                env.update_config("remove bootstrap user", |cfg| {
                    cfg.users.remove(BOOTSTRAP_USER);
                    Ok(())
                })?;
                env.sessions().remove_user(BOOTSTRAP_USER)?;
                Ok(Value::Null)
            }
            other => Err(unknown_method("Cluster", other)),
        }
    }
}

impl RpcObject for ClusterService {
    fn type_name(&self) -> &'static str {
        "Cluster"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "config_version" => Ok(json!(ctx.env().document().version()?)),
                "get_ca" => Ok(json!(ctx.env().certs().ca_pem().map_err(cert_error("read CA"))?)),
                "list_nodes" => Ok(serde_json::to_value(ctx.config()?.cluster.nodes)?),
                "check_cluster" => Self::check_cluster(ctx).await,
                "get_connect_string" => Ok(json!(Self::connect_string(ctx)?)),
                "add_node" => join::add_node(ctx, &args.get::<String>(0, "connect_string")?).await,
                "remove_node" => Self::remove_node(ctx, &args.get::<String>(0, "node")?).await,
                other => Self::plumbing(ctx, other, &args),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_usernames() {
        assert_eq!(peer_username("beta"), "vmgrid-peer-beta");
    }
}
