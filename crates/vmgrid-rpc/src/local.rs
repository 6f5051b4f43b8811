//! In-process cluster: a loopback transport that routes requests to the
//! dispatchers of other environments in the same process. Every request
//! and response still passes through its JSON wire form.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;
use vmgrid_auth::{PeerInfo, hash_password};
use vmgrid_cluster::{CertificateStore, RpcRequest, RpcResponse, Target, Transport};
use vmgrid_core::hypervisor::Hypervisor;
use vmgrid_core::{BoxFuture, DaemonSettings, ErrorKind, GridError, GridResult, Permission, UserType};
use vmgrid_state::{ClusterConfig, ConfigDocument, HostStatsStore, NodeEntry, PeerCredential, UserConfig};

use crate::dispatch::Dispatcher;
use crate::env::{Collaborators, Environment};

#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<BTreeMap<String, Weak<Dispatcher>>>,
    down: RwLock<BTreeSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, node: &str, dispatcher: &Arc<Dispatcher>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(node.to_string(), Arc::downgrade(dispatcher));
        }
    }

    /// Make `node` unreachable (or reachable again).
    pub fn set_down(&self, node: &str, down: bool) {
        if let Ok(mut set) = self.down.write() {
            if down {
                set.insert(node.to_string());
            } else {
                set.remove(node);
            }
        }
    }

    fn route(&self, node: &str) -> GridResult<Arc<Dispatcher>> {
        let unreachable = || GridError::new(ErrorKind::PeerUnreachable, format!("{node}: connection refused"));
        if self.down.read().map_err(|_| unreachable())?.contains(node) {
            return Err(unreachable());
        }
        self.nodes
            .read()
            .ok()
            .and_then(|nodes| nodes.get(node).and_then(Weak::upgrade))
            .ok_or_else(unreachable)
    }
}

impl Transport for LocalNetwork {
    fn call<'a>(&'a self, target: &'a Target, request: RpcRequest) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            let dispatcher = self.route(target.node())?;
            let request: RpcRequest = serde_json::from_value(serde_json::to_value(&request)?)?;
            let response = RpcResponse::from(dispatcher.dispatch(request, PeerInfo::default()).await);
            let response: RpcResponse = serde_json::from_value(serde_json::to_value(&response)?)?;
            response.into_result()
        })
    }
}

/// An environment for `node` rooted in `root`, joined to `network`.
pub fn node_environment(
    root: &Path,
    node: &str,
    network: Arc<LocalNetwork>,
    hypervisor: Arc<dyn Hypervisor>,
) -> GridResult<Arc<Environment>> {
    let settings = DaemonSettings::rooted_at(&root.join(node));
    let initial = ClusterConfig::initial(node, "127.0.0.1", settings.listen.port);
    let config = ConfigDocument::create(&settings.config_path(), &initial.to_value()?)?;

    let certs = Arc::new(CertificateStore::new(&settings.ssl_dir(), node));
    certs
        .ensure(&["127.0.0.1".to_string()])
        .map_err(|e| GridError::bug(format!("certificates for {node}: {e:#}")))?;

    let env = Environment::new(
        node,
        settings,
        config,
        Collaborators {
            certs,
            transport: network,
            hypervisor,
            host_stats: HostStatsStore::open_in_memory()?,
        },
    )?;
    Ok(Arc::new(env))
}

/// Add a LOCAL superuser.
pub fn add_admin(env: &Environment, username: &str, password: &str) -> GridResult<()> {
    let stored = hash_password(password)?;
    env.update_config(&format!("add admin {username}"), |cfg| {
        cfg.users.insert(
            username.to_string(),
            UserConfig {
                user_type: UserType::Local,
                password: Some(stored.hash),
                salt: Some(stored.salt),
                global_permissions: vec![Permission::Superuser],
                node: None,
            },
        );
        Ok(())
    })
}

/// Join `envs` into one cluster by writing membership, peer users and
/// peer credentials straight into every configuration.
pub fn mesh(envs: &[Arc<Environment>]) -> GridResult<()> {
    let members: BTreeMap<String, NodeEntry> = envs
        .iter()
        .map(|env| {
            let entry = NodeEntry {
                ip: "127.0.0.1".to_string(),
                port: env.settings().listen.port,
                fingerprint: env.certs().ca_fingerprint().unwrap_or_default(),
            };
            (env.node().to_string(), entry)
        })
        .collect();

    for env in envs {
        let mut peer_users = BTreeMap::new();
        let mut credentials = BTreeMap::new();
        for other in envs.iter().filter(|o| o.node() != env.node()) {
            // `other` calls `env` as vmgrid-peer-<other>.
            let password = format!("{}-to-{}", other.node(), env.node());
            let stored = hash_password(&password)?;
            peer_users.insert(
                format!("vmgrid-peer-{}", other.node()),
                UserConfig {
                    user_type: UserType::ClusterPeer,
                    password: Some(stored.hash),
                    salt: Some(stored.salt),
                    global_permissions: Vec::new(),
                    node: Some(other.node().to_string()),
                },
            );
            // `env` calls `other` as vmgrid-peer-<env>.
            credentials.insert(
                other.node().to_string(),
                PeerCredential {
                    username: format!("vmgrid-peer-{}", env.node()),
                    password: format!("{}-to-{}", env.node(), other.node()),
                },
            );
        }
        env.update_config("mesh", |cfg| {
            cfg.cluster.nodes = members.clone();
            cfg.users.extend(peer_users);
            cfg.cluster.peer_credentials = credentials;
            Ok(())
        })?;
        env.directory().sync_from_config(&env.config()?);
    }
    Ok(())
}
