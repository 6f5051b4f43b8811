//! Dispatcher behaviour across an in-process cluster.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use vmgrid_auth::{Handshake, PeerInfo, hash_password};
use vmgrid_cluster::RpcRequest;
use vmgrid_core::hypervisor::NullHypervisor;
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult, Permission};
use vmgrid_rpc::local::{LocalNetwork, add_admin, mesh, node_environment};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, Dispatcher, EnvPeerLink, Environment, MethodSpec, RpcObject};
use vmgrid_scheduler::{AuditStatus, LockHolder};
use vmgrid_state::UserConfig;

const METHODS: &[MethodSpec] = &[
    MethodSpec::fan_out("add", Some("remove")).requires(Permission::ManageHostNetworks),
    MethodSpec::fan_out("remove", None).requires(Permission::ManageHostNetworks),
    MethodSpec::read("list"),
    MethodSpec::fan_out("record", None),
    MethodSpec::write("wait"),
];

/// Writes bridge mappings into the configuration of the node it runs on.
struct Bridges {
    journal: Arc<Mutex<Vec<String>>>,
}

impl RpcObject for Bridges {
    fn type_name(&self) -> &'static str {
        "Bridges"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            match method {
                "add" => {
                    let name: String = args.get(0, "name")?;
                    let interface: String = args.get(1, "interface")?;
                    ctx.env().update_config("add bridge", |cfg| {
                        if cfg.networks.contains_key(&name) {
                            return Err(GridError::already_exists(format!("bridge {name} exists")));
                        }
                        cfg.networks.insert(name.clone(), interface.clone());
                        Ok(())
                    })?;
                    Ok(json!(ctx.node()))
                }
                "remove" => {
                    let name: String = args.get(0, "name")?;
                    ctx.env().update_config("remove bridge", |cfg| {
                        cfg.networks.remove(&name);
                        Ok(())
                    })?;
                    Ok(Value::Null)
                }
                "list" => Ok(serde_json::to_value(ctx.config()?.networks)?),
                "record" => {
                    let tag: String = args.get(0, "tag")?;
                    self.journal.lock().unwrap().push(format!("start {tag} {}", ctx.node()));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    self.journal.lock().unwrap().push(format!("end {tag} {}", ctx.node()));
                    Ok(Value::Null)
                }
                "wait" => loop {
                    ctx.checkpoint()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                },
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}

struct Cluster {
    _dir: tempfile::TempDir,
    net: Arc<LocalNetwork>,
    envs: Vec<Arc<Environment>>,
    dispatchers: Vec<Arc<Dispatcher>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Cluster {
    fn new(names: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let net = LocalNetwork::new();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut envs = Vec::new();
        let mut dispatchers = Vec::new();
        for name in names {
            let env = node_environment(dir.path(), name, net.clone(), Arc::new(NullHypervisor::new())).unwrap();
            add_admin(&env, "admin", "secret").unwrap();
            let stored = hash_password("viewer").unwrap();
            env.update_config("add viewer", |cfg| {
                cfg.users.insert(
                    "viewer".into(),
                    UserConfig {
                        password: Some(stored.hash),
                        salt: Some(stored.salt),
                        ..UserConfig::default()
                    },
                );
                Ok(())
            })
            .unwrap();
            env.registry().register(
                "bridges",
                Arc::new(Bridges {
                    journal: Arc::clone(&journal),
                }),
            );
            let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&env)));
            net.attach(name, &dispatcher);
            envs.push(env);
            dispatchers.push(dispatcher);
        }
        mesh(&envs).unwrap();
        Self {
            _dir: dir,
            net,
            envs,
            dispatchers,
            journal,
        }
    }

    async fn call(&self, node: usize, request: RpcRequest) -> GridResult<Value> {
        self.dispatchers[node].dispatch(request, PeerInfo::default()).await
    }

    async fn call_from_loopback(&self, node: usize, request: RpcRequest) -> GridResult<Value> {
        let loopback = PeerInfo::new("127.0.0.1:40000".parse().unwrap());
        self.dispatchers[node].dispatch(request, loopback).await
    }

    fn lock(&self, node: usize, holder_node: &str, task_id: &str) -> LockHolder {
        let holder = LockHolder {
            node: holder_node.to_string(),
            task_id: task_id.to_string(),
        };
        self.envs[node].scheduler().node_lock().try_lock(&holder).unwrap();
        holder
    }

    fn networks(&self, node: usize) -> Vec<String> {
        self.envs[node].config().unwrap().networks.into_keys().collect()
    }
}

fn admin(object: &str, method: &str) -> RpcRequest {
    RpcRequest::new(object, method).with_handshake(Handshake::password("admin", "secret"))
}

#[tokio::test]
async fn fan_out_reaches_every_member() {
    let cluster = Cluster::new(&["alpha", "beta", "gamma"]);
    let out = cluster
        .call(0, admin("bridges", "add").arg("br-vm").arg("eth1"))
        .await
        .unwrap();
    assert_eq!(out, json!("alpha"));
    for node in 0..3 {
        assert_eq!(cluster.networks(node), vec!["br-vm"]);
    }
    for env in &cluster.envs {
        assert!(!env.scheduler().node_lock().is_locked());
    }

    let entries = cluster.envs[0].audit().entries();
    assert_eq!(entries.last().unwrap().status, AuditStatus::Success);
    // Replays are audited on the peers too.
    assert!(cluster.envs[1].audit().entries().iter().any(|e| e.method == "add"));
}

#[tokio::test]
async fn failure_on_one_peer_reverts_the_others() {
    let cluster = Cluster::new(&["alpha", "beta", "gamma"]);
    cluster.envs[2]
        .update_config("seed", |cfg| {
            cfg.networks.insert("br-vm".into(), "eth9".into());
            Ok(())
        })
        .unwrap();

    let err = cluster
        .call(0, admin("bridges", "add").arg("br-vm").arg("eth1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::EntityAlreadyExists);
    assert_eq!(err.peer_causes[0].node, "gamma");

    assert!(cluster.networks(0).is_empty());
    assert!(cluster.networks(1).is_empty());
    assert_eq!(cluster.envs[2].config().unwrap().networks["br-vm"], "eth9");
}

#[tokio::test]
async fn unreachable_peer_blocks_writes_unless_ignored() {
    let cluster = Cluster::new(&["alpha", "beta"]);
    cluster.net.set_down("beta", true);

    let err = cluster
        .call(0, admin("bridges", "add").arg("br-vm").arg("eth1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ClusterUnavailable);
    assert_eq!(err.peer_causes[0].node, "beta");
    assert!(cluster.networks(0).is_empty());

    cluster
        .call(
            0,
            admin("bridges", "add")
                .arg("br-vm")
                .arg("eth1")
                .kwarg("ignore_failed_nodes", true),
        )
        .await
        .unwrap();
    assert_eq!(cluster.networks(0), vec!["br-vm"]);
    assert!(cluster.networks(1).is_empty());
}

#[tokio::test]
async fn ignoring_failed_nodes_needs_permission() {
    let cluster = Cluster::new(&["alpha"]);
    cluster.envs[0]
        .update_config("grant", |cfg| {
            cfg.users.get_mut("viewer").unwrap().global_permissions = vec![Permission::ManageHostNetworks];
            Ok(())
        })
        .unwrap();
    let request = RpcRequest::new("bridges", "add")
        .arg("br-vm")
        .arg("eth1")
        .kwarg("ignore_failed_nodes", true)
        .with_handshake(Handshake::password("viewer", "viewer"));
    let err = cluster.call(0, request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);
}

#[tokio::test]
async fn concurrent_writers_on_one_node_are_serialised() {
    let cluster = Arc::new(Cluster::new(&["alpha", "beta"]));
    let mut handles = Vec::new();
    for tag in ["x", "y"] {
        let cluster = Arc::clone(&cluster);
        handles.push(tokio::spawn(async move {
            cluster.call(0, admin("bridges", "record").arg(tag)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let journal = cluster.journal.lock().unwrap().clone();
    assert_eq!(journal.len(), 8);
    for pair in journal.chunks(2) {
        let start = pair[0].strip_prefix("start ").unwrap();
        let end = pair[1].strip_prefix("end ").unwrap();
        assert_eq!(start, end, "bodies overlapped: {journal:?}");
    }

    let statuses: Vec<AuditStatus> = cluster.envs[0]
        .audit()
        .entries()
        .iter()
        .filter(|e| e.method == "record")
        .map(|e| e.status)
        .collect();
    assert_eq!(statuses, vec![AuditStatus::Success; 2]);
}

#[tokio::test]
async fn writers_on_different_nodes_never_overlap() {
    let cluster = Arc::new(Cluster::new(&["alpha", "beta"]));
    let a = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.call(0, admin("bridges", "record").arg("a")).await })
    };
    let b = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.call(1, admin("bridges", "record").arg("b")).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];
    assert!(results.iter().any(Result::is_ok));
    for r in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(r.kind, ErrorKind::LockContended);
    }

    let journal = cluster.journal.lock().unwrap().clone();
    for pair in journal.chunks(2) {
        assert_eq!(pair[0].replace("start", ""), pair[1].replace("end", ""));
    }
}

#[tokio::test]
async fn cancelling_the_running_task_unblocks_the_queue() {
    let cluster = Arc::new(Cluster::new(&["alpha", "beta"]));
    let waiting = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.call(0, admin("bridges", "wait")).await })
    };
    let env = Arc::clone(&cluster.envs[0]);
    while env.scheduler().running_task().is_none() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let queued = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.call(0, admin("bridges", "add").arg("br-vm").arg("eth1")).await })
    };

    let link = Arc::new(EnvPeerLink::new(Arc::clone(&env)));
    env.scheduler().cancel_current_task(link).await.unwrap();

    assert_eq!(waiting.await.unwrap().unwrap_err().kind, ErrorKind::Cancelled);
    queued.await.unwrap().unwrap();
    assert_eq!(cluster.networks(1), vec!["br-vm"]);
    assert!(!cluster.envs[1].scheduler().node_lock().is_locked());

    let statuses: Vec<AuditStatus> = env.audit().entries().iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![AuditStatus::Cancelled, AuditStatus::Success]);
}

#[tokio::test]
async fn permissions_are_enforced_including_proxy_requests() {
    let cluster = Cluster::new(&["alpha"]);
    let viewer = Handshake::password("viewer", "viewer");

    let err = cluster
        .call(0, RpcRequest::new("bridges", "add").arg("br").arg("eth0").with_handshake(viewer.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);

    let err = cluster
        .call(
            0,
            RpcRequest::new("bridges", "add")
                .arg("br")
                .arg("eth0")
                .with_handshake(viewer.with_proxy_user(Some("admin"))),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);

    // Reads need no permission.
    let list = cluster
        .call(0, RpcRequest::new("bridges", "list").with_handshake(Handshake::password("viewer", "viewer")))
        .await
        .unwrap();
    assert_eq!(list, json!({}));
}

#[tokio::test]
async fn lock_claim_without_lock_is_refused() {
    let cluster = Cluster::new(&["alpha", "beta"]);
    let creds = cluster.envs[0].peer_handshake("beta").unwrap();
    let request = RpcRequest::new("bridges", "add")
        .arg("br")
        .arg("eth0")
        .with_handshake(creds.with_lock_claim(Some("tsk-stale")));
    let err = cluster.call(1, request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::LockContended);
    assert!(cluster.networks(1).is_empty());
}

#[tokio::test]
async fn loopback_claim_cannot_borrow_another_nodes_lock() {
    let cluster = Cluster::new(&["alpha", "beta"]);
    cluster.lock(0, "beta", "tsk-x");

    for task in [None, Some("tsk-x")] {
        let request = RpcRequest::new("bridges", "add")
            .arg("rogue")
            .arg("br9")
            .with_handshake(Handshake::password("admin", "secret").with_lock_claim(task));
        let err = cluster.call_from_loopback(0, request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended, "claim {task:?}");
    }
    assert!(cluster.networks(0).is_empty());
    assert!(cluster.networks(1).is_empty());
}

#[tokio::test]
async fn lock_claim_must_carry_the_holders_task() {
    let cluster = Cluster::new(&["alpha", "beta"]);
    let holder = cluster.lock(1, "alpha", "tsk-a");
    let creds = cluster.envs[0].peer_handshake("beta").unwrap();

    for task in [None, Some("tsk-other")] {
        let request = RpcRequest::new("bridges", "add")
            .arg("br")
            .arg("eth0")
            .with_handshake(creds.clone().with_lock_claim(task));
        let err = cluster.call(1, request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended, "claim {task:?}");
    }
    assert!(cluster.networks(1).is_empty());

    let request = RpcRequest::new("bridges", "add")
        .arg("br")
        .arg("eth0")
        .with_handshake(creds.with_lock_claim(Some("tsk-a")));
    cluster.call(1, request).await.unwrap();
    assert_eq!(cluster.networks(1), vec!["br"]);
    assert!(cluster.networks(0).is_empty());
    assert!(cluster.envs[1].scheduler().node_lock().unlock(&holder).unwrap());
}

#[tokio::test]
async fn replays_need_a_node_identity() {
    let cluster = Cluster::new(&["alpha", "beta"]);
    cluster.lock(0, "alpha", "tsk-a");

    // The claim itself is well formed; the caller is still a plain user.
    let request = RpcRequest::new("bridges", "add")
        .arg("br")
        .arg("eth0")
        .with_handshake(Handshake::password("admin", "secret").with_lock_claim(Some("tsk-a")));
    let err = cluster.call_from_loopback(0, request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);
    assert!(cluster.networks(0).is_empty());
}

#[tokio::test]
async fn peers_reuse_one_session_per_node() {
    let cluster = Cluster::new(&["alpha", "beta", "gamma"]);
    for n in 0..5 {
        cluster
            .call(0, admin("bridges", "add").arg(format!("br{n}")).arg("eth1"))
            .await
            .unwrap();
    }
    for node in 1..3 {
        assert_eq!(cluster.envs[node].sessions().len(), 1, "{}", cluster.envs[node].node());
        assert_eq!(cluster.networks(node).len(), 5);
    }

    // A session the peer no longer knows is replaced by a fresh login.
    assert_eq!(cluster.envs[1].sessions().remove_user("vmgrid-peer-alpha").unwrap(), 1);
    cluster
        .call(0, admin("bridges", "add").arg("br-late").arg("eth1"))
        .await
        .unwrap();
    assert_eq!(cluster.envs[1].sessions().len(), 1);
    assert!(cluster.networks(1).contains(&"br-late".to_string()));

    assert!(cluster.envs[0].forget_peer_session("gamma").unwrap());
    assert!(!cluster.envs[0].forget_peer_session("gamma").unwrap());
}

#[tokio::test]
async fn unknown_objects_and_methods() {
    let cluster = Cluster::new(&["alpha"]);
    let err = cluster.call(0, admin("nothing", "list")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ObjectNotFound);
    let err = cluster.call(0, admin("bridges", "explode")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ObjectNotFound);

    let err = cluster
        .call(0, RpcRequest::new("bridges", "list"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unauthenticated);
}
