//! End-to-end scenarios over nodes assembled the way `vmgridd run` does,
//! joined by the in-process transport.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use vmgrid_api::{
    CLUSTER, DRBD, HARD_DRIVE_FACTORY, HostStatsSource, NETWORK_FACTORY, STORAGE_BACKEND_FACTORY, TASK_SCHEDULER,
    USER_MANAGER, VIRTUAL_MACHINE_FACTORY,
};
use vmgrid_auth::{Handshake, PeerInfo};
use vmgrid_cluster::{Endpoint, RpcRequest, Target, Transport};
use vmgrid_core::hypervisor::NullHypervisor;
use vmgrid_core::{DaemonSettings, ErrorKind, GridError, GridResult, NodeIdentity};
use vmgrid_rpc::local::{LocalNetwork, mesh};
use vmgrid_rpc::{Dispatcher, Environment};
use vmgrid_state::{CURRENT_VERSION, ClusterConfig, HostStatsSample, HostStatsStore, StateError, SyncState};
use vmgridd::{HookConfig, Parts, assemble, certificates, open_configuration, provision_hook_credentials, report_sync_state, seed_admin};

struct FixedStats;

impl HostStatsSource for FixedStats {
    fn sample(&self, timestamp_ms: u64) -> GridResult<HostStatsSample> {
        Ok(HostStatsSample {
            timestamp_ms,
            cpu_percent: 1.0,
            memory_used_mib: 64,
            memory_total_mib: 1024,
        })
    }
}

struct Node {
    settings: DaemonSettings,
    env: Arc<Environment>,
    hv: Arc<NullHypervisor>,
    dispatcher: Arc<Dispatcher>,
}

impl Node {
    fn start(root: &Path, net: &Arc<LocalNetwork>, name: &str, admin_password: &str) -> Self {
        let settings = DaemonSettings::rooted_at(&root.join(name));
        let identity = NodeIdentity::new(name).unwrap();
        let document = open_configuration(&settings, &identity).unwrap();
        seed_admin(&document, "admin", admin_password).unwrap();
        let certs = certificates(&settings, &identity).unwrap();
        let hv = Arc::new(NullHypervisor::new());
        let dispatcher = assemble(
            settings.clone(),
            &identity,
            document,
            Parts {
                certs,
                transport: net.clone(),
                hypervisor: hv.clone(),
                host_stats: HostStatsStore::open_in_memory().unwrap(),
                stats_source: Arc::new(FixedStats),
            },
        )
        .unwrap();
        net.attach(name, &dispatcher);
        Self {
            settings,
            env: Arc::clone(dispatcher.env()),
            hv,
            dispatcher,
        }
    }

    async fn call(&self, request: RpcRequest) -> GridResult<Value> {
        self.dispatcher.dispatch(request, PeerInfo::default()).await
    }

    fn config(&self) -> ClusterConfig {
        self.env.config().unwrap()
    }
}

struct Cluster {
    _dir: tempfile::TempDir,
    net: Arc<LocalNetwork>,
    nodes: Vec<Node>,
}

impl Cluster {
    fn meshed(names: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let net = LocalNetwork::new();
        let nodes: Vec<Node> = names.iter().map(|n| Node::start(dir.path(), &net, n, "secret")).collect();
        let envs: Vec<Arc<Environment>> = nodes.iter().map(|n| Arc::clone(&n.env)).collect();
        mesh(&envs).unwrap();
        Self { _dir: dir, net, nodes }
    }
}

fn admin(object: &str, method: &str) -> RpcRequest {
    RpcRequest::new(object, method).with_handshake(Handshake::password("admin", "secret"))
}

fn audit_of(entries: &Value, method: &str) -> Vec<Value> {
    entries
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["method"] == json!(method))
        .cloned()
        .collect()
}

async fn until(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ── Membership ─────────────────────────────────────────────────────

#[tokio::test]
async fn add_node_with_connect_string() {
    let dir = tempfile::tempdir().unwrap();
    let net = LocalNetwork::new();
    let alpha = Node::start(dir.path(), &net, "alpha", "secret");
    let beta = Node::start(dir.path(), &net, "beta", "beta-secret");

    let connect = beta
        .call(RpcRequest::new(CLUSTER, "get_connect_string").with_handshake(Handshake::password("admin", "beta-secret")))
        .await
        .unwrap();
    alpha.call(admin(CLUSTER, "add_node").arg(connect)).await.unwrap();

    for node in [&alpha, &beta] {
        assert_eq!(node.config().node_names(), vec!["alpha", "beta"]);
    }
    assert_eq!(
        alpha.env.certs().peer_ca("beta").unwrap(),
        Some(beta.env.certs().ca_pem().unwrap())
    );
    assert_eq!(
        beta.env.certs().peer_ca("alpha").unwrap(),
        Some(alpha.env.certs().ca_pem().unwrap())
    );

    alpha
        .call(admin(NETWORK_FACTORY, "create").arg("prod").arg("br0"))
        .await
        .unwrap();
    assert_eq!(beta.config().networks["prod"], "br0");
    assert!(beta.hv.has_network("prod"));
}

#[tokio::test]
async fn unreachable_peer_blocks_writes_unless_ignored() {
    let cluster = Cluster::meshed(&["alpha", "beta"]);
    let [alpha, beta] = &cluster.nodes[..] else { unreachable!() };
    let before = alpha.env.document().revision().unwrap();

    cluster.net.set_down("beta", true);
    let err = alpha
        .call(admin(NETWORK_FACTORY, "create").arg("prod").arg("br0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ClusterUnavailable);
    assert!(err.peer_causes.iter().any(|c| c.node == "beta"));
    assert_eq!(alpha.env.document().revision().unwrap(), before);
    assert!(alpha.config().networks.is_empty());
    assert!(!alpha.env.scheduler().node_lock().is_locked());

    alpha
        .call(
            admin(NETWORK_FACTORY, "create")
                .arg("prod")
                .arg("br0")
                .kwarg("ignore_failed_nodes", true),
        )
        .await
        .unwrap();
    assert_eq!(alpha.config().networks["prod"], "br0");

    // beta comes back with the configuration it had.
    cluster.net.set_down("beta", false);
    assert!(beta.config().networks.is_empty());
    assert!(!beta.hv.has_network("prod"));
}

// ── Concurrency ────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_writers_are_serialised() {
    let cluster = Arc::new(Cluster::meshed(&["alpha", "beta"]));
    let spawn_create = |name: &'static str| {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            cluster.nodes[0]
                .call(admin(VIRTUAL_MACHINE_FACTORY, "create").arg(name).arg(1).arg(512))
                .await
        })
    };
    let x = spawn_create("web-x");
    let y = spawn_create("web-y");
    let x = x.await.unwrap().unwrap();
    let y = y.await.unwrap().unwrap();
    assert_ne!(x, y);

    for node in &cluster.nodes {
        let config = node.config();
        assert!(config.vm_by_name("web-x").is_some());
        assert!(config.vm_by_name("web-y").is_some());
    }

    let audit = cluster.nodes[0].call(admin(TASK_SCHEDULER, "audit")).await.unwrap();
    let creates = audit_of(&audit, "create");
    assert_eq!(creates.len(), 2);
    assert!(creates.iter().all(|e| e["status"] == json!("SUCCESS")));
    assert!(creates[0]["seq"].as_u64() < creates[1]["seq"].as_u64());
}

#[tokio::test]
async fn cancelling_the_running_task_releases_the_lock() {
    let cluster = Arc::new(Cluster::meshed(&["alpha", "beta"]));
    let alpha = &cluster.nodes[0];
    alpha.hv.hold("define_network");

    let slow = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            cluster.nodes[0]
                .call(admin(NETWORK_FACTORY, "create").arg("prod").arg("br0"))
                .await
        })
    };
    until(|| alpha.hv.calls().iter().any(|c| c == "define_network prod br0")).await;

    let queued = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            cluster.nodes[0]
                .call(admin(NETWORK_FACTORY, "create").arg("dev").arg("br1"))
                .await
        })
    };
    let running = alpha.call(admin(TASK_SCHEDULER, "running")).await.unwrap();
    assert_ne!(running, Value::Null);

    let outcome = alpha.call(admin(TASK_SCHEDULER, "cancel_current_task")).await.unwrap();
    assert_eq!(outcome["outcome"], json!("cancelled"));
    alpha.hv.release("define_network");

    let err = slow.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    queued.await.unwrap().unwrap();

    for node in &cluster.nodes {
        let networks: Vec<String> = node.config().networks.into_keys().collect();
        assert_eq!(networks, vec!["dev"]);
        assert!(!node.env.scheduler().node_lock().is_locked());
    }
    let audit = alpha.call(admin(TASK_SCHEDULER, "audit")).await.unwrap();
    let statuses: Vec<Value> = audit_of(&audit, "create").iter().map(|e| e["status"].clone()).collect();
    assert_eq!(statuses, vec![json!("CANCELLED"), json!("SUCCESS")]);
}

// ── Configuration ──────────────────────────────────────────────────

fn v17_document() -> Value {
    json!({
        "version": 17,
        "cluster": {"nodes": {"alpha": {"ip": "10.0.0.1"}}},
        "virtual_machines": {
            "vm-aaaaaaaaaaaaaaaaaa-bbbbbbbbbbbbbbbbbbbbbb": {
                "name": "web",
                "available_nodes": ["alpha"],
                "node": "alpha",
                "cpu_cores": 1,
                "memory_mib": 512,
                "hard_disks": ["web_root"],
                "network_interfaces": {}
            }
        },
        "hard_disks": {
            "web_root": {"backend": "sb-x", "type": "LOCAL", "size_mib": 1024, "nodes": ["alpha"]}
        },
        "users": {"admin": {"password": "ab", "salt": "cd", "permissions": ["SUPERUSER"]}}
    })
}

#[test]
fn migration_gate() {
    let dir = tempfile::tempdir().unwrap();
    let settings = DaemonSettings::rooted_at(dir.path());
    let node = NodeIdentity::new("alpha").unwrap();
    let path = settings.config_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();

    let mut doc = v17_document();
    doc["version"] = json!(16);
    std::fs::write(&path, doc.to_string()).unwrap();
    let err = open_configuration(&settings, &node).unwrap_err();
    let state = err.downcast::<StateError>().unwrap();
    assert!(matches!(state, StateError::IntermediateUpgradeRequired { found: 16, .. }));
    assert_eq!(GridError::from(state).kind, ErrorKind::IntermediateUpgradeRequired);
    let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["version"], json!(16), "refused documents stay untouched");

    std::fs::write(&path, v17_document().to_string()).unwrap();
    let document = open_configuration(&settings, &node).unwrap();
    assert_eq!(document.version().unwrap(), CURRENT_VERSION);
    let config: ClusterConfig = document.get_typed().unwrap();
    let (_, vm) = config.vm_by_name("web").unwrap();
    let drives = vm.drive_ids();
    assert_eq!(drives.len(), 1);
    assert!(drives[0].starts_with("hd-"));
    assert_eq!(config.hard_drives[&drives[0]].base_volume, "web_root");
    let raw = document.get().unwrap();
    assert!(raw.get("hard_disks").is_none());

    // Migrated documents load as they are.
    let revision = document.revision().unwrap();
    drop(document);
    let again = open_configuration(&settings, &node).unwrap();
    assert_eq!(again.revision().unwrap(), revision);
    assert_eq!(again.get_typed::<ClusterConfig>().unwrap().hard_drives.len(), 1);
}

// ── Permissions ────────────────────────────────────────────────────

#[tokio::test]
async fn set_password_for_others_is_denied() {
    let cluster = Cluster::meshed(&["alpha", "beta"]);
    let [alpha, beta] = &cluster.nodes[..] else { unreachable!() };
    alpha
        .call(admin(USER_MANAGER, "create").arg("carol").arg("carol-pw"))
        .await
        .unwrap();

    let as_carol = |password: &str| {
        RpcRequest::new(USER_MANAGER, "set_password").with_handshake(Handshake::password("carol", password))
    };
    let err = alpha.call(as_carol("carol-pw").arg("admin").arg("stolen")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);

    alpha.call(as_carol("carol-pw").arg("carol").arg("fresh")).await.unwrap();
    // The new password is replicated.
    beta.call(RpcRequest::new(USER_MANAGER, "list").with_handshake(Handshake::password("carol", "fresh")))
        .await
        .unwrap();
    let err = beta
        .call(RpcRequest::new(USER_MANAGER, "list").with_handshake(Handshake::password("carol", "carol-pw")))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unauthenticated);
}

// ── Replication hook ───────────────────────────────────────────────

#[tokio::test]
async fn hook_reports_sync_state_to_every_node() {
    let cluster = Cluster::meshed(&["alpha", "beta"]);
    let [alpha, beta] = &cluster.nodes[..] else { unreachable!() };
    alpha.call(admin(DRBD, "enable")).await.unwrap();
    alpha
        .call(admin(STORAGE_BACKEND_FACTORY, "create").arg("default").kwarg("location", "vg0"))
        .await
        .unwrap();
    let drive = alpha
        .call(admin(HARD_DRIVE_FACTORY, "create").arg("default").arg(1024).arg("REPLICATED"))
        .await
        .unwrap();
    let drive = drive.as_str().unwrap().to_string();

    assert!(provision_hook_credentials(&alpha.dispatcher).await.unwrap());
    assert!(!provision_hook_credentials(&alpha.dispatcher).await.unwrap());
    assert!(beta.config().users.contains_key("vmgrid-drbd-hook-alpha"));

    let hook = HookConfig::load(&alpha.settings.drbd_hook_config_path()).unwrap();
    assert_eq!(hook.username, "vmgrid-drbd-hook-alpha");
    let target = Target::new(Endpoint::new("alpha", &hook.host, hook.port));
    report_sync_state(&*cluster.net, &target, &hook, &drive, SyncState::OutOfSync)
        .await
        .unwrap();
    for node in [alpha, beta] {
        let replication = node.config().hard_drives[&drive].replication.clone().unwrap();
        assert_eq!(replication.sync_state, SyncState::OutOfSync);
    }

    // The hook user can do nothing else.
    let request = RpcRequest::new(HARD_DRIVE_FACTORY, "delete")
        .arg(drive.as_str())
        .with_handshake(Handshake::password(&hook.username, &hook.password));
    let err = cluster.net.call(&target, request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);

    // A deleted hook user is recreated.
    alpha
        .call(admin(USER_MANAGER, "delete").arg("vmgrid-drbd-hook-alpha"))
        .await
        .unwrap();
    assert!(provision_hook_credentials(&alpha.dispatcher).await.unwrap());
    let hook = HookConfig::load(&alpha.settings.drbd_hook_config_path()).unwrap();
    report_sync_state(&*cluster.net, &target, &hook, &drive, SyncState::InSync)
        .await
        .unwrap();
    assert_eq!(
        beta.config().hard_drives[&drive].replication.clone().unwrap().sync_state,
        SyncState::InSync
    );
}
