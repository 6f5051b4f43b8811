//! Adopting a fresh node into the cluster.
//!
//! Runs on the originator under the cluster lock. The joiner is not a
//! member yet, so it is reached directly through the endpoint and CA of
//! its connect string: first as its bootstrap user, then, once peer users
//! exist, as this node's peer identity carrying the lock claim.
//!
//! ```text
//! 1. lock      joiner version == ours; lock_node(joiner)
//! 2. CAs       joiner CA → every member; member CAs → joiner
//! 3. peers     peer user + credential, both directions, per member
//! 4. config    users, groups, networks, backends, drives, VMs, DRBD → joiner
//! 5. members   joiner → every member's node table; members → joiner's
//! 6. finish    drop the bootstrap user, unlock the joiner
//! ```
//!
//! Every completed step pushes its undo; a failure runs them in reverse.

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};
use vmgrid_auth::{Handshake, random_token};
use vmgrid_cluster::tls::fingerprint;
use vmgrid_cluster::{ConnectString, Endpoint, Target};
use vmgrid_core::{ErrorKind, GridError, GridResult};
use vmgrid_rpc::lock_service::LOCK_SERVICE;
use vmgrid_rpc::{CallArgs, CallContext};
use vmgrid_scheduler::LockHolder;
use vmgrid_state::ClusterConfig;

use crate::cluster::{BOOTSTRAP_USER, cert_error, peer_username};
use crate::{
    CLUSTER, DRBD, GROUP_MANAGER, HARD_DRIVE_FACTORY, KEY, NETWORK_FACTORY, STORAGE_BACKEND_FACTORY,
    USER_MANAGER, VIRTUAL_MACHINE_FACTORY, capture,
};

/// Where an undo runs.
#[derive(Clone)]
enum Route {
    Member(String),
    Joiner(Handshake),
}

struct Undo {
    route: Route,
    object: &'static str,
    method: &'static str,
    args: CallArgs,
}

struct Join<'a> {
    ctx: &'a CallContext,
    joiner: String,
    target: Target,
    connect: ConnectString,
    bootstrap: Handshake,
    /// This node's peer identity on the joiner, with the lock claim.
    peer: Option<Handshake>,
    holder: LockHolder,
    /// `(member, CA pem)`, this node first.
    member_cas: Vec<(String, String)>,
    undo: Vec<Undo>,
}

pub(crate) async fn add_node(ctx: &CallContext, connect_string: &str) -> GridResult<Value> {
    let connect = ConnectString::decode(connect_string)?;
    let config = ctx.config()?;
    if config.cluster.nodes.contains_key(&connect.hostname) {
        return Err(GridError::already_exists(format!(
            "'{}' is already a cluster member",
            connect.hostname
        )));
    }
    let task_id = ctx
        .task_id()
        .ok_or_else(|| GridError::bug("add_node ran outside a task"))?
        .to_string();

    let mut join = Join {
        ctx,
        joiner: connect.hostname.clone(),
        target: Target::bootstrap(
            Endpoint::new(&connect.hostname, &connect.ip, connect.port),
            &connect.ca_pem,
        ),
        bootstrap: Handshake::password(BOOTSTRAP_USER, &connect.token),
        connect,
        peer: None,
        holder: LockHolder {
            node: ctx.node().to_string(),
            task_id,
        },
        member_cas: Vec::new(),
        undo: Vec::new(),
    };
    info!(joiner = %join.joiner, "adding node");
    match join.run(&config).await {
        Ok(()) => {
            info!(joiner = %join.joiner, "node added");
            Ok(json!(ctx.config()?.node_names()))
        }
        Err(e) => Err(join.rollback(e).await),
    }
}

impl Join<'_> {
    async fn run(&mut self, config: &ClusterConfig) -> GridResult<()> {
        self.lock().await?;
        self.ctx.checkpoint()?;
        self.exchange_cas(config).await?;
        self.ctx.checkpoint()?;
        self.create_peer_users(config).await?;
        self.ctx.checkpoint()?;
        self.replay_config(config).await?;
        self.ctx.checkpoint()?;
        self.record_membership(config).await?;
        self.ctx.checkpoint()?;
        self.finish().await
    }

    // ── Calls ──────────────────────────────────────────────────────

    async fn on_joiner(&self, handshake: &Handshake, object: &str, method: &str, args: CallArgs) -> GridResult<Value> {
        self.ctx
            .call_target(&self.target, handshake.clone(), object, method, args)
            .await
    }

    fn peer(&self) -> GridResult<Handshake> {
        self.peer
            .clone()
            .ok_or_else(|| GridError::bug("peer identity used before it exists"))
    }

    fn push(&mut self, route: Route, object: &'static str, method: &'static str, args: CallArgs) {
        self.undo.push(Undo {
            route,
            object,
            method,
            args,
        });
    }

    async fn rollback(&mut self, err: GridError) -> GridError {
        let mut err = err;
        error!(joiner = %self.joiner, error = %err, steps = self.undo.len(), "add_node failed, rolling back");
        while let Some(undo) = self.undo.pop() {
            let (node, result) = match &undo.route {
                Route::Member(node) => (
                    node.as_str(),
                    self.ctx.call_node(node, undo.object, undo.method, undo.args).await,
                ),
                Route::Joiner(handshake) => (
                    self.joiner.as_str(),
                    self.on_joiner(handshake, undo.object, undo.method, undo.args).await,
                ),
            };
            if let Err(e) = result {
                error!(%node, object = undo.object, method = undo.method, error = %e, "undo failed");
                err = err.with_peer_cause(node, &e);
            }
        }
        err
    }

    // ── Steps ──────────────────────────────────────────────────────

    async fn lock(&mut self) -> GridResult<()> {
        let bootstrap = self.bootstrap.clone();
        let theirs = self
            .on_joiner(&bootstrap, CLUSTER, "config_version", CallArgs::new())
            .await?
            .as_u64();
        let ours = u64::from(self.ctx.env().document().version()?);
        if theirs != Some(ours) {
            return Err(GridError::new(
                ErrorKind::VersionMismatch,
                format!(
                    "'{}' runs configuration version {}, the cluster runs {ours}",
                    self.joiner,
                    theirs.map_or_else(|| "?".to_string(), |v| v.to_string())
                ),
            ));
        }
        let holder = serde_json::to_value(&self.holder)?;
        self.on_joiner(&bootstrap, LOCK_SERVICE, "lock_node", CallArgs::new().arg(holder.clone()))
            .await?;
        self.push(
            Route::Joiner(bootstrap),
            LOCK_SERVICE,
            "unlock_node",
            CallArgs::new().arg(holder),
        );
        Ok(())
    }

    async fn exchange_cas(&mut self, config: &ClusterConfig) -> GridResult<()> {
        let bootstrap = self.bootstrap.clone();
        let joiner_ca = self
            .on_joiner(&bootstrap, CLUSTER, "get_ca", CallArgs::new())
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GridError::bug("get_ca returned no PEM"))?;
        if joiner_ca.trim() != self.connect.ca_pem.trim() {
            return Err(GridError::new(
                ErrorKind::InvalidConnectString,
                format!("'{}' presents a different CA than its connect string", self.joiner),
            ));
        }

        let certs = self.ctx.env().certs();
        for member in self.members(config) {
            let pem = if member == self.ctx.node() {
                certs.ca_pem().map_err(cert_error("read CA"))?
            } else {
                certs
                    .peer_ca(&member)
                    .map_err(cert_error("read peer CA"))?
                    .ok_or_else(|| GridError::bug(format!("no CA stored for member '{member}'")))?
            };
            self.member_cas.push((member, pem));
        }

        for (member, _) in self.member_cas.clone() {
            let args = CallArgs::new().arg(self.joiner.as_str()).arg(joiner_ca.as_str());
            self.ctx.call_node(&member, CLUSTER, "add_peer_ca", args).await?;
            let undo = CallArgs::new().arg(self.joiner.as_str());
            self.push(Route::Member(member), CLUSTER, "remove_peer_ca", undo);
        }
        for (member, pem) in self.member_cas.clone() {
            let args = CallArgs::new().arg(member.as_str()).arg(pem);
            self.on_joiner(&bootstrap, CLUSTER, "add_peer_ca", args).await?;
            let undo = CallArgs::new().arg(member.as_str());
            self.push(Route::Joiner(bootstrap.clone()), CLUSTER, "remove_peer_ca", undo);
        }
        info!(joiner = %self.joiner, members = self.member_cas.len(), "CAs exchanged");
        Ok(())
    }

    async fn create_peer_users(&mut self, config: &ClusterConfig) -> GridResult<()> {
        let bootstrap = self.bootstrap.clone();
        let joiner = self.joiner.clone();
        for member in self.members(config) {
            // member → joiner
            let password = random_token()?;
            let args = CallArgs::new().arg(member.as_str()).arg(password.as_str());
            self.on_joiner(&bootstrap, CLUSTER, "add_peer_user", args).await?;
            let undo = CallArgs::new().arg(member.as_str());
            self.push(Route::Joiner(bootstrap.clone()), CLUSTER, "remove_peer_user", undo);

            let username = peer_username(&member);
            let args = CallArgs::new()
                .arg(joiner.as_str())
                .arg(username.as_str())
                .arg(password.as_str());
            self.ctx.call_node(&member, CLUSTER, "set_peer_credential", args).await?;
            let undo = CallArgs::new().arg(joiner.as_str());
            self.push(Route::Member(member.clone()), CLUSTER, "remove_peer_credential", undo);
            if member == self.ctx.node() {
                self.peer = Some(Handshake::password(&username, &password).with_lock_claim(Some(self.holder.task_id.as_str())));
            }

            // joiner → member
            let password = random_token()?;
            let args = CallArgs::new().arg(joiner.as_str()).arg(password.as_str());
            self.ctx.call_node(&member, CLUSTER, "add_peer_user", args).await?;
            let undo = CallArgs::new().arg(joiner.as_str());
            self.push(Route::Member(member.clone()), CLUSTER, "remove_peer_user", undo);

            let args = CallArgs::new()
                .arg(member.as_str())
                .arg(peer_username(&joiner))
                .arg(password);
            self.on_joiner(&bootstrap, CLUSTER, "set_peer_credential", args).await?;
            let undo = CallArgs::new().arg(member.as_str());
            self.push(Route::Joiner(bootstrap.clone()), CLUSTER, "remove_peer_credential", undo);
        }
        info!(joiner = %self.joiner, "peer users created");
        Ok(())
    }

    /// Install one entity on the joiner and register its removal.
    async fn install<T: Serialize>(
        &mut self,
        object: &'static str,
        install: &'static str,
        remove: Option<&'static str>,
        key: &str,
        entity: &T,
    ) -> GridResult<()> {
        let peer = self.peer()?;
        let mut args = CallArgs::new();
        capture(&mut args, key, entity)?;
        self.on_joiner(&peer, object, install, args).await?;
        if let Some(remove) = remove {
            self.push(Route::Joiner(peer), object, remove, CallArgs::new().kwarg(KEY, key));
        }
        Ok(())
    }

    async fn replay_config(&mut self, config: &ClusterConfig) -> GridResult<()> {
        for (name, user) in config.users.iter().filter(|(_, u)| !u.user_type.is_node_local()) {
            self.install(USER_MANAGER, "user_from_user_config", Some("remove_user_config"), name, user)
                .await?;
        }
        for (id, group) in &config.groups {
            self.install(GROUP_MANAGER, "group_from_user_config", Some("remove_group_config"), id, group)
                .await?;
        }
        for (name, interface) in &config.networks {
            self.install(NETWORK_FACTORY, "network_from_user_config", Some("remove_network_config"), name, interface)
                .await?;
        }
        for (id, backend) in &config.storage_backends {
            self.install(
                STORAGE_BACKEND_FACTORY,
                "backend_from_user_config",
                Some("remove_backend_config"),
                id,
                backend,
            )
            .await?;
        }
        for (id, drive) in &config.hard_drives {
            self.install(HARD_DRIVE_FACTORY, "drive_from_user_config", Some("remove_drive_config"), id, drive)
                .await?;
        }
        for (id, vm) in &config.virtual_machines {
            self.install(VIRTUAL_MACHINE_FACTORY, "vm_from_user_config", Some("remove_vm_config"), id, vm)
                .await?;
        }
        self.install(DRBD, "drbd_from_user_config", None, "drbd", &config.drbd).await?;
        info!(
            joiner = %self.joiner,
            users = config.users.len(),
            vms = config.virtual_machines.len(),
            "configuration replayed"
        );
        Ok(())
    }

    async fn record_membership(&mut self, config: &ClusterConfig) -> GridResult<()> {
        let joiner_fingerprint = fingerprint(&self.connect.ca_pem).map_err(cert_error("fingerprint joiner CA"))?;
        for member in self.members(config) {
            let args = CallArgs::new()
                .arg(self.joiner.as_str())
                .arg(self.connect.ip.as_str())
                .arg(self.connect.port)
                .arg(joiner_fingerprint.as_str());
            self.ctx.call_node(&member, CLUSTER, "add_node_config", args).await?;
            let undo = CallArgs::new().arg(self.joiner.as_str());
            self.push(Route::Member(member), CLUSTER, "remove_node_config", undo);
        }

        let peer = self.peer()?;
        for (member, pem) in self.member_cas.clone() {
            let Some(entry) = config.cluster.nodes.get(&member) else {
                continue;
            };
            let member_fingerprint = fingerprint(&pem).map_err(cert_error("fingerprint member CA"))?;
            let args = CallArgs::new()
                .arg(member.as_str())
                .arg(entry.ip.as_str())
                .arg(entry.port)
                .arg(member_fingerprint);
            self.on_joiner(&peer, CLUSTER, "add_node_config", args).await?;
            let undo = CallArgs::new().arg(member.as_str());
            self.push(Route::Joiner(peer.clone()), CLUSTER, "remove_node_config", undo);
        }
        // The joiner's own entry, now with its fingerprint.
        let args = CallArgs::new()
            .arg(self.joiner.as_str())
            .arg(self.connect.ip.as_str())
            .arg(self.connect.port)
            .arg(joiner_fingerprint);
        self.on_joiner(&peer, CLUSTER, "add_node_config", args).await?;
        Ok(())
    }

    async fn finish(&mut self) -> GridResult<()> {
        let peer = self.peer()?;
        self.on_joiner(&peer, CLUSTER, "remove_bootstrap_user", CallArgs::new())
            .await?;
        let holder = serde_json::to_value(&self.holder)?;
        self.on_joiner(&peer, LOCK_SERVICE, "unlock_node", CallArgs::new().arg(holder))
            .await?;
        self.undo.clear();
        Ok(())
    }

    fn members(&self, config: &ClusterConfig) -> Vec<String> {
        let mut members = vec![self.ctx.node().to_string()];
        members.extend(config.node_names().into_iter().filter(|n| n != self.ctx.node()));
        members
    }
}
