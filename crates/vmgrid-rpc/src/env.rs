//! The daemon environment.
//!
//! Everything a node needs at runtime is constructed once at start-up and
//! held here: identity, settings, the configuration document, sessions,
//! the task scheduler, TLS material, the name directory, the registry and
//! the collaborators. Objects receive it through their call context; tests
//! build a fresh one per case.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;
use vmgrid_auth::{Handshake, SessionTable};
use vmgrid_cluster::{CertificateStore, Endpoint, NameDirectory, Transport};
use vmgrid_core::hypervisor::Hypervisor;
use vmgrid_core::{DaemonSettings, ErrorKind, GridError, GridResult};
use vmgrid_scheduler::{AuditLog, TaskScheduler};
use vmgrid_state::{ClusterConfig, ConfigDocument, HostStatsStore, PeerCredential};

use crate::object::CallArgs;
use crate::registry::{ObjectRegistry, RemoteHandle};
use crate::session_service::SESSION_SERVICE;

/// Collaborators that differ between production and tests.
pub struct Collaborators {
    pub certs: Arc<CertificateStore>,
    pub transport: Arc<dyn Transport>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub host_stats: HostStatsStore,
}

pub struct Environment {
    node: String,
    settings: DaemonSettings,
    config: ConfigDocument,
    sessions: SessionTable,
    scheduler: TaskScheduler,
    certs: Arc<CertificateStore>,
    directory: Arc<NameDirectory>,
    registry: ObjectRegistry,
    transport: Arc<dyn Transport>,
    hypervisor: Arc<dyn Hypervisor>,
    host_stats: HostStatsStore,
    /// Peer node → `(username, session id)` from our last login there.
    peer_sessions: Mutex<BTreeMap<String, (String, String)>>,
}

impl Environment {
    pub fn new(node: &str, settings: DaemonSettings, config: ConfigDocument, parts: Collaborators) -> GridResult<Self> {
        let audit = Arc::new(AuditLog::new(settings.audit_capacity));
        let directory = Arc::new(NameDirectory::new());
        let env = Self {
            node: node.to_string(),
            sessions: SessionTable::new(settings.session_ttl()),
            scheduler: TaskScheduler::new(node, audit),
            registry: ObjectRegistry::new(Arc::clone(&directory)),
            directory,
            settings,
            config,
            certs: parts.certs,
            transport: parts.transport,
            hypervisor: parts.hypervisor,
            host_stats: parts.host_stats,
            peer_sessions: Mutex::new(BTreeMap::new()),
        };
        env.directory.sync_from_config(&env.config()?);
        Ok(env)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        self.scheduler.audit()
    }

    pub fn certs(&self) -> &Arc<CertificateStore> {
        &self.certs
    }

    pub fn directory(&self) -> &Arc<NameDirectory> {
        &self.directory
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn host_stats(&self) -> &HostStatsStore {
        &self.host_stats
    }

    // ── Configuration ──────────────────────────────────────────────

    /// A typed copy of the current configuration.
    pub fn config(&self) -> GridResult<ClusterConfig> {
        Ok(self.config.get_typed()?)
    }

    /// Apply `f` to the typed configuration and commit it atomically.
    pub fn update_config<R, F>(&self, reason: &str, f: F) -> GridResult<R>
    where
        F: FnOnce(&mut ClusterConfig) -> GridResult<R>,
    {
        let mut out = None;
        self.config.update(reason, |doc| {
            let mut cfg = ClusterConfig::from_value(std::mem::take(doc))?;
            out = Some(f(&mut cfg)?);
            *doc = cfg.to_value()?;
            Ok(())
        })?;
        out.ok_or_else(|| GridError::bug("configuration update did not run"))
    }

    // ── Peers ──────────────────────────────────────────────────────

    /// Where `node` listens: the directory first, then the configuration.
    pub fn endpoint(&self, node: &str) -> GridResult<Endpoint> {
        if let Some(endpoint) = self.directory.endpoint(node) {
            return Ok(endpoint);
        }
        let config = self.config()?;
        let entry = config.cluster.nodes.get(node).ok_or_else(|| {
            GridError::new(ErrorKind::PeerUnreachable, format!("node '{node}' is not a cluster member"))
        })?;
        Ok(Endpoint::new(node, &entry.ip, entry.port))
    }

    fn peer_credential(&self, node: &str) -> GridResult<PeerCredential> {
        let config = self.config()?;
        config.cluster.peer_credentials.get(node).cloned().ok_or_else(|| {
            GridError::new(
                ErrorKind::ClusterUnavailable,
                format!("no credentials for peer '{node}'"),
            )
        })
    }

    /// The password credentials this node presents to `node`.
    pub fn peer_handshake(&self, node: &str) -> GridResult<Handshake> {
        let cred = self.peer_credential(node)?;
        Ok(Handshake::password(&cred.username, &cred.password))
    }

    /// A session on `node` for this node's peer identity. Logs in once and
    /// reuses the session until the peer rejects it.
    async fn peer_session(&self, node: &str) -> GridResult<Handshake> {
        let cred = self.peer_credential(node)?;
        let cached = self.lock_peer_sessions()?.get(node).cloned();
        if let Some((username, session)) = cached
            && username == cred.username
        {
            return Ok(Handshake::session(&username, &session));
        }

        let login = self.registry.remote(node, SESSION_SERVICE, self.peer_handshake(node)?)?;
        let reply = login.call(self.transport.as_ref(), "login", CallArgs::new()).await?;
        let session: String = serde_json::from_value(reply)
            .map_err(|e| GridError::bug(format!("login on {node} returned no session: {e}")))?;
        self.lock_peer_sessions()?
            .insert(node.to_string(), (cred.username.clone(), session.clone()));
        debug!(%node, user = %cred.username, "peer session established");
        Ok(Handshake::session(&cred.username, &session))
    }

    /// Drop the cached session for `node`, e.g. once it left the cluster.
    pub fn forget_peer_session(&self, node: &str) -> GridResult<bool> {
        Ok(self.lock_peer_sessions()?.remove(node).is_some())
    }

    fn lock_peer_sessions(&self) -> GridResult<std::sync::MutexGuard<'_, BTreeMap<String, (String, String)>>> {
        self.peer_sessions
            .lock()
            .map_err(|_| GridError::bug("peer session cache poisoned"))
    }

    /// Handle to `object` on `node`, authenticated as this node's peer
    /// identity. `claims` adds the proxy user and lock claim.
    pub async fn remote(&self, node: &str, object: &str, claims: &Handshake) -> GridResult<RemoteHandle> {
        if self.directory.endpoint(node).is_none() {
            self.directory.set_node(self.endpoint(node)?);
        }
        let credentials = Handshake {
            proxy_user: claims.proxy_user.clone(),
            has_lock: claims.has_lock,
            task: claims.task.clone(),
            ..self.peer_session(node).await?
        };
        self.registry.remote(node, object, credentials)
    }

    /// Call `object.method` on peer `node`. A rejected session is replaced
    /// by a fresh login and the call sent once more; authentication runs
    /// before anything else on the peer, so the retry cannot apply twice.
    pub async fn call_peer(
        &self,
        node: &str,
        object: &str,
        method: &str,
        args: CallArgs,
        claims: &Handshake,
    ) -> GridResult<Value> {
        let handle = self.remote(node, object, claims).await?;
        debug!(%node, %object, %method, "calling peer");
        match handle.call(self.transport.as_ref(), method, args.clone()).await {
            Err(e) if matches!(e.kind, ErrorKind::SessionExpired | ErrorKind::Unauthenticated) => {
                debug!(%node, error = %e, "peer session rejected, logging in again");
                self.forget_peer_session(node)?;
                let handle = self.remote(node, object, claims).await?;
                handle.call(self.transport.as_ref(), method, args).await
            }
            result => result,
        }
    }

    /// Cluster members other than this node, sorted.
    pub fn peers(&self) -> GridResult<Vec<String>> {
        Ok(self
            .config()?
            .node_names()
            .into_iter()
            .filter(|n| *n != self.node)
            .collect())
    }

    /// Members to lock for a cluster-wide task, this node first.
    pub fn lock_order(&self) -> GridResult<Vec<String>> {
        let mut nodes = vec![self.node.clone()];
        nodes.extend(self.peers()?);
        Ok(nodes)
    }
}
