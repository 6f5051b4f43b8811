//! The cluster lock: the node lock taken on every member.
//!
//! Acquisition is all-or-nothing. Members are locked in plan order (the
//! local node first); on the first failure everything already locked is
//! unlocked again. Each member reports its configuration version and the
//! lock is refused unless all of them match ours, so no write ever spans
//! mixed schema versions.

use std::sync::Arc;

use tracing::{debug, info, warn};
use vmgrid_core::{ErrorKind, GridError, GridResult};

use crate::node_lock::LockHolder;
use crate::peer::PeerLink;

#[derive(Debug, Clone)]
pub struct LockPlan {
    pub holder: LockHolder,
    /// Members to lock, the local node first.
    pub nodes: Vec<String>,
    /// Skip members that cannot be reached instead of failing.
    pub ignore_failed_nodes: bool,
    /// Our configuration version; every member must report the same.
    pub expected_version: u32,
}

/// A held cluster lock. Call [`release`](Self::release); dropping the
/// guard without releasing schedules the release on the runtime.
pub struct ClusterLockGuard {
    link: Arc<dyn PeerLink>,
    holder: LockHolder,
    locked: Vec<String>,
    skipped: Vec<String>,
    released: bool,
}

impl std::fmt::Debug for ClusterLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLockGuard")
            .field("holder", &self.holder)
            .field("locked", &self.locked)
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl ClusterLockGuard {
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Members that were locked, in acquisition order.
    pub fn locked(&self) -> &[String] {
        &self.locked
    }

    /// Unreachable members skipped under `ignore_failed_nodes`.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Stop tracking `node`, which was unlocked by other means.
    pub fn forget(&mut self, node: &str) {
        self.locked.retain(|n| n != node);
    }

    pub async fn release(mut self) {
        self.released = true;
        unlock_all(self.link.as_ref(), &self.holder, &self.locked).await;
    }
}

impl Drop for ClusterLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let link = Arc::clone(&self.link);
        let holder = self.holder.clone();
        let locked = std::mem::take(&mut self.locked);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    unlock_all(link.as_ref(), &holder, &locked).await;
                });
            }
            Err(_) => warn!(task = %holder.task_id, "cluster lock dropped outside a runtime"),
        }
    }
}

async fn unlock_all(link: &dyn PeerLink, holder: &LockHolder, nodes: &[String]) {
    for node in nodes.iter().rev() {
        if let Err(e) = link.unlock_node(node, holder).await {
            warn!(%node, task = %holder.task_id, error = %e, "unlock failed");
        }
    }
    debug!(task = %holder.task_id, nodes = nodes.len(), "cluster lock released");
}

/// Lock every member of `plan`.
pub async fn acquire(link: Arc<dyn PeerLink>, plan: LockPlan) -> GridResult<ClusterLockGuard> {
    let mut locked: Vec<String> = Vec::with_capacity(plan.nodes.len());
    let mut skipped = Vec::new();

    for node in &plan.nodes {
        let failure = match link.lock_node(node, &plan.holder).await {
            Ok(version) if version == plan.expected_version => {
                locked.push(node.clone());
                continue;
            }
            Ok(version) => {
                // Locked, but at the wrong version: release it with the rest.
                locked.push(node.clone());
                GridError::new(
                    ErrorKind::VersionMismatch,
                    format!(
                        "node {node} runs configuration version {version}, expected {}",
                        plan.expected_version
                    ),
                )
            }
            Err(e) if e.kind.is_unreachable() && plan.ignore_failed_nodes && *node != plan.holder.node => {
                warn!(%node, error = %e, "skipping unreachable node");
                skipped.push(node.clone());
                continue;
            }
            Err(e) if e.kind == ErrorKind::LockContended => {
                GridError::new(ErrorKind::LockContended, format!("node {node} is locked"))
                    .with_peer_cause(node, &e)
            }
            Err(e) => GridError::new(
                ErrorKind::ClusterUnavailable,
                format!("cannot lock node {node}"),
            )
            .with_peer_cause(node, &e),
        };

        unlock_all(link.as_ref(), &plan.holder, &locked).await;
        return Err(failure);
    }

    info!(
        task = %plan.holder.task_id,
        locked = locked.len(),
        skipped = skipped.len(),
        "cluster lock acquired"
    );
    Ok(ClusterLockGuard {
        link,
        holder: plan.holder,
        locked,
        skipped,
        released: false,
    })
}
