//! TaskScheduler — the per-node task queue.
//!
//! Locking operations on one node run strictly one after another, in the
//! order they were enqueued. A task at the head of the queue takes the
//! cluster lock, tells every locked peer about itself (a task pointer
//! carrying the shared task id), and only then runs its body. Cancelling
//! sets a flag the body observes at its checkpoints; a body that never
//! checks is dropped at its next suspension point.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, warn};
use vmgrid_core::id::{IdKind, generate_id};
use vmgrid_core::{ErrorKind, GridError, GridResult};

use crate::audit::{AuditLog, AuditStatus};
use crate::cancel::CancelFlag;
use crate::cluster_lock::{self, LockPlan};
use crate::node_lock::{LockHolder, NodeLock};
use crate::peer::PeerLink;

/// What to run and where to lock.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub object_name: String,
    pub object_type: String,
    pub method: String,
    /// Effective user, for the audit log.
    pub user: String,
    /// Cluster members to lock, the local node first.
    pub nodes: Vec<String>,
    pub ignore_failed_nodes: bool,
    pub expected_version: u32,
}

/// Handed to a task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: String,
    cancel: Arc<CancelFlag>,
    locked_nodes: Vec<String>,
    skipped_nodes: Vec<String>,
    release: Option<NodeRelease>,
}

/// Lets the body of a locally run task unlock a member before the end.
#[derive(Clone)]
struct NodeRelease {
    link: Arc<dyn PeerLink>,
    holder: LockHolder,
    released: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for NodeRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRelease").field("holder", &self.holder).finish()
    }
}

impl TaskContext {
    pub fn new(
        task_id: &str,
        cancel: Arc<CancelFlag>,
        locked_nodes: Vec<String>,
        skipped_nodes: Vec<String>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            cancel,
            locked_nodes,
            skipped_nodes,
            release: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Members under the cluster lock, the local node first.
    pub fn locked_nodes(&self) -> &[String] {
        &self.locked_nodes
    }

    /// Members skipped because they were unreachable.
    pub fn skipped_nodes(&self) -> &[String] {
        &self.skipped_nodes
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Yield point: fails with `Cancelled` once the task has been cancelled.
    pub fn checkpoint(&self) -> GridResult<()> {
        if self.cancel.is_cancelled() {
            Err(GridError::cancelled())
        } else {
            Ok(())
        }
    }

    pub fn cancel_flag(&self) -> Arc<CancelFlag> {
        Arc::clone(&self.cancel)
    }

    /// Drop `node` from the cluster lock now: its task pointer is released
    /// and its node lock freed, and the task leaves it alone when it ends.
    /// Only the task running on the holder can do this.
    pub async fn release_node(&self, node: &str) -> GridResult<()> {
        let Some(release) = &self.release else {
            return Err(GridError::bug("only the lock holder's task can release a node"));
        };
        if node == release.holder.node || !self.locked_nodes.iter().any(|n| n == node) {
            return Err(GridError::invalid_argument(format!("'{node}' is not a locked peer")));
        }
        {
            let released = release
                .released
                .lock()
                .map_err(|_| GridError::bug("released node list poisoned"))?;
            if released.iter().any(|n| n == node) {
                return Ok(());
            }
        }
        if let Err(e) = release.link.release_task_pointer(node, &self.task_id).await {
            warn!(%node, task = %self.task_id, error = %e, "release of task pointer failed");
        }
        release.link.unlock_node(node, &release.holder).await?;
        release
            .released
            .lock()
            .map_err(|_| GridError::bug("released node list poisoned"))?
            .push(node.to_string());
        info!(%node, task = %self.task_id, "node released early");
        Ok(())
    }
}

/// What `cancel_current_task` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The running local task was flagged, along with its pointers.
    Cancelled { task_id: String },
    /// Nothing ran locally; the node lock and task pointers were cleared.
    Cleared { holder: Option<LockHolder>, pointers: usize },
}

struct Queued {
    id: String,
    cancel: Arc<CancelFlag>,
}

struct Running {
    id: String,
    cancel: Arc<CancelFlag>,
    peers: Vec<String>,
}

struct Pointer {
    origin: String,
    cancel: Arc<CancelFlag>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Queued>,
    running: Option<Running>,
    /// Tasks of other nodes running under our lock, by task id.
    pointers: HashMap<String, Pointer>,
}

pub struct TaskScheduler {
    node: String,
    node_lock: NodeLock,
    audit: Arc<AuditLog>,
    state: Mutex<State>,
    changed: Notify,
}

impl TaskScheduler {
    pub fn new(node: &str, audit: Arc<AuditLog>) -> Self {
        Self {
            node: node.to_string(),
            node_lock: NodeLock::new(),
            audit,
            state: Mutex::new(State::default()),
            changed: Notify::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn node_lock(&self) -> &NodeLock {
        &self.node_lock
    }

    fn state(&self) -> GridResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| GridError::bug("scheduler state poisoned"))
    }

    // ── Local tasks ────────────────────────────────────────────────

    /// Enqueue `body` and run it once it reaches the head of the queue and
    /// holds the cluster lock.
    pub async fn run<F, Fut>(&self, link: Arc<dyn PeerLink>, spec: TaskSpec, body: F) -> GridResult<Value>
    where
        F: FnOnce(TaskContext) -> Fut + Send,
        Fut: Future<Output = GridResult<Value>> + Send,
    {
        let task_id = generate_id(IdKind::Task, &format!("{}.{}", spec.object_name, spec.method));
        let cancel = Arc::new(CancelFlag::new());
        let seq = self.audit.record(
            Some(&task_id),
            &spec.method,
            &spec.user,
            &spec.object_name,
            &spec.object_type,
            AuditStatus::Queued,
        );
        self.state()?.queue.push_back(Queued {
            id: task_id.clone(),
            cancel: Arc::clone(&cancel),
        });
        let _slot = QueueSlot {
            scheduler: self,
            task_id: task_id.clone(),
            link: Arc::clone(&link),
        };

        let result = self.run_queued(link, &spec, &task_id, seq, cancel, body).await;

        let (status, message) = match &result {
            Ok(_) => (AuditStatus::Success, None),
            Err(e) if e.kind == ErrorKind::Cancelled => (AuditStatus::Cancelled, Some(e.to_string())),
            Err(e) => (AuditStatus::Failed, Some(e.to_string())),
        };
        self.audit.transition(seq, status, message.as_deref());
        result
    }

    async fn run_queued<F, Fut>(
        &self,
        link: Arc<dyn PeerLink>,
        spec: &TaskSpec,
        task_id: &str,
        seq: u64,
        cancel: Arc<CancelFlag>,
        body: F,
    ) -> GridResult<Value>
    where
        F: FnOnce(TaskContext) -> Fut + Send,
        Fut: Future<Output = GridResult<Value>> + Send,
    {
        loop {
            let notified = self.changed.notified();
            if self.state()?.queue.front().is_some_and(|q| q.id == task_id) {
                break;
            }
            if cancel.is_cancelled() {
                return Err(GridError::cancelled());
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(GridError::cancelled());
        }

        let holder = LockHolder {
            node: self.node.clone(),
            task_id: task_id.to_string(),
        };
        let mut guard = cluster_lock::acquire(
            Arc::clone(&link),
            LockPlan {
                holder: holder.clone(),
                nodes: spec.nodes.clone(),
                ignore_failed_nodes: spec.ignore_failed_nodes,
                expected_version: spec.expected_version,
            },
        )
        .await?;

        let peers: Vec<String> = guard
            .locked()
            .iter()
            .filter(|n| **n != self.node)
            .cloned()
            .collect();
        let mut created: Vec<&String> = Vec::with_capacity(peers.len());
        for node in &peers {
            if let Err(e) = link.create_task_pointer(node, &holder).await {
                for done in created.iter().rev() {
                    if let Err(e) = link.cancel_task_pointer(done, task_id).await {
                        warn!(node = %done, task = %task_id, error = %e, "cancel of task pointer failed");
                    }
                    if let Err(e) = link.release_task_pointer(done, task_id).await {
                        warn!(node = %done, task = %task_id, error = %e, "release of task pointer failed");
                    }
                }
                guard.release().await;
                return Err(GridError::new(
                    ErrorKind::ClusterUnavailable,
                    format!("node {node} rejected task pointer"),
                )
                .with_peer_cause(node, &e));
            }
            created.push(node);
        }

        self.state()?.running = Some(Running {
            id: task_id.to_string(),
            cancel: Arc::clone(&cancel),
            peers: peers.clone(),
        });
        self.audit.transition(seq, AuditStatus::Running, None);
        info!(task = %task_id, object = %spec.object_name, method = %spec.method, "task started");

        let released = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = TaskContext::new(
            task_id,
            Arc::clone(&cancel),
            guard.locked().to_vec(),
            guard.skipped().to_vec(),
        );
        ctx.release = Some(NodeRelease {
            link: Arc::clone(&link),
            holder,
            released: Arc::clone(&released),
        });
        let result = tokio::select! {
            r = body(ctx) => r,
            _ = cancel.cancelled() => Err(GridError::cancelled()),
        };

        if let Ok(mut state) = self.state() {
            state.running = None;
        }
        let released = released.lock().map(|r| r.clone()).unwrap_or_default();
        for node in &released {
            guard.forget(node);
        }
        for node in peers.iter().filter(|n| !released.contains(*n)) {
            if let Err(e) = link.release_task_pointer(node, task_id).await {
                warn!(%node, task = %task_id, error = %e, "release of task pointer failed");
            }
        }
        guard.release().await;
        info!(task = %task_id, ok = result.is_ok(), "task finished");
        result
    }

    /// Cancel the running local task, or clear a stuck node lock.
    ///
    /// With a local task running, its flag and every pointer it
    /// distributed are cancelled. Otherwise the flags of any pointers held
    /// here are set and the node lock plus all pointers are cleared.
    pub async fn cancel_current_task(&self, link: Arc<dyn PeerLink>) -> GridResult<CancelOutcome> {
        let running = self
            .state()?
            .running
            .as_ref()
            .map(|r| (r.id.clone(), Arc::clone(&r.cancel), r.peers.clone()));

        if let Some((task_id, cancel, peers)) = running {
            cancel.cancel();
            for node in &peers {
                if let Err(e) = link.cancel_task_pointer(node, &task_id).await {
                    warn!(%node, task = %task_id, error = %e, "cancel of task pointer failed");
                }
            }
            info!(task = %task_id, "running task cancelled");
            return Ok(CancelOutcome::Cancelled { task_id });
        }

        let pointers: Vec<Pointer> = {
            let mut state = self.state()?;
            state.pointers.drain().map(|(_, p)| p).collect()
        };
        for p in &pointers {
            p.cancel.cancel();
        }
        let holder = self.node_lock.force_clear()?;
        self.changed.notify_waiters();
        Ok(CancelOutcome::Cleared {
            holder,
            pointers: pointers.len(),
        })
    }

    /// Cancel a task that is still waiting in the queue.
    pub fn cancel_queued(&self, task_id: &str) -> GridResult<bool> {
        let state = self.state()?;
        if state.running.as_ref().is_some_and(|r| r.id == task_id) {
            return Ok(false);
        }
        let Some(queued) = state.queue.iter().find(|q| q.id == task_id) else {
            return Ok(false);
        };
        queued.cancel.cancel();
        Ok(true)
    }

    pub fn running_task(&self) -> Option<String> {
        self.state().ok()?.running.as_ref().map(|r| r.id.clone())
    }

    /// Ids of queued tasks, head first.
    pub fn queued_tasks(&self) -> Vec<String> {
        self.state()
            .map(|s| s.queue.iter().map(|q| q.id.clone()).collect())
            .unwrap_or_default()
    }

    // ── Node lock and pointers (called by the lock holder) ─────────

    pub fn lock_node(&self, holder: &LockHolder) -> GridResult<()> {
        self.node_lock.try_lock(holder)
    }

    /// Release the node lock held by `holder` and drop its pointer.
    pub fn unlock_node(&self, holder: &LockHolder) -> GridResult<bool> {
        self.state()?.pointers.remove(&holder.task_id);
        self.node_lock.unlock(holder)
    }

    /// Record that `holder.task_id` runs under our lock. The lock must be
    /// held by that task.
    pub fn create_pointer(&self, holder: &LockHolder) -> GridResult<()> {
        if self.node_lock.holder().as_ref() != Some(holder) {
            return Err(GridError::new(
                ErrorKind::LockContended,
                format!("task {} does not hold this node's lock", holder.task_id),
            ));
        }
        self.state()?.pointers.insert(
            holder.task_id.clone(),
            Pointer {
                origin: holder.node.clone(),
                cancel: Arc::new(CancelFlag::new()),
            },
        );
        Ok(())
    }

    pub fn release_pointer(&self, task_id: &str) -> GridResult<bool> {
        Ok(self.state()?.pointers.remove(task_id).is_some())
    }

    pub fn cancel_pointer(&self, task_id: &str) -> GridResult<bool> {
        let state = self.state()?;
        match state.pointers.get(task_id) {
            Some(p) => {
                p.cancel.cancel();
                info!(task = %task_id, origin = %p.origin, "task pointer cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Context for a replay of `task_id` arriving from the lock holder.
    pub fn pointer_context(&self, task_id: &str) -> Option<TaskContext> {
        let state = self.state().ok()?;
        let pointer = state.pointers.get(task_id)?;
        Some(TaskContext::new(
            task_id,
            Arc::clone(&pointer.cancel),
            vec![self.node.clone()],
            Vec::new(),
        ))
    }

    /// Whether `task_id` (local or pointer) has been cancelled.
    pub fn is_cancelled(&self, task_id: &str) -> bool {
        let Ok(state) = self.state() else {
            return false;
        };
        if let Some(r) = state.running.as_ref().filter(|r| r.id == task_id) {
            return r.cancel.is_cancelled();
        }
        state
            .pointers
            .get(task_id)
            .is_some_and(|p| p.cancel.is_cancelled())
    }
}

/// Removes the task from the queue however `run` exits.
struct QueueSlot<'a> {
    scheduler: &'a TaskScheduler,
    task_id: String,
    link: Arc<dyn PeerLink>,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let orphaned_peers = match self.scheduler.state.lock() {
            Ok(mut state) => {
                state.queue.retain(|q| q.id != self.task_id);
                match state.running.take() {
                    Some(r) if r.id == self.task_id => r.peers,
                    other => {
                        state.running = other;
                        Vec::new()
                    }
                }
            }
            Err(_) => Vec::new(),
        };
        self.scheduler.changed.notify_waiters();

        // Only reached when `run` was dropped mid-body.
        if !orphaned_peers.is_empty()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let link = Arc::clone(&self.link);
            let task_id = self.task_id.clone();
            handle.spawn(async move {
                for node in &orphaned_peers {
                    if let Err(e) = link.cancel_task_pointer(node, &task_id).await {
                        warn!(%node, task = %task_id, error = %e, "cancel of orphaned task pointer failed");
                    }
                    if let Err(e) = link.release_task_pointer(node, &task_id).await {
                        warn!(%node, task = %task_id, error = %e, "release of orphaned task pointer failed");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_lock::tests::FakeCluster;
    use serde_json::json;
    use std::time::Duration;

    fn spec(nodes: &[&str]) -> TaskSpec {
        TaskSpec {
            object_name: "virtual_machine_factory".into(),
            object_type: "VirtualMachineFactory".into(),
            method: "create".into(),
            user: "admin".into(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            ignore_failed_nodes: false,
            expected_version: 22,
        }
    }

    fn scheduler() -> Arc<TaskScheduler> {
        Arc::new(TaskScheduler::new("alpha", Arc::new(AuditLog::new(16))))
    }

    #[tokio::test]
    async fn tasks_run_one_at_a_time_in_enqueue_order() {
        let sched = scheduler();
        let cluster: Arc<FakeCluster> = Arc::new(FakeCluster::new(&["alpha", "beta"]));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let sched = Arc::clone(&sched);
            let cluster = Arc::clone(&cluster);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                sched
                    .run(cluster.clone(), spec(&["alpha", "beta"]), move |ctx| async move {
                        log.lock().unwrap().push(format!("start {i}"));
                        assert!(cluster.locks["beta"].is_locked());
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        ctx.checkpoint()?;
                        log.lock().unwrap().push(format!("end {i}"));
                        Ok(json!(i))
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap().unwrap(), json!(i));
        }

        let log = log.lock().unwrap().clone();
        assert_eq!(log, ["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]);
        assert!(cluster.locks.values().all(|l| !l.is_locked()));

        let statuses: Vec<AuditStatus> = sched.audit().entries().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![AuditStatus::Success; 3]);
    }

    #[tokio::test]
    async fn cancel_running_task_releases_lock_and_unblocks_queue() {
        let sched = scheduler();
        let cluster = Arc::new(FakeCluster::new(&["alpha", "beta"]));

        let first = {
            let sched = Arc::clone(&sched);
            let cluster = Arc::clone(&cluster);
            tokio::spawn(async move {
                sched
                    .run(cluster, spec(&["alpha", "beta"]), |_ctx| async move {
                        std::future::pending::<()>().await;
                        Ok(Value::Null)
                    })
                    .await
            })
        };
        let second = {
            let sched = Arc::clone(&sched);
            let cluster = Arc::clone(&cluster);
            tokio::spawn(async move {
                sched
                    .run(cluster, spec(&["alpha", "beta"]), |_ctx| async move { Ok(json!("second")) })
                    .await
            })
        };

        while sched.running_task().is_none() {
            tokio::task::yield_now().await;
        }
        let running = sched.running_task().unwrap();
        let outcome = sched.cancel_current_task(cluster.clone()).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled { task_id: running.clone() });

        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));

        assert!(cluster.cancelled.lock().unwrap().contains(&("beta".to_string(), running)));
        assert!(cluster.locks.values().all(|l| !l.is_locked()));
        let statuses: Vec<AuditStatus> = sched.audit().entries().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![AuditStatus::Cancelled, AuditStatus::Success]);
    }

    #[tokio::test]
    async fn rejected_pointer_aborts_before_body() {
        let sched = scheduler();
        let mut fake = FakeCluster::new(&["alpha", "beta", "gamma"]);
        fake.refuse_pointers.insert("gamma".into());
        let cluster = Arc::new(fake);

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let err = sched
            .run(cluster.clone(), spec(&["alpha", "beta", "gamma"]), move |_| async move {
                *flag.lock().unwrap() = true;
                Ok(Value::Null)
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ClusterUnavailable);
        assert!(!*ran.lock().unwrap());
        assert!(cluster.pointers.lock().unwrap().values().all(|p| p.is_empty()));
        assert!(cluster.locks.values().all(|l| !l.is_locked()));
    }

    #[tokio::test]
    async fn failed_pointer_cleanup_still_frees_every_lock() {
        let sched = scheduler();
        let mut fake = FakeCluster::new(&["alpha", "beta", "gamma", "delta"]);
        fake.stuck_pointers.insert("beta".into());
        fake.refuse_pointers.insert("delta".into());
        let cluster = Arc::new(fake);

        let err = sched
            .run(cluster.clone(), spec(&["alpha", "beta", "gamma", "delta"]), |_| async move {
                Ok(Value::Null)
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ClusterUnavailable);
        let pointers = cluster.pointers.lock().unwrap().clone();
        assert_eq!(pointers["beta"].len(), 1);
        assert!(pointers["gamma"].is_empty());
        assert!(cluster.locks.values().all(|l| !l.is_locked()));
    }

    #[tokio::test]
    async fn body_can_release_a_peer_before_the_end() {
        let sched = scheduler();
        let cluster = Arc::new(FakeCluster::new(&["alpha", "beta", "gamma"]));

        let inner = Arc::clone(&cluster);
        sched
            .run(cluster.clone(), spec(&["alpha", "beta", "gamma"]), move |ctx| async move {
                ctx.release_node("gamma").await?;
                assert!(!inner.locks["gamma"].is_locked());
                assert!(inner.locks["beta"].is_locked());
                // Releasing twice is harmless; the holder itself cannot go.
                ctx.release_node("gamma").await?;
                let err = ctx.release_node("alpha").await.unwrap_err();
                assert_eq!(err.kind, ErrorKind::InvalidArgument);
                // Gone for good: the end of the task must not touch it.
                inner.down.lock().unwrap().insert("gamma".into());
                Ok(Value::Null)
            })
            .await
            .unwrap();

        assert!(cluster.locks.values().all(|l| !l.is_locked()));
        assert!(cluster.pointers.lock().unwrap().values().all(|p| p.is_empty()));
    }

    #[tokio::test]
    async fn replays_cannot_release_nodes() {
        let sched = scheduler();
        let holder = LockHolder {
            node: "beta".into(),
            task_id: "tsk-b".into(),
        };
        sched.lock_node(&holder).unwrap();
        sched.create_pointer(&holder).unwrap();
        let ctx = sched.pointer_context("tsk-b").unwrap();
        let err = ctx.release_node("gamma").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Bug);
    }

    #[tokio::test]
    async fn queued_task_can_be_cancelled() {
        let sched = scheduler();
        let cluster = Arc::new(FakeCluster::new(&["alpha"]));
        let release = Arc::new(Notify::new());

        let blocker = {
            let sched = Arc::clone(&sched);
            let cluster = Arc::clone(&cluster);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                sched
                    .run(cluster, spec(&["alpha"]), move |_| async move {
                        release.notified().await;
                        Ok(Value::Null)
                    })
                    .await
            })
        };
        let waiting = {
            let sched = Arc::clone(&sched);
            let cluster = Arc::clone(&cluster);
            tokio::spawn(async move {
                sched
                    .run(cluster, spec(&["alpha"]), |_| async move { Ok(Value::Null) })
                    .await
            })
        };

        while sched.queued_tasks().len() < 2 || sched.running_task().is_none() {
            tokio::task::yield_now().await;
        }
        let queued = sched.queued_tasks()[1].clone();
        assert!(sched.cancel_queued(&queued).unwrap());
        assert_eq!(waiting.await.unwrap().unwrap_err().kind, ErrorKind::Cancelled);

        release.notify_one();
        assert!(blocker.await.unwrap().is_ok());
        assert!(sched.queued_tasks().is_empty());
    }

    #[tokio::test]
    async fn cancel_with_nothing_running_clears_stale_lock() {
        let sched = scheduler();
        let stale = LockHolder {
            node: "beta".into(),
            task_id: "tsk-stale".into(),
        };
        sched.lock_node(&stale).unwrap();
        sched.create_pointer(&stale).unwrap();
        let ctx = sched.pointer_context("tsk-stale").unwrap();

        let cluster = Arc::new(FakeCluster::new(&["alpha"]));
        let outcome = sched.cancel_current_task(cluster).await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::Cleared {
                holder: Some(stale),
                pointers: 1
            }
        );
        assert!(ctx.checkpoint().is_err());
        assert!(!sched.node_lock().is_locked());
    }

    #[test]
    fn pointer_requires_matching_lock() {
        let sched = TaskScheduler::new("beta", Arc::new(AuditLog::new(4)));
        let holder = LockHolder {
            node: "alpha".into(),
            task_id: "tsk-1".into(),
        };
        let err = sched.create_pointer(&holder).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);

        sched.lock_node(&holder).unwrap();
        sched.create_pointer(&holder).unwrap();
        assert!(sched.cancel_pointer("tsk-1").unwrap());
        assert!(sched.is_cancelled("tsk-1"));
        assert!(sched.unlock_node(&holder).unwrap());
        assert!(!sched.release_pointer("tsk-1").unwrap());
    }
}
