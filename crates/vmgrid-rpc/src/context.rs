//! What a method body sees: the environment, the authenticated caller and,
//! for locking calls, the running task.

use std::sync::Arc;

use serde_json::Value;
use vmgrid_auth::{AuthContext, Handshake, check_permission};
use vmgrid_cluster::{RpcRequest, Target};
use vmgrid_core::{GridResult, Permission};
use vmgrid_scheduler::TaskContext;
use vmgrid_state::ClusterConfig;

use crate::env::Environment;
use crate::object::CallArgs;

#[derive(Clone)]
pub struct CallContext {
    env: Arc<Environment>,
    auth: AuthContext,
    task: Option<TaskContext>,
    replay: bool,
    node_authority: bool,
}

impl CallContext {
    pub fn new(env: Arc<Environment>, auth: AuthContext) -> Self {
        Self {
            env,
            auth,
            task: None,
            replay: false,
            node_authority: false,
        }
    }

    pub fn with_task(mut self, task: TaskContext) -> Self {
        self.task = Some(task);
        self
    }

    /// The same call, applied to this node only.
    pub fn as_replay(&self) -> Self {
        Self {
            replay: true,
            ..self.clone()
        }
    }

    /// The same call, but peers are called as this node rather than for
    /// the user. Only for steps whose permission was checked here.
    pub fn with_node_authority(&self) -> Self {
        Self {
            node_authority: true,
            ..self.clone()
        }
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn node(&self) -> &str {
        self.env.node()
    }

    pub fn task(&self) -> Option<&TaskContext> {
        self.task.as_ref()
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task
            .as_ref()
            .map(TaskContext::task_id)
            .or(self.auth.task_id.as_deref())
    }

    /// Applying a call that another node (or this one) fans out.
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// Running under the cluster lock, here or on the holder's behalf.
    pub fn under_lock(&self) -> bool {
        self.task.is_some() || self.auth.lock_claim
    }

    /// Fail with `Cancelled` if the task behind this call was cancelled.
    pub fn checkpoint(&self) -> GridResult<()> {
        match &self.task {
            Some(task) => task.checkpoint(),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> GridResult<ClusterConfig> {
        self.env.config()
    }

    pub fn require(&self, permission: Permission, vm_id: Option<&str>) -> GridResult<()> {
        check_permission(&self.auth, &self.env.config()?, permission, vm_id)
    }

    /// The user a peer should act for, if the caller is not a node itself.
    pub fn proxy_user(&self) -> Option<&str> {
        if self.node_authority || self.auth.internal || self.auth.is_node_identity() {
            None
        } else {
            Some(&self.auth.effective_user)
        }
    }

    /// What a peer call made for this call claims on top of the peer
    /// identity: the user acted for and, under the lock, the task.
    pub fn peer_claims(&self) -> Handshake {
        let claims = Handshake::default().with_proxy_user(self.proxy_user());
        if self.under_lock() {
            claims.with_lock_claim(self.task_id())
        } else {
            claims
        }
    }

    /// Apply `object.method` on `node` alone. The local node is called in
    /// process; peers through a remote handle.
    pub async fn call_node(&self, node: &str, object: &str, method: &str, args: CallArgs) -> GridResult<Value> {
        if node == self.node() {
            let target = self.env.registry().get(object)?;
            return target.call(&self.as_replay(), method, args).await;
        }
        self.env.call_peer(node, object, method, args, &self.peer_claims()).await
    }

    /// Call a node that is not yet a cluster member, trusting `target`'s
    /// bootstrap CA and presenting `handshake` verbatim.
    pub async fn call_target(
        &self,
        target: &Target,
        handshake: Handshake,
        object: &str,
        method: &str,
        args: CallArgs,
    ) -> GridResult<Value> {
        let request: RpcRequest = args.into_request(object, method).with_handshake(handshake);
        self.env.transport().call(target, request).await
    }
}
