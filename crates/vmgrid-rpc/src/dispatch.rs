//! Request dispatch.
//!
//! ```text
//! request ─► authenticate (session | password, proxy user, lock claim)
//!         ─► registry lookup ─► method declaration ─► permission check
//!         ├─ lock claim accepted ─► replay in place (no queue, no fan-out)
//!         ├─ read                ─► run in place
//!         └─ locking             ─► TaskScheduler::run
//!                                    ├─ remote_nodes: prepare once, replay
//!                                    │  on every target, undo on failure
//!                                    └─ otherwise: run once here
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use vmgrid_auth::{AuthContext, HeldLock, PeerInfo, authenticate, check_permission};
use vmgrid_cluster::{RequestHandler, RpcRequest, RpcResponse};
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult, Permission, UserType};
use vmgrid_scheduler::{AuditStatus, PeerLink, TaskSpec};
use vmgrid_state::ClusterConfig;

use crate::context::CallContext;
use crate::env::Environment;
use crate::fanout;
use crate::lock_service::{LOCK_SERVICE, LockService};
use crate::object::{CallArgs, MethodSpec, RpcObject, method_spec};
use crate::peer_link::EnvPeerLink;
use crate::session_service::{SESSION_SERVICE, SessionService};

pub struct Dispatcher {
    env: Arc<Environment>,
}

impl Dispatcher {
    pub fn new(env: Arc<Environment>) -> Self {
        env.registry().register(LOCK_SERVICE, Arc::new(LockService));
        env.registry().register(SESSION_SERVICE, Arc::new(SessionService));
        Self { env }
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Authenticate and run one wire request.
    pub async fn dispatch(&self, request: RpcRequest, peer: PeerInfo) -> GridResult<Value> {
        let config = self.env.config()?;
        let holder = self.env.scheduler().node_lock().holder();
        let auth = authenticate(
            &request.handshake,
            &config.users,
            self.env.sessions(),
            &peer,
            self.env.node(),
            holder.as_ref().map(|h| HeldLock {
                node: &h.node,
                task_id: &h.task_id,
            }),
        )?;
        let args = CallArgs::from_request(&request);
        self.invoke(auth, &config, &request.object, &request.method, args).await
    }

    /// Run a call on behalf of the daemon itself (timers). User checks are
    /// skipped; locking and fan-out rules still apply.
    pub async fn dispatch_internal(&self, object: &str, method: &str, args: CallArgs) -> GridResult<Value> {
        let config = self.env.config()?;
        let auth = AuthContext::internal(self.env.node());
        self.invoke(auth, &config, object, method, args).await
    }

    async fn invoke(
        &self,
        auth: AuthContext,
        config: &ClusterConfig,
        object_name: &str,
        method: &str,
        args: CallArgs,
    ) -> GridResult<Value> {
        let object = self.env.registry().get(object_name)?;
        let spec = method_spec(object.as_ref(), method)?;
        if let Some(permission) = spec.permission {
            check_permission(&auth, config, permission, object.vm_scope())?;
        }
        let ctx = CallContext::new(Arc::clone(&self.env), auth);

        if ctx.auth().lock_claim {
            return self.run_replay(ctx, object, spec, object_name, args).await;
        }
        if !spec.locking {
            return object.call(&ctx, spec.name, args).await;
        }
        self.run_task(ctx, object, spec, object_name, args, config).await
    }

    /// A call from the lock holder: apply here only. Replays skip the
    /// queue and `prepare`, so only node identities may send them.
    async fn run_replay(
        &self,
        ctx: CallContext,
        object: Arc<dyn RpcObject>,
        spec: MethodSpec,
        object_name: &str,
        args: CallArgs,
    ) -> GridResult<Value> {
        let auth = ctx.auth();
        if !(auth.internal || auth.user_type == UserType::ClusterPeer) {
            warn!(user = %auth.username, object = %object_name, method = spec.name, "replay refused");
            return Err(GridError::insufficient_privileges(format!(
                "user '{}' may not replay calls under the cluster lock",
                auth.username
            )));
        }
        let scheduler = self.env.scheduler();
        let pointer = ctx.auth().task_id.as_deref().and_then(|id| scheduler.pointer_context(id));
        let ctx = match pointer {
            Some(task) => ctx.with_task(task),
            None => ctx,
        }
        .as_replay();
        if !spec.locking {
            return object.call(&ctx, spec.name, args).await;
        }

        let audit = self.env.audit();
        let seq = audit.record(
            ctx.task_id(),
            spec.name,
            &ctx.auth().effective_user,
            object_name,
            object.type_name(),
            AuditStatus::Running,
        );
        let result = object.call(&ctx, spec.name, args).await;
        match &result {
            Ok(_) => audit.transition(seq, AuditStatus::Success, None),
            Err(e) if e.kind == ErrorKind::Cancelled => {
                audit.transition(seq, AuditStatus::Cancelled, Some(&e.to_string()))
            }
            Err(e) => audit.transition(seq, AuditStatus::Failed, Some(&e.to_string())),
        }
        result
    }

    async fn run_task(
        &self,
        ctx: CallContext,
        object: Arc<dyn RpcObject>,
        spec: MethodSpec,
        object_name: &str,
        args: CallArgs,
        config: &ClusterConfig,
    ) -> GridResult<Value> {
        let ignore_failed_nodes = args.ignore_failed_nodes();
        if ignore_failed_nodes {
            check_permission(ctx.auth(), config, Permission::CanIgnoreCluster, None)?;
        }
        let task = TaskSpec {
            object_name: object_name.to_string(),
            object_type: object.type_name().to_string(),
            method: spec.name.to_string(),
            user: ctx.auth().effective_user.clone(),
            nodes: self.env.lock_order()?,
            ignore_failed_nodes,
            expected_version: config.version,
        };
        let link: Arc<dyn PeerLink> = Arc::new(EnvPeerLink::new(Arc::clone(&self.env)));
        let object_name = object_name.to_string();

        self.env
            .scheduler()
            .run(link, task, move |task| async move {
                let ctx = ctx.with_task(task);
                if !spec.remote_nodes {
                    return object.call(&ctx, spec.name, args).await;
                }
                let prepared = object.prepare(&ctx, spec.name, args).await?;
                let targets = fanout::targets(&ctx, &prepared)?;
                fanout::replay(&ctx, &targets, &object_name, spec.name, spec.undo, &prepared).await
            })
            .await
    }
}

impl RequestHandler for Dispatcher {
    fn handle(&self, request: RpcRequest, peer: PeerInfo) -> BoxFuture<'_, RpcResponse> {
        Box::pin(async move {
            let object = request.object.clone();
            let method = request.method.clone();
            let result = self.dispatch(request, peer).await;
            match &result {
                Ok(_) => debug!(%object, %method, "call succeeded"),
                Err(e) if e.kind == ErrorKind::Bug => warn!(%object, %method, error = %e, "call failed"),
                Err(e) => debug!(%object, %method, error = %e, "call failed"),
            }
            RpcResponse::from(result)
        })
    }
}
