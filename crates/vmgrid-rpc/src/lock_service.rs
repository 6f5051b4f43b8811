//! The `node_lock` object: lock and task-pointer plumbing that the lock
//! holder calls on every member.

use serde_json::{Value, json};
use tracing::info;
use vmgrid_core::{BoxFuture, GridError, GridResult, UserType};
use vmgrid_scheduler::LockHolder;

use crate::context::CallContext;
use crate::object::{CallArgs, MethodSpec, RpcObject, unknown_method};

pub const LOCK_SERVICE: &str = "node_lock";

const METHODS: &[MethodSpec] = &[
    MethodSpec::read("lock_node"),
    MethodSpec::read("unlock_node"),
    MethodSpec::read("create_task_pointer"),
    MethodSpec::read("release_task_pointer"),
    MethodSpec::read("cancel_task_pointer"),
    MethodSpec::read("holder"),
];

pub struct LockService;

impl LockService {
    /// Only node identities may touch the lock, and a cluster peer only on
    /// behalf of its own node.
    fn authorize(ctx: &CallContext, holder: Option<&LockHolder>) -> GridResult<()> {
        let auth = ctx.auth();
        if auth.internal {
            return Ok(());
        }
        if !auth.is_node_identity() {
            return Err(GridError::insufficient_privileges("node lock is reserved for cluster members"));
        }
        if auth.user_type == UserType::Bootstrap {
            return Ok(());
        }
        let config = ctx.config()?;
        let caller_node = config.users.get(&auth.username).and_then(|u| u.node.as_deref());
        match holder {
            Some(h) if caller_node != Some(h.node.as_str()) => Err(GridError::insufficient_privileges(format!(
                "'{}' may not act for node '{}'",
                auth.username, h.node
            ))),
            _ => Ok(()),
        }
    }
}

impl RpcObject for LockService {
    fn type_name(&self) -> &'static str {
        "NodeLock"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            let scheduler = ctx.env().scheduler();
            match method {
                "lock_node" => {
                    let holder: LockHolder = args.get(0, "holder")?;
                    Self::authorize(ctx, Some(&holder))?;
                    scheduler.lock_node(&holder)?;
                    Ok(json!(ctx.env().document().version()?))
                }
                "unlock_node" => {
                    let holder: LockHolder = args.get(0, "holder")?;
                    Self::authorize(ctx, Some(&holder))?;
                    Ok(json!(scheduler.unlock_node(&holder)?))
                }
                "create_task_pointer" => {
                    let holder: LockHolder = args.get(0, "holder")?;
                    Self::authorize(ctx, Some(&holder))?;
                    scheduler.create_pointer(&holder)?;
                    Ok(Value::Null)
                }
                "release_task_pointer" => {
                    Self::authorize(ctx, None)?;
                    let task_id: String = args.get(0, "task_id")?;
                    Ok(json!(scheduler.release_pointer(&task_id)?))
                }
                "cancel_task_pointer" => {
                    Self::authorize(ctx, None)?;
                    let task_id: String = args.get(0, "task_id")?;
                    let cancelled = scheduler.cancel_pointer(&task_id)?;
                    info!(task = %task_id, cancelled, "cancel requested by lock holder");
                    Ok(json!(cancelled))
                }
                "holder" => Ok(serde_json::to_value(scheduler.node_lock().holder())?),
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}
