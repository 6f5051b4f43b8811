//! The `task_scheduler` object: what this node is running, its audit log,
//! and cancellation.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::info;
use vmgrid_core::{BoxFuture, GridResult, Permission};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, EnvPeerLink, MethodSpec, RpcObject};

// Cancellation must not queue behind the task it cancels, so none of these
// methods lock.
const METHODS: &[MethodSpec] = &[
    MethodSpec::read("running"),
    MethodSpec::read("queued"),
    MethodSpec::read("audit"),
    MethodSpec::read("cancel_current_task").requires(Permission::ManageCluster),
    MethodSpec::read("cancel_task").requires(Permission::ManageCluster),
];

pub struct TaskService;

impl RpcObject for TaskService {
    fn type_name(&self) -> &'static str {
        "TaskScheduler"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            let scheduler = ctx.env().scheduler();
            match method {
                "running" => Ok(json!(scheduler.running_task())),
                "queued" => Ok(json!(scheduler.queued_tasks())),
                "audit" => {
                    let limit: Option<usize> = args.opt(0, "limit")?;
                    let mut entries = ctx.env().audit().entries();
                    if let Some(limit) = limit {
                        let skip = entries.len().saturating_sub(limit);
                        entries.drain(..skip);
                    }
                    Ok(serde_json::to_value(entries)?)
                }
                "cancel_current_task" => {
                    let link = Arc::new(EnvPeerLink::new(Arc::clone(ctx.env())));
                    let outcome = scheduler.cancel_current_task(link).await?;
                    info!(user = %ctx.auth().effective_user, ?outcome, "cancel requested");
                    Ok(serde_json::to_value(outcome)?)
                }
                "cancel_task" => {
                    let task_id: String = args.get(0, "task_id")?;
                    Ok(json!(scheduler.cancel_queued(&task_id)?))
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}
