//! All-or-nothing replay across nodes.
//!
//! `all_or_nothing` applies a step on each node in order. When node k
//! fails, the undo step runs on nodes k-1 … 0 and the original error is
//! returned with node k and every failed undo attached as peer causes.
//! Undo failures are logged and never retried.

use std::future::Future;

use serde_json::Value;
use tracing::{error, info, warn};
use vmgrid_core::{GridError, GridResult};

use crate::context::CallContext;
use crate::object::CallArgs;

pub async fn all_or_nothing<T, D, DF, U, UF>(nodes: &[String], mut apply: D, mut revert: U) -> GridResult<Vec<(String, T)>>
where
    D: FnMut(String) -> DF,
    DF: Future<Output = GridResult<T>>,
    U: FnMut(String) -> UF,
    UF: Future<Output = GridResult<()>>,
{
    let mut done: Vec<(String, T)> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match apply(node.clone()).await {
            Ok(value) => done.push((node.clone(), value)),
            Err(e) => {
                warn!(%node, error = %e, reverted = done.len(), "step failed, reverting");
                let mut err = e.clone().with_peer_cause(node, &e);
                for (prev, _) in done.iter().rev() {
                    if let Err(undo_err) = revert(prev.clone()).await {
                        error!(node = %prev, error = %undo_err, "undo failed");
                        err = err.with_peer_cause(prev, &undo_err);
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(done)
}

/// Replay `object.method` on each of `nodes` with the same arguments,
/// reverting through `undo` on failure. Returns this node's result, or the
/// first node's when this node is not a target.
pub async fn replay(
    ctx: &CallContext,
    nodes: &[String],
    object: &str,
    method: &str,
    undo: Option<&str>,
    args: &CallArgs,
) -> GridResult<Value> {
    let args = &args.for_replay();
    let results = all_or_nothing(
        nodes,
        |node| async move {
            ctx.checkpoint()?;
            ctx.call_node(&node, object, method, args.clone()).await
        },
        |node| async move {
            match undo {
                Some(undo) => ctx.call_node(&node, object, undo, args.clone()).await.map(|_| ()),
                None => {
                    warn!(%node, %object, %method, "no undo declared, node left as is");
                    Ok(())
                }
            }
        },
    )
    .await?;

    info!(%object, %method, nodes = results.len(), "replayed");
    let local = results.iter().position(|(n, _)| n == ctx.node()).unwrap_or(0);
    results
        .into_iter()
        .nth(local)
        .map(|(_, v)| v)
        .ok_or_else(|| GridError::bug(format!("{object}.{method} replayed on no node")))
}

/// The nodes a fan-out reaches: the caller's explicit `nodes`, or every
/// member under the lock. Members skipped as unreachable are left out.
pub fn targets(ctx: &CallContext, args: &CallArgs) -> GridResult<Vec<String>> {
    let skipped = ctx.task().map(|t| t.skipped_nodes().to_vec()).unwrap_or_default();
    let nodes = match args.nodes()? {
        Some(nodes) => nodes,
        None => match ctx.task() {
            Some(task) => task.locked_nodes().to_vec(),
            None => vec![ctx.node().to_string()],
        },
    };
    Ok(nodes.into_iter().filter(|n| !skipped.contains(n)).collect())
}
