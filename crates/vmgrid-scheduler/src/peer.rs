//! The scheduler's view of other nodes.

use vmgrid_core::{BoxFuture, GridResult};

use crate::node_lock::LockHolder;

/// Lock and task-pointer operations on one cluster member, which may be
/// the local node itself.
pub trait PeerLink: Send + Sync {
    /// Take `node`'s lock for `holder`. Returns the node's configuration
    /// version.
    fn lock_node<'a>(&'a self, node: &'a str, holder: &'a LockHolder) -> BoxFuture<'a, GridResult<u32>>;

    fn unlock_node<'a>(&'a self, node: &'a str, holder: &'a LockHolder) -> BoxFuture<'a, GridResult<()>>;

    /// Tell `node` that `holder.task_id` is running under its lock.
    fn create_task_pointer<'a>(&'a self, node: &'a str, holder: &'a LockHolder) -> BoxFuture<'a, GridResult<()>>;

    fn release_task_pointer<'a>(&'a self, node: &'a str, task_id: &'a str) -> BoxFuture<'a, GridResult<()>>;

    fn cancel_task_pointer<'a>(&'a self, node: &'a str, task_id: &'a str) -> BoxFuture<'a, GridResult<()>>;
}
