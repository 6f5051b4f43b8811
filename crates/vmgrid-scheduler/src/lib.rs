//! vmgrid-scheduler — serialises every state-changing operation.
//!
//! # Architecture
//!
//! ```text
//! TaskScheduler::run(spec, body)
//!   ├── enqueue (QUEUED)           FIFO per node, audit entry recorded
//!   ├── wait for head of queue
//!   ├── cluster_lock::acquire      lock_node on self, then every peer
//!   │     └── version gate         every peer must report our version
//!   ├── distribute task pointers   all-or-nothing
//!   ├── body(TaskContext) (RUNNING) races the cancel flag
//!   └── release pointers, unlock, dequeue, audit SUCCESS/FAILED/CANCELLED
//! ```
//!
//! Peers are reached through the [`PeerLink`] trait, which the RPC layer
//! implements on top of the transport.

pub mod audit;
pub mod cancel;
pub mod cluster_lock;
pub mod node_lock;
pub mod peer;
pub mod task;

pub use audit::{AuditEntry, AuditLog, AuditStatus};
pub use cancel::CancelFlag;
pub use cluster_lock::{ClusterLockGuard, LockPlan};
pub use node_lock::{LockHolder, NodeLock};
pub use peer::PeerLink;
pub use task::{CancelOutcome, TaskContext, TaskScheduler, TaskSpec};
