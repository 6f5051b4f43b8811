//! vmgrid-rpc — object registry and call dispatch for VMGrid.
//!
//! Every node exposes the same set of named objects. A call is
//! authenticated, checked against the method's declared permission, then
//! run in place (reads, replays from the lock holder) or as a task under
//! the cluster lock (writes). Writes declared `remote_nodes` are replayed
//! on every target node and reverted through their undo method when any
//! node fails.
//!
//! The [`Environment`] holds all per-node state and is handed to objects
//! through their [`CallContext`]; [`local`] wires several environments
//! into one in-process cluster.

pub mod context;
pub mod dispatch;
pub mod env;
pub mod fanout;
pub mod local;
pub mod lock_service;
pub mod object;
pub mod peer_link;
pub mod registry;
pub mod session_service;

pub use context::CallContext;
pub use dispatch::Dispatcher;
pub use env::{Collaborators, Environment};
pub use object::{CallArgs, MethodSpec, RpcObject};
pub use peer_link::EnvPeerLink;
pub use registry::{ObjectRegistry, RemoteHandle};
