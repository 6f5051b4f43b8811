//! vmgrid-core — shared leaf types for VMGrid.
//!
//! Everything here is used by more than one crate in the workspace:
//!
//! - [`GridError`] / [`ErrorKind`]: the error taxonomy that crosses the wire
//! - [`id`]: opaque entity identifiers (`vm-…`, `hd-…`, `gp-…`, `tsk-…`)
//! - [`identity`]: the canonical node identity persisted to disk
//! - [`permission`]: the closed permission enumeration and user types
//! - [`settings`]: the daemon settings file (`vmgridd.toml`)
//! - [`validate`]: name/address validators
//! - [`hypervisor`]: the narrow interface to libvirt, LVM and DRBD

pub mod error;
pub mod hypervisor;
pub mod id;
pub mod identity;
pub mod permission;
pub mod settings;
pub mod validate;

use std::future::Future;
use std::pin::Pin;

pub use error::{ErrorKind, GridError, GridResult, PeerCause};
pub use identity::NodeIdentity;
pub use permission::{Permission, UserType};
pub use settings::DaemonSettings;

/// Boxed, sendable future used at the trait-object seams of the workspace.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
