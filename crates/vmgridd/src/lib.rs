//! vmgridd — one node of a VMGrid cluster.
//!
//! The binary wires the crates together; this library holds the pieces
//! the binaries share and the integration tests drive:
//! - [`assembly`]: settings → identity → configuration → environment
//! - [`hook`]: credentials and client side of the replication post-sync hook
//! - [`logging`]: tracing subscriber set-up

pub mod assembly;
pub mod hook;
pub mod logging;

pub use assembly::{Parts, advertised_address, assemble, certificates, open_configuration, seed_admin, socket_hostname};
pub use hook::{HookConfig, provision_hook_credentials, report_sync_state, run_hook_provisioning};
