//! vmgrid-state — configuration store for VMGrid.
//!
//! The cluster configuration is one JSON document per node, replaced
//! atomically on every mutation. Readers get deep copies; writers pass a
//! pure update callback that runs under an exclusive file lock.
//!
//! # Architecture
//!
//! ```text
//! ConfigDocument (config.json)
//!   ├── get()            → deep copy of the whole document
//!   ├── update(reason,f) → flock, read, f(copy), fsync temp, rename
//!   └── view(path)       → SubtreeView: get/update one key path
//! migration
//!   └── load_and_migrate() → v17 … CURRENT_VERSION, written back atomically
//! HostStatsStore (stats.redb)
//!   └── time series of host CPU/memory samples
//! ```
//!
//! The typed schema for the current version lives in [`types`].

pub mod document;
pub mod error;
pub mod lockfile;
pub mod migration;
pub mod stats;
pub mod types;
pub mod view;

pub use document::ConfigDocument;
pub use error::{StateError, StateResult};
pub use migration::{CURRENT_VERSION, OLDEST_SUPPORTED_VERSION};
pub use stats::{HostStatsSample, HostStatsStore};
pub use types::*;
pub use view::SubtreeView;
