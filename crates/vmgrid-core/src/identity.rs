//! Canonical node identity.
//!
//! The identity is persisted once and from then on keys the node
//! everywhere: peer maps, certificate subjects, per-node overrides. The
//! socket hostname is checked against it at start-up so a renamed host is
//! caught before it can corrupt cluster state.

use std::fmt;
use std::path::Path;

use tracing::info;

use crate::error::{ErrorKind, GridError, GridResult};
use crate::validate::validate_hostname;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Build an identity without touching disk (used by tests and tools).
    pub fn new(name: &str) -> GridResult<Self> {
        validate_hostname(name)?;
        Ok(Self(name.to_string()))
    }

    /// Load the identity from `path`, creating it from `socket_hostname`
    /// on first start.
    ///
    /// Fails with `InvalidHostname` if the stored identity no longer matches
    /// the host name.
    pub fn load_or_init(path: &Path, socket_hostname: &str) -> GridResult<Self> {
        let socket_hostname = socket_hostname.trim();
        match std::fs::read_to_string(path) {
            Ok(stored) => {
                let stored = stored.trim();
                if stored != socket_hostname {
                    return Err(GridError::new(
                        ErrorKind::InvalidHostname,
                        format!(
                            "host name '{socket_hostname}' does not match node identity '{stored}'"
                        ),
                    ));
                }
                Self::new(stored)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::new(socket_hostname)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| GridError::bug(format!("create identity dir: {e}")))?;
                }
                std::fs::write(path, format!("{socket_hostname}\n"))
                    .map_err(|e| GridError::bug(format!("write node identity: {e}")))?;
                info!(node = %socket_hostname, "node identity initialised");
                Ok(identity)
            }
            Err(e) => Err(GridError::bug(format!("read node identity: {e}"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_start_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostname.conf");

        let id = NodeIdentity::load_or_init(&path, "alpha").unwrap();
        assert_eq!(id.as_str(), "alpha");
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "alpha");

        let again = NodeIdentity::load_or_init(&path, "alpha\n").unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn renamed_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostname.conf");
        NodeIdentity::load_or_init(&path, "alpha").unwrap();

        let err = NodeIdentity::load_or_init(&path, "beta").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidHostname);
    }

    #[test]
    fn invalid_hostname_rejected() {
        assert!(NodeIdentity::new("not a host").is_err());
    }
}
