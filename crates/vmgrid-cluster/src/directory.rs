//! Name directory: where each node listens, and which objects exist.
//!
//! Objects are published under stable names on every node, so a remote
//! object is addressed by `(node, name)` and resolves to
//! `vmgrid://<host>:<port>/<name>`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use vmgrid_core::{ErrorKind, GridError, GridResult};
use vmgrid_state::ClusterConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Node identity, also the TLS server name.
    pub node: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(node: &str, host: &str, port: u16) -> Self {
        Self {
            node: node.to_string(),
            host: host.to_string(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uri(&self, object: &str) -> String {
        format!("vmgrid://{}:{}/{}", self.host, self.port, object)
    }
}

#[derive(Debug, Default)]
pub struct NameDirectory {
    nodes: RwLock<BTreeMap<String, Endpoint>>,
    published: RwLock<BTreeSet<String>>,
}

impl NameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node(&self, endpoint: Endpoint) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(endpoint.node.clone(), endpoint);
        }
    }

    pub fn remove_node(&self, node: &str) -> bool {
        self.nodes
            .write()
            .map(|mut nodes| nodes.remove(node).is_some())
            .unwrap_or(false)
    }

    pub fn endpoint(&self, node: &str) -> Option<Endpoint> {
        self.nodes.read().ok()?.get(node).cloned()
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes
            .read()
            .map(|nodes| nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the node table with the members recorded in `config`.
    pub fn sync_from_config(&self, config: &ClusterConfig) {
        if let Ok(mut nodes) = self.nodes.write() {
            *nodes = config
                .cluster
                .nodes
                .iter()
                .map(|(name, entry)| (name.clone(), Endpoint::new(name, &entry.ip, entry.port)))
                .collect();
        }
    }

    pub fn publish(&self, object: &str) {
        if let Ok(mut published) = self.published.write() {
            published.insert(object.to_string());
        }
    }

    pub fn unpublish(&self, object: &str) {
        if let Ok(mut published) = self.published.write() {
            published.remove(object);
        }
    }

    pub fn is_published(&self, object: &str) -> bool {
        self.published
            .read()
            .map(|p| p.contains(object))
            .unwrap_or(false)
    }

    /// Resolve `object` on `node` to its endpoint and URI. Every node
    /// serves the same names, so `object` need not be published here; the
    /// peer answers `ObjectNotFound` for names it lacks.
    pub fn lookup(&self, node: &str, object: &str) -> GridResult<(Endpoint, String)> {
        let endpoint = self.endpoint(node).ok_or_else(|| {
            GridError::new(ErrorKind::PeerUnreachable, format!("node '{node}' is not in the directory"))
        })?;
        let uri = endpoint.uri(object);
        Ok((endpoint, uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_builds_uri() {
        let dir = NameDirectory::new();
        dir.set_node(Endpoint::new("alpha", "10.0.0.1", 8089));
        dir.publish("cluster");

        let (endpoint, uri) = dir.lookup("alpha", "cluster").unwrap();
        assert_eq!(endpoint.address(), "10.0.0.1:8089");
        assert_eq!(uri, "vmgrid://10.0.0.1:8089/cluster");

        // Names removed here still resolve on the peer.
        let (_, uri) = dir.lookup("alpha", "vm-gone").unwrap();
        assert_eq!(uri, "vmgrid://10.0.0.1:8089/vm-gone");
        assert_eq!(dir.lookup("beta", "cluster").unwrap_err().kind, ErrorKind::PeerUnreachable);
    }

    #[test]
    fn sync_replaces_node_table() {
        let dir = NameDirectory::new();
        dir.set_node(Endpoint::new("stale", "10.9.9.9", 1));
        let mut cfg = ClusterConfig::initial("alpha", "10.0.0.1", 8089);
        cfg.cluster.nodes.insert(
            "beta".into(),
            vmgrid_state::NodeEntry { ip: "10.0.0.2".into(), port: 9000, fingerprint: String::new() },
        );
        dir.sync_from_config(&cfg);
        assert_eq!(dir.nodes(), vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(dir.endpoint("beta").unwrap().port, 9000);
    }
}
