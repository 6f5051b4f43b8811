//! Node assembly: everything `vmgridd run` builds before it serves.
//!
//! ```text
//!  settings ─► identity ─► config.json ─► migrate ─► certificates
//!                 (create on first start)                 │
//!  transport, hypervisor, stats ─────────► Environment ◄──┘
//!                                              │
//!                                   objects ─► Dispatcher
//! ```

use std::ffi::CStr;
use std::sync::Arc;

use tracing::{info, warn};
use vmgrid_api::{HostStatsSource, register_services};
use vmgrid_auth::hash_password;
use vmgrid_cluster::{CertificateStore, Transport};
use vmgrid_core::hypervisor::Hypervisor;
use vmgrid_core::validate::validate_username;
use vmgrid_core::{DaemonSettings, NodeIdentity, Permission, UserType};
use vmgrid_rpc::{Collaborators, Dispatcher, Environment};
use vmgrid_state::migration::load_and_migrate;
use vmgrid_state::{ClusterConfig, ConfigDocument, HostStatsStore, UserConfig};

/// The kernel's host name, compared against the stored node identity.
pub fn socket_hostname() -> anyhow::Result<String> {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is writable for its full length and NUL-terminated below.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: the last byte is still zero.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

/// The address peers reach this node on.
pub fn advertised_address(settings: &DaemonSettings, node: &NodeIdentity) -> String {
    match settings.listen.address.as_str() {
        "" | "0.0.0.0" | "::" => node.as_str().to_string(),
        address => address.to_string(),
    }
}

/// Open the node's configuration, creating a one-member cluster on first
/// start and migrating older documents to the current version.
pub fn open_configuration(settings: &DaemonSettings, node: &NodeIdentity) -> anyhow::Result<ConfigDocument> {
    let path = settings.config_path();
    let document = if path.exists() {
        ConfigDocument::open(&path)?
    } else {
        let address = advertised_address(settings, node);
        let initial = ClusterConfig::initial(node.as_str(), &address, settings.listen.port);
        info!(path = %path.display(), node = node.as_str(), %address, "creating initial configuration");
        ConfigDocument::create(&path, &initial.to_value()?)?
    };

    let config = load_and_migrate(&document)?;
    if !config.cluster.nodes.contains_key(node.as_str()) {
        warn!(node = node.as_str(), "this node is not a member of its own configuration");
    }
    info!(
        version = document.version()?,
        members = config.cluster.nodes.len(),
        vms = config.virtual_machines.len(),
        "configuration loaded"
    );
    Ok(document)
}

/// The node's CA and server certificate, generated on first use.
pub fn certificates(settings: &DaemonSettings, node: &NodeIdentity) -> anyhow::Result<Arc<CertificateStore>> {
    let certs = Arc::new(CertificateStore::new(&settings.ssl_dir(), node.as_str()));
    certs.ensure(&[advertised_address(settings, node), "127.0.0.1".to_string()])?;
    Ok(certs)
}

/// Add a LOCAL superuser to a configuration that has not been served yet.
/// Used by `vmgridd init`; running nodes manage users through the
/// replicated `user_manager`.
pub fn seed_admin(document: &ConfigDocument, username: &str, password: &str) -> anyhow::Result<()> {
    validate_username(username)?;
    let stored = hash_password(password)?;
    document.update(&format!("seed admin {username}"), |value| {
        let mut config = ClusterConfig::from_value(value.clone())?;
        config.users.insert(
            username.to_string(),
            UserConfig {
                user_type: UserType::Local,
                password: Some(stored.hash.clone()),
                salt: Some(stored.salt.clone()),
                global_permissions: vec![Permission::Superuser],
                node: None,
            },
        );
        *value = config.to_value()?;
        Ok(())
    })?;
    info!(user = %username, "administrator created");
    Ok(())
}

/// Collaborators that differ between a real node and a test node.
pub struct Parts {
    pub certs: Arc<CertificateStore>,
    pub transport: Arc<dyn Transport>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub host_stats: HostStatsStore,
    pub stats_source: Arc<dyn HostStatsSource>,
}

/// Build the environment around an opened configuration and register
/// every object.
pub fn assemble(
    settings: DaemonSettings,
    node: &NodeIdentity,
    document: ConfigDocument,
    parts: Parts,
) -> anyhow::Result<Arc<Dispatcher>> {
    let env = Arc::new(Environment::new(
        node.as_str(),
        settings,
        document,
        Collaborators {
            certs: parts.certs,
            transport: parts.transport,
            hypervisor: parts.hypervisor,
            host_stats: parts.host_stats,
        },
    )?);
    register_services(&env, parts.stats_source)?;
    info!(node = node.as_str(), objects = env.registry().names().len(), "node assembled");
    Ok(Arc::new(Dispatcher::new(env)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> DaemonSettings {
        DaemonSettings::rooted_at(dir)
    }

    #[test]
    fn first_start_creates_a_one_member_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let node = NodeIdentity::new("alpha").unwrap();

        let document = open_configuration(&settings, &node).unwrap();
        let config: ClusterConfig = document.get_typed().unwrap();
        assert_eq!(config.node_names(), vec!["alpha"]);
        assert_eq!(config.cluster.nodes["alpha"].ip, "alpha");
        assert_eq!(config.cluster.nodes["alpha"].port, settings.listen.port);

        // A second start reuses the document.
        drop(document);
        let again = open_configuration(&settings, &node).unwrap();
        assert_eq!(again.get_typed::<ClusterConfig>().unwrap().node_names(), vec!["alpha"]);
    }

    #[test]
    fn explicit_listen_address_is_advertised() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.listen.address = "10.0.0.5".to_string();
        let node = NodeIdentity::new("alpha").unwrap();
        assert_eq!(advertised_address(&settings, &node), "10.0.0.5");
    }

    #[test]
    fn seeded_admin_is_a_superuser() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let node = NodeIdentity::new("alpha").unwrap();
        let document = open_configuration(&settings, &node).unwrap();

        seed_admin(&document, "admin", "secret").unwrap();
        let config: ClusterConfig = document.get_typed().unwrap();
        let admin = &config.users["admin"];
        assert_eq!(admin.global_permissions, vec![Permission::Superuser]);
        assert!(vmgrid_auth::verify_password(
            "secret",
            admin.password.as_deref().unwrap(),
            admin.salt.as_deref().unwrap()
        ));

        assert!(seed_admin(&document, "bad name", "x").is_err());
    }

    #[test]
    fn hostname_is_readable() {
        assert!(!socket_hostname().unwrap().is_empty());
    }
}
