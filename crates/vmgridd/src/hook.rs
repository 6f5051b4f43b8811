//! The replication post-sync hook.
//!
//! DRBD runs `vmgrid-drbd-hook <0|1>` with `DRBD_RESOURCE` set to the
//! drive id when a resync starts or finishes. The hook logs in with the
//! credentials in `drbd-hook-config.json` and records the drive's sync
//! state through `hard_drive_factory.set_sync_state`, which fans out.
//!
//! The daemon keeps a per-node hook user (`vmgrid-drbd-hook-<node>`,
//! `MANAGE_DRBD` only) and the file in step, recreating both when the
//! user disappears, e.g. after the node joined a cluster.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vmgrid_api::{HARD_DRIVE_FACTORY, USER_MANAGER};
use vmgrid_auth::{Handshake, random_token, verify_password};
use vmgrid_cluster::{RpcRequest, Target, Transport};
use vmgrid_core::{ErrorKind, GridError, GridResult, Permission};
use vmgrid_rpc::{CallArgs, Dispatcher};
use vmgrid_state::SyncState;

/// How often the daemon checks the hook credentials.
pub const PROVISION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl HookConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write owner-readable only.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

pub fn hook_username(node: &str) -> String {
    format!("vmgrid-drbd-hook-{node}")
}

/// DRBD passes `1` once a resync finished and `0` when one starts.
pub fn sync_state_from_arg(arg: &str) -> GridResult<SyncState> {
    match arg {
        "1" => Ok(SyncState::InSync),
        "0" => Ok(SyncState::OutOfSync),
        other => Err(GridError::invalid_argument(format!("expected 0 or 1, got '{other}'"))),
    }
}

/// Make sure the hook user exists with the password in the hook file.
/// Returns `true` when anything had to change.
pub async fn provision_hook_credentials(dispatcher: &Dispatcher) -> GridResult<bool> {
    let env = dispatcher.env();
    let settings = env.settings();
    let path = settings.drbd_hook_config_path();
    let username = hook_username(env.node());
    let config = env.config()?;

    let existing = config.users.get(&username);
    if let Ok(hook) = HookConfig::load(&path)
        && hook.username == username
        && existing.is_some_and(|user| match (&user.password, &user.salt) {
            (Some(hash), Some(salt)) => verify_password(&hook.password, hash, salt),
            _ => false,
        })
    {
        return Ok(false);
    }

    let password = random_token()?;
    if existing.is_some() {
        dispatcher
            .dispatch_internal(USER_MANAGER, "set_password", CallArgs::new().arg(username.as_str()).arg(password.as_str()))
            .await?;
    } else {
        dispatcher
            .dispatch_internal(USER_MANAGER, "create", CallArgs::new().arg(username.as_str()).arg(password.as_str()))
            .await?;
        dispatcher
            .dispatch_internal(
                USER_MANAGER,
                "add_permission",
                CallArgs::new().arg(username.as_str()).arg(Permission::ManageDrbd.as_str()),
            )
            .await?;
    }

    let host = match settings.listen.address.as_str() {
        "" | "0.0.0.0" => "127.0.0.1".to_string(),
        "::" => "::1".to_string(),
        address => address.to_string(),
    };
    let hook = HookConfig {
        username,
        password,
        host,
        port: settings.listen.port,
    };
    hook.save(&path)
        .map_err(|e| GridError::bug(format!("write {}: {e:#}", path.display())))?;
    info!(user = %hook.username, path = %path.display(), "replication hook credentials provisioned");
    Ok(true)
}

/// Check the hook credentials now and every [`PROVISION_INTERVAL`].
pub async fn run_hook_provisioning(dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
    loop {
        match provision_hook_credentials(&dispatcher).await {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::LockContended => debug!(error = %e, "hook provisioning deferred"),
            Err(e) => warn!(error = %e, "hook provisioning failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(PROVISION_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// Record the sync state of `resource` (a drive id) on the node at `target`.
pub async fn report_sync_state(
    transport: &dyn Transport,
    target: &Target,
    hook: &HookConfig,
    resource: &str,
    state: SyncState,
) -> GridResult<()> {
    let request = RpcRequest::new(HARD_DRIVE_FACTORY, "set_sync_state")
        .arg(resource)
        .arg(json!(state))
        .with_handshake(Handshake::password(&hook.username, &hook.password));
    transport.call(target, request).await?;
    info!(%resource, ?state, "sync state reported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn hook_file_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node/drbd-hook-config.json");
        let hook = HookConfig {
            username: "vmgrid-drbd-hook-alpha".into(),
            password: "pw".into(),
            host: "127.0.0.1".into(),
            port: 8089,
        };
        hook.save(&path).unwrap();
        assert_eq!(HookConfig::load(&path).unwrap(), hook);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn drbd_arguments() {
        assert_eq!(sync_state_from_arg("1").unwrap(), SyncState::InSync);
        assert_eq!(sync_state_from_arg("0").unwrap(), SyncState::OutOfSync);
        assert_eq!(sync_state_from_arg("yes").unwrap_err().kind, ErrorKind::InvalidArgument);
    }
}
