//! The narrow interface to the hypervisor host: libvirt domains, LVM
//! volumes, DRBD resources and bridge networks.
//!
//! Implementations catch their own failures, log the raw message, and
//! return `LibvirtFailure` or `ExternalCommandFailed`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::BoxFuture;
use crate::error::{ErrorKind, GridError, GridResult};

/// Everything needed to define a domain on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub id: String,
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mib: u64,
    /// Block device paths, in attachment order.
    pub disks: Vec<String>,
    /// `(mac, bridge interface)` pairs.
    pub interfaces: Vec<(String, String)>,
}

/// Replication settings for a DRBD-backed volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSpec {
    pub resource: String,
    pub minor: u32,
    pub port: u16,
    pub peers: Vec<String>,
}

/// A logical volume on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub id: String,
    /// Volume group (LVM) or directory (file backend).
    pub location: String,
    pub name: String,
    pub size_mib: u64,
    pub replication: Option<ReplicationSpec>,
}

impl VolumeSpec {
    /// Device path the domain attaches.
    pub fn device_path(&self) -> String {
        match &self.replication {
            Some(r) => format!("/dev/drbd{}", r.minor),
            None => format!("/dev/{}/{}", self.location, self.name),
        }
    }
}

pub trait Hypervisor: Send + Sync {
    fn define_domain<'a>(&'a self, spec: &'a DomainSpec) -> BoxFuture<'a, GridResult<()>>;
    fn undefine_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>>;
    fn rename_domain<'a>(&'a self, vm_id: &'a str, new_name: &'a str) -> BoxFuture<'a, GridResult<()>>;
    fn start_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>>;
    fn stop_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>>;
    fn reset_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>>;
    fn is_running<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<bool>>;

    fn create_volume<'a>(&'a self, spec: &'a VolumeSpec) -> BoxFuture<'a, GridResult<()>>;
    fn delete_volume<'a>(&'a self, spec: &'a VolumeSpec) -> BoxFuture<'a, GridResult<()>>;

    fn define_network<'a>(&'a self, name: &'a str, interface: &'a str) -> BoxFuture<'a, GridResult<()>>;
    fn undefine_network<'a>(&'a self, name: &'a str) -> BoxFuture<'a, GridResult<()>>;
}

// ── NullHypervisor ─────────────────────────────────────────────────

/// Keeps domains, volumes and networks in memory and records every call.
/// Used on development clusters without KVM and in tests, where
/// individual operations can be made to fail.
#[derive(Debug, Default)]
pub struct NullHypervisor {
    state: Mutex<NullState>,
}

#[derive(Debug, Default)]
struct NullState {
    calls: Vec<String>,
    domains: BTreeSet<String>,
    running: BTreeSet<String>,
    volumes: BTreeSet<String>,
    networks: BTreeSet<String>,
    failing: BTreeSet<String>,
    held: BTreeMap<String, watch::Sender<bool>>,
}

impl NullHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `operation` fail with `LibvirtFailure`.
    pub fn fail_on(&self, operation: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(operation.to_string());
        }
    }

    /// Make later calls of `operation` wait, after taking effect, until
    /// [`release`](Self::release).
    pub fn hold(&self, operation: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.held.insert(operation.to_string(), watch::channel(false).0);
        }
    }

    pub fn release(&self, operation: &str) {
        if let Some(gate) = self.state.lock().ok().and_then(|mut s| s.held.remove(operation)) {
            gate.send_replace(true);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.clear();
        }
    }

    /// Calls so far, as `"<operation> <subject>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn has_domain(&self, vm_id: &str) -> bool {
        self.state.lock().is_ok_and(|s| s.domains.contains(vm_id))
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().is_ok_and(|s| s.volumes.contains(name))
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().is_ok_and(|s| s.networks.contains(name))
    }

    async fn invoke<T>(
        &self,
        operation: &str,
        subject: &str,
        f: impl FnOnce(&mut NullState) -> GridResult<T>,
    ) -> GridResult<T> {
        let result = self.apply(operation, subject, f);
        let gate = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.held.get(operation).map(watch::Sender::subscribe));
        if let Some(mut gate) = gate {
            debug!(%operation, %subject, "null hypervisor call held");
            let _ = gate.wait_for(|released| *released).await;
        }
        result
    }

    fn apply<T>(&self, operation: &str, subject: &str, f: impl FnOnce(&mut NullState) -> GridResult<T>) -> GridResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| GridError::bug("null hypervisor state poisoned"))?;
        state.calls.push(format!("{operation} {subject}"));
        debug!(%operation, %subject, "null hypervisor call");
        if state.failing.contains(operation) {
            return Err(GridError::new(
                ErrorKind::LibvirtFailure,
                format!("{operation} {subject}: injected failure"),
            ));
        }
        f(&mut state)
    }
}

impl Hypervisor for NullHypervisor {
    fn define_domain<'a>(&'a self, spec: &'a DomainSpec) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.invoke("define_domain", &spec.id, |s| {
                s.domains.insert(spec.id.clone());
                Ok(())
            }).await
        })
    }

    fn undefine_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.invoke("undefine_domain", vm_id, |s| {
                s.running.remove(vm_id);
                s.domains.remove(vm_id);
                Ok(())
            }).await
        })
    }

    fn rename_domain<'a>(&'a self, vm_id: &'a str, new_name: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move { self.invoke("rename_domain", &format!("{vm_id} {new_name}"), |_| Ok(())).await })
    }

    fn start_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.invoke("start_domain", vm_id, |s| {
                s.running.insert(vm_id.to_string());
                Ok(())
            }).await
        })
    }

    fn stop_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.invoke("stop_domain", vm_id, |s| {
                s.running.remove(vm_id);
                Ok(())
            }).await
        })
    }

    fn reset_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move { self.invoke("reset_domain", vm_id, |_| Ok(())).await })
    }

    fn is_running<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<bool>> {
        Box::pin(async move {
            let state = self
                .state
                .lock()
                .map_err(|_| GridError::bug("null hypervisor state poisoned"))?;
            Ok(state.running.contains(vm_id))
        })
    }

    fn create_volume<'a>(&'a self, spec: &'a VolumeSpec) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.invoke("create_volume", &spec.name, |s| {
                if !s.volumes.insert(spec.name.clone()) {
                    return Err(GridError::new(
                        ErrorKind::VolumeAlreadyExists,
                        format!("volume {} already exists", spec.name),
                    ));
                }
                Ok(())
            }).await
        })
    }

    fn delete_volume<'a>(&'a self, spec: &'a VolumeSpec) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.invoke("delete_volume", &spec.name, |s| {
                if !s.volumes.remove(&spec.name) {
                    return Err(GridError::new(
                        ErrorKind::VolumeDoesNotExist,
                        format!("volume {} does not exist", spec.name),
                    ));
                }
                Ok(())
            }).await
        })
    }

    fn define_network<'a>(&'a self, name: &'a str, interface: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.invoke("define_network", &format!("{name} {interface}"), |s| {
                s.networks.insert(name.to_string());
                Ok(())
            }).await
        })
    }

    fn undefine_network<'a>(&'a self, name: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.invoke("undefine_network", name, |s| {
                s.networks.remove(name);
                Ok(())
            }).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(name: &str) -> VolumeSpec {
        VolumeSpec {
            id: "hd-1".into(),
            location: "vg0".into(),
            name: name.into(),
            size_mib: 512,
            replication: None,
        }
    }

    #[test]
    fn device_paths() {
        let mut spec = volume("disk0");
        assert_eq!(spec.device_path(), "/dev/vg0/disk0");
        spec.replication = Some(ReplicationSpec {
            resource: "disk0".into(),
            minor: 7,
            port: 7800,
            peers: vec![],
        });
        assert_eq!(spec.device_path(), "/dev/drbd7");
    }

    #[tokio::test]
    async fn null_hypervisor_tracks_volumes_and_injects_failures() {
        let hv = NullHypervisor::new();
        hv.create_volume(&volume("disk0")).await.unwrap();
        let err = hv.create_volume(&volume("disk0")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeAlreadyExists);

        hv.fail_on("start_domain");
        let err = hv.start_domain("vm-1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LibvirtFailure);
        assert!(!hv.is_running("vm-1").await.unwrap());

        hv.clear_failures();
        hv.start_domain("vm-1").await.unwrap();
        assert!(hv.is_running("vm-1").await.unwrap());
        assert_eq!(hv.calls().len(), 4);
    }

    #[tokio::test]
    async fn held_operation_waits_for_release() {
        let hv = std::sync::Arc::new(NullHypervisor::new());
        hv.hold("start_domain");
        let call = tokio::spawn({
            let hv = std::sync::Arc::clone(&hv);
            async move { hv.start_domain("vm-1").await }
        });
        for _ in 0..100 {
            if !hv.calls().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(hv.is_running("vm-1").await.unwrap());
        assert!(!call.is_finished());

        hv.release("start_domain");
        call.await.unwrap().unwrap();
    }
}
