//! `CommandHypervisor`: the host collaborator that shells out to `virsh`,
//! LVM and `drbdadm`.
//!
//! Domains are defined under their VM id; the display name lives in the
//! domain title so renames never touch the libvirt identity. Failures are
//! logged with the tool's stderr and surface as `LibvirtFailure` (virsh) or
//! `ExternalCommandFailed` (everything else).

use std::path::PathBuf;

use tokio::process::Command;
use tracing::{debug, error, info};
use vmgrid_core::hypervisor::{DomainSpec, Hypervisor, ReplicationSpec, VolumeSpec};
use vmgrid_core::{BoxFuture, DaemonSettings, ErrorKind, GridError, GridResult, NodeIdentity};

pub struct CommandHypervisor {
    settings: DaemonSettings,
    node: NodeIdentity,
    drbd_dir: PathBuf,
}

impl CommandHypervisor {
    pub fn new(settings: DaemonSettings, node: NodeIdentity) -> Self {
        Self {
            settings,
            node,
            drbd_dir: PathBuf::from("/etc/drbd.d"),
        }
    }

    async fn run(&self, kind: ErrorKind, program: &str, args: &[&str]) -> GridResult<String> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        debug!("Running: {:?}", cmd);

        let output = cmd.output().await.map_err(|e| {
            error!(%program, error = %e, "failed to spawn");
            GridError::new(kind, format!("failed to run {program}: {e}"))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            error!(%program, ?args, code, stderr = %stderr.trim(), "command failed");
            return Err(GridError::new(
                kind,
                format!("{program} {} failed (exit code {code}): {}", args.join(" "), stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn virsh(&self, args: &[&str]) -> GridResult<String> {
        self.run(ErrorKind::LibvirtFailure, "virsh", args).await
    }

    async fn write_file(&self, path: &PathBuf, contents: &str) -> GridResult<()> {
        let io_err = |e: std::io::Error| {
            GridError::new(ErrorKind::ExternalCommandFailed, format!("write {}: {e}", path.display()))
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        tokio::fs::write(path, contents).await.map_err(io_err)
    }

    async fn volume_exists(&self, spec: &VolumeSpec) -> bool {
        let lv = format!("{}/{}", spec.location, spec.name);
        self.run(ErrorKind::ExternalCommandFailed, "lvs", &[&lv]).await.is_ok()
    }

    fn resource_path(&self, resource: &str) -> PathBuf {
        self.drbd_dir.join(format!("{resource}.res"))
    }
}

// ── XML and resource files ─────────────────────────────────────────

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

fn domain_xml(spec: &DomainSpec) -> String {
    let mut xml = format!(
        "<domain type='kvm'>\n  <name>{}</name>\n  <title>{}</title>\n  <memory unit='MiB'>{}</memory>\n  <vcpu>{}</vcpu>\n  <os><type arch='x86_64'>hvm</type><boot dev='hd'/></os>\n  <features><acpi/><apic/></features>\n  <devices>\n",
        escape(&spec.id),
        escape(&spec.name),
        spec.memory_mib,
        spec.cpu_cores,
    );
    for (index, disk) in spec.disks.iter().enumerate() {
        let target = (b'a' + u8::try_from(index % 26).unwrap_or(0)) as char;
        xml.push_str(&format!(
            "    <disk type='block' device='disk'><driver name='qemu' type='raw' cache='none'/><source dev='{}'/><target dev='vd{target}' bus='virtio'/></disk>\n",
            escape(disk)
        ));
    }
    for (mac, bridge) in &spec.interfaces {
        xml.push_str(&format!(
            "    <interface type='bridge'><mac address='{}'/><source bridge='{}'/><model type='virtio'/></interface>\n",
            escape(mac),
            escape(bridge)
        ));
    }
    xml.push_str("    <graphics type='vnc' autoport='yes'/>\n  </devices>\n</domain>\n");
    xml
}

fn network_xml(name: &str, interface: &str) -> String {
    format!(
        "<network>\n  <name>{}</name>\n  <forward mode='bridge'/>\n  <bridge name='{}'/>\n</network>\n",
        escape(name),
        escape(interface)
    )
}

fn drbd_resource(local: &str, device: &str, disk: &str, replication: &ReplicationSpec) -> String {
    let mut res = format!(
        "resource {} {{\n  protocol C;\n  device /dev/drbd{};\n  disk {disk};\n  meta-disk internal;\n  handlers {{\n    after-resync-target \"vmgrid-drbd-hook 1\";\n    before-resync-target \"vmgrid-drbd-hook 0\";\n  }}\n",
        replication.resource, replication.minor
    );
    for node in std::iter::once(local).chain(replication.peers.iter().map(String::as_str)) {
        res.push_str(&format!("  on {node} {{\n    address {node}:{};\n  }}\n", replication.port));
    }
    res.push_str("}\n");
    debug!(resource = %replication.resource, %device, "DRBD resource rendered");
    res
}

impl Hypervisor for CommandHypervisor {
    fn define_domain<'a>(&'a self, spec: &'a DomainSpec) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            let path = self.settings.vm_dir(&spec.id).join("domain.xml");
            self.write_file(&path, &domain_xml(spec)).await?;
            let path = path.to_string_lossy();
            self.virsh(&["define", &path]).await?;
            info!(vm = %spec.id, name = %spec.name, "domain defined");
            Ok(())
        })
    }

    fn undefine_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.virsh(&["undefine", vm_id]).await?;
            if let Err(e) = tokio::fs::remove_dir_all(self.settings.vm_dir(vm_id)).await {
                debug!(vm = %vm_id, error = %e, "VM directory not removed");
            }
            Ok(())
        })
    }

    fn rename_domain<'a>(&'a self, vm_id: &'a str, new_name: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.virsh(&["desc", vm_id, "--config", "--title", new_name]).await?;
            Ok(())
        })
    }

    fn start_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.virsh(&["start", vm_id]).await?;
            Ok(())
        })
    }

    fn stop_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.virsh(&["destroy", vm_id]).await?;
            Ok(())
        })
    }

    fn reset_domain<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            self.virsh(&["reset", vm_id]).await?;
            Ok(())
        })
    }

    fn is_running<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<bool>> {
        Box::pin(async move {
            match self.virsh(&["domstate", vm_id]).await {
                Ok(state) => Ok(state.trim() == "running"),
                // Not defined here.
                Err(_) => Ok(false),
            }
        })
    }

    fn create_volume<'a>(&'a self, spec: &'a VolumeSpec) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            if self.volume_exists(spec).await {
                return Err(GridError::new(
                    ErrorKind::VolumeAlreadyExists,
                    format!("volume {}/{} already exists", spec.location, spec.name),
                ));
            }
            let size = format!("{}M", spec.size_mib);
            self.run(
                ErrorKind::ExternalCommandFailed,
                "lvcreate",
                &["--yes", "-L", &size, "-n", &spec.name, &spec.location],
            )
            .await?;

            if let Some(replication) = &spec.replication {
                let disk = format!("/dev/{}/{}", spec.location, spec.name);
                let res = drbd_resource(self.node.as_str(), &spec.device_path(), &disk, replication);
                self.write_file(&self.resource_path(&replication.resource), &res).await?;
                let resource = replication.resource.as_str();
                self.run(ErrorKind::ExternalCommandFailed, "drbdadm", &["create-md", "--force", resource])
                    .await?;
                self.run(ErrorKind::ExternalCommandFailed, "drbdadm", &["up", resource])
                    .await?;
            }
            info!(volume = %spec.name, location = %spec.location, size_mib = spec.size_mib, "volume created");
            Ok(())
        })
    }

    fn delete_volume<'a>(&'a self, spec: &'a VolumeSpec) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            if !self.volume_exists(spec).await {
                return Err(GridError::new(
                    ErrorKind::VolumeDoesNotExist,
                    format!("volume {}/{} does not exist", spec.location, spec.name),
                ));
            }
            if let Some(replication) = &spec.replication {
                self.run(ErrorKind::ExternalCommandFailed, "drbdadm", &["down", &replication.resource])
                    .await?;
                if let Err(e) = tokio::fs::remove_file(self.resource_path(&replication.resource)).await {
                    debug!(resource = %replication.resource, error = %e, "resource file not removed");
                }
            }
            let lv = format!("{}/{}", spec.location, spec.name);
            self.run(ErrorKind::ExternalCommandFailed, "lvremove", &["--yes", &lv])
                .await?;
            info!(volume = %spec.name, location = %spec.location, "volume deleted");
            Ok(())
        })
    }

    fn define_network<'a>(&'a self, name: &'a str, interface: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            let path = self.settings.node_root.join("networks").join(format!("{name}.xml"));
            self.write_file(&path, &network_xml(name, interface)).await?;
            let path = path.to_string_lossy();
            self.virsh(&["net-define", &path]).await?;
            self.virsh(&["net-start", name]).await?;
            self.virsh(&["net-autostart", name]).await?;
            info!(network = %name, %interface, "network defined");
            Ok(())
        })
    }

    fn undefine_network<'a>(&'a self, name: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            if let Err(e) = self.virsh(&["net-destroy", name]).await {
                debug!(network = %name, error = %e, "network was not active");
            }
            self.virsh(&["net-undefine", name]).await?;
            Ok(())
        })
    }
}
