//! VM watchdog.
//!
//! Every VM running on this node with its watchdog enabled gets a ping
//! loop. A guest that misses `reset_fail_count` consecutive pings is reset
//! through the hypervisor, after which its watchdog stays `FAILED` until the
//! VM is restarted or the watchdog is reset by hand.
//!
//! ```text
//! INITIALISING ──boot wait──► ACTIVE ──ping──► WAITING_RESP ──reply──► ACTIVE
//!                                                   │
//!                                                timeout
//!                                                   ▼
//!                             FAILED ◄──n misses── FAILING ──reply──► ACTIVE
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vmgrid_core::hypervisor::Hypervisor;
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult};
use vmgrid_rpc::Environment;
use vmgrid_state::WatchdogConfig;

/// Asks the guest agent of a VM whether it is alive.
pub trait GuestPinger: Send + Sync {
    /// `Ok` when the guest answered.
    fn ping<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>>;
}

/// Pings through `virsh qemu-agent-command`.
#[derive(Debug, Default)]
pub struct VirshAgentPinger;

impl GuestPinger for VirshAgentPinger {
    fn ping<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
        Box::pin(async move {
            let mut cmd = Command::new("virsh");
            cmd.args(["qemu-agent-command", vm_id, r#"{"execute":"guest-ping"}"#]);
            debug!("Running: {:?}", cmd);
            let output = cmd
                .output()
                .await
                .map_err(|e| GridError::new(ErrorKind::LibvirtFailure, format!("failed to run virsh: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(GridError::new(
                    ErrorKind::LibvirtFailure,
                    format!(
                        "guest-ping {vm_id} failed (exit code {}): {}",
                        output.status.code().unwrap_or(-1),
                        stderr.trim()
                    ),
                ));
            }
            Ok(())
        })
    }
}

// ── State machine ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchdogState {
    Initialising,
    Active,
    WaitingResp,
    Failing,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    config: WatchdogConfig,
    state: WatchdogState,
    misses: u32,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            state: WatchdogState::Initialising,
            misses: 0,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn boot_wait_elapsed(&mut self) {
        if self.state == WatchdogState::Initialising {
            self.state = WatchdogState::Active;
        }
    }

    /// A failing watchdog keeps pinging but stays `FAILING`.
    pub fn ping_sent(&mut self) {
        if self.state == WatchdogState::Active {
            self.state = WatchdogState::WaitingResp;
        }
    }

    pub fn reply(&mut self) {
        if matches!(self.state, WatchdogState::WaitingResp | WatchdogState::Failing) {
            self.state = WatchdogState::Active;
            self.misses = 0;
        }
    }

    /// Record a missed ping. Returns `true` when the VM must now be reset.
    pub fn timed_out(&mut self) -> bool {
        if !matches!(self.state, WatchdogState::WaitingResp | WatchdogState::Failing) {
            return false;
        }
        self.misses += 1;
        if self.misses >= self.config.reset_fail_count.max(1) {
            self.state = WatchdogState::Failed;
            true
        } else {
            self.state = WatchdogState::Failing;
            false
        }
    }

    /// Manual exit from any state, including `FAILED`.
    pub fn reset(&mut self) {
        self.state = WatchdogState::Initialising;
        self.misses = 0;
    }
}

// ── Monitor ────────────────────────────────────────────────────────

struct MonitorSlot {
    config: WatchdogConfig,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorSlot {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

type States = Arc<Mutex<HashMap<String, WatchdogState>>>;

/// Keeps one ping loop per watched VM in step with the configuration.
pub struct WatchdogMonitor {
    env: Arc<Environment>,
    pinger: Arc<dyn GuestPinger>,
    monitors: RwLock<HashMap<String, MonitorSlot>>,
    states: States,
}

impl WatchdogMonitor {
    pub fn new(env: Arc<Environment>, pinger: Arc<dyn GuestPinger>) -> Self {
        Self {
            env,
            pinger,
            monitors: RwLock::new(HashMap::new()),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start loops for newly watched VMs and stop those no longer watched.
    /// A changed watchdog configuration restarts the loop.
    pub async fn sync(&self) -> GridResult<()> {
        let config = self.env.config()?;
        let mut wanted = HashMap::new();
        for (id, vm) in &config.virtual_machines {
            if !vm.watchdog.enabled || vm.current_node.as_deref() != Some(self.env.node()) {
                continue;
            }
            if self.env.hypervisor().is_running(id).await? {
                wanted.insert(id.clone(), vm.watchdog);
            }
        }

        let mut monitors = self.monitors.write().await;
        let stale: Vec<String> = monitors
            .iter()
            .filter(|(id, slot)| wanted.get(*id) != Some(&slot.config))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(slot) = monitors.remove(&id) {
                slot.stop();
                self.forget_state(&id);
                debug!(vm = %id, "watchdog stopped");
            }
        }
        for (id, watchdog) in wanted {
            if monitors.contains_key(&id) {
                continue;
            }
            publish(&self.states, &id, WatchdogState::Initialising);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(watch_vm(
                id.clone(),
                watchdog,
                Arc::clone(self.env.hypervisor()),
                Arc::clone(&self.pinger),
                Arc::clone(&self.states),
                shutdown_rx,
            ));
            monitors.insert(
                id.clone(),
                MonitorSlot {
                    config: watchdog,
                    handle,
                    shutdown_tx,
                },
            );
            info!(vm = %id, interval_secs = watchdog.interval_secs, "watchdog started");
        }
        Ok(())
    }

    /// Drop the loop of `vm_id` so the next `sync` starts it afresh.
    pub async fn reset(&self, vm_id: &str) -> bool {
        let removed = self.monitors.write().await.remove(vm_id);
        self.forget_state(vm_id);
        match removed {
            Some(slot) => {
                slot.stop();
                info!(vm = %vm_id, "watchdog reset");
                true
            }
            None => false,
        }
    }

    pub fn state(&self, vm_id: &str) -> Option<WatchdogState> {
        self.states.lock().ok().and_then(|s| s.get(vm_id).copied())
    }

    pub fn states(&self) -> HashMap<String, WatchdogState> {
        self.states.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            slot.stop();
            debug!(vm = %id, "watchdog stopped");
        }
    }

    /// Resync every `period` until shutdown.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.sync().await {
                warn!(error = %e, "watchdog sync failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.stop_all().await;
        info!("watchdog monitor stopped");
    }

    fn forget_state(&self, vm_id: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(vm_id);
        }
    }
}

fn publish(states: &States, vm_id: &str, state: WatchdogState) {
    if let Ok(mut states) = states.lock() {
        states.insert(vm_id.to_string(), state);
    }
}

async fn watch_vm(
    vm_id: String,
    config: WatchdogConfig,
    hypervisor: Arc<dyn Hypervisor>,
    pinger: Arc<dyn GuestPinger>,
    states: States,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dog = Watchdog::new(config);
    publish(&states, &vm_id, dog.state());

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(config.boot_wait_secs)) => {}
        _ = shutdown.changed() => return,
    }
    dog.boot_wait_elapsed();
    publish(&states, &vm_id, dog.state());

    let interval = Duration::from_secs(config.interval_secs.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        dog.ping_sent();
        publish(&states, &vm_id, dog.state());

        let replied = match tokio::time::timeout(interval, pinger.ping(&vm_id)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(vm = %vm_id, error = %e, "guest ping failed");
                false
            }
            Err(_) => false,
        };
        if replied {
            dog.reply();
        } else if dog.timed_out() {
            warn!(vm = %vm_id, misses = dog.misses(), "guest unresponsive, resetting");
            match hypervisor.reset_domain(&vm_id).await {
                Ok(()) => info!(target: "audit", vm = %vm_id, "VM reset by watchdog"),
                Err(e) => error!(vm = %vm_id, error = %e, "watchdog reset failed"),
            }
            publish(&states, &vm_id, dog.state());
            return;
        } else {
            debug!(vm = %vm_id, misses = dog.misses(), "guest missed a ping");
        }
        publish(&states, &vm_id, dog.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vmgrid_core::hypervisor::NullHypervisor;
    use vmgrid_rpc::local::{LocalNetwork, node_environment};
    use vmgrid_state::{AutostartPolicy, LockState, VirtualMachineConfig};

    fn config(reset_fail_count: u32) -> WatchdogConfig {
        WatchdogConfig {
            enabled: true,
            interval_secs: 10,
            reset_fail_count,
            boot_wait_secs: 30,
        }
    }

    #[test]
    fn misses_lead_to_failed() {
        let mut dog = Watchdog::new(config(2));
        dog.ping_sent();
        assert_eq!(dog.state(), WatchdogState::Initialising);

        dog.boot_wait_elapsed();
        dog.ping_sent();
        assert_eq!(dog.state(), WatchdogState::WaitingResp);
        dog.reply();
        assert_eq!(dog.state(), WatchdogState::Active);

        dog.ping_sent();
        assert!(!dog.timed_out());
        assert_eq!(dog.state(), WatchdogState::Failing);
        dog.ping_sent();
        assert_eq!(dog.state(), WatchdogState::Failing);
        assert!(dog.timed_out());
        assert_eq!(dog.state(), WatchdogState::Failed);

        // Only a reset leaves FAILED.
        dog.reply();
        dog.boot_wait_elapsed();
        assert_eq!(dog.state(), WatchdogState::Failed);
        dog.reset();
        assert_eq!((dog.state(), dog.misses()), (WatchdogState::Initialising, 0));
    }

    #[test]
    fn a_reply_clears_misses() {
        let mut dog = Watchdog::new(config(2));
        dog.boot_wait_elapsed();
        dog.ping_sent();
        dog.timed_out();
        dog.reply();
        assert_eq!((dog.state(), dog.misses()), (WatchdogState::Active, 0));
        dog.ping_sent();
        assert!(!dog.timed_out());
    }

    struct Switch(AtomicBool);

    impl GuestPinger for Switch {
        fn ping<'a>(&'a self, vm_id: &'a str) -> BoxFuture<'a, GridResult<()>> {
            Box::pin(async move {
                if self.0.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(GridError::new(ErrorKind::LibvirtFailure, format!("{vm_id} silent")))
                }
            })
        }
    }

    fn watched_vm() -> VirtualMachineConfig {
        VirtualMachineConfig {
            name: "web".into(),
            available_nodes: vec!["alpha".into()],
            current_node: Some("alpha".into()),
            cpu_cores: 1,
            memory_mib: 256,
            lock: LockState::Unlocked,
            autostart: AutostartPolicy::None,
            hard_drives: Default::default(),
            network_interfaces: Default::default(),
            permissions: Default::default(),
            watchdog: config(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_guest_is_reset_once() {
        let dir = tempfile::tempdir().unwrap();
        let hv = Arc::new(NullHypervisor::new());
        let env = node_environment(dir.path(), "alpha", LocalNetwork::new(), hv.clone()).unwrap();
        env.update_config("seed", |cfg| {
            cfg.virtual_machines.insert("vm-1".into(), watched_vm());
            Ok(())
        })
        .unwrap();
        hv.start_domain("vm-1").await.unwrap();

        let pinger = Arc::new(Switch(AtomicBool::new(true)));
        let monitor = WatchdogMonitor::new(Arc::clone(&env), pinger.clone());
        monitor.sync().await.unwrap();
        assert_eq!(monitor.state("vm-1"), Some(WatchdogState::Initialising));

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(monitor.state("vm-1"), Some(WatchdogState::Active));

        pinger.0.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(monitor.state("vm-1"), Some(WatchdogState::Failed));
        let resets = hv.calls().iter().filter(|c| *c == "reset_domain vm-1").count();
        assert_eq!(resets, 1);

        // FAILED survives a resync; a manual reset starts over.
        monitor.sync().await.unwrap();
        assert_eq!(monitor.state("vm-1"), Some(WatchdogState::Failed));
        assert!(monitor.reset("vm-1").await);
        monitor.sync().await.unwrap();
        assert_eq!(monitor.state("vm-1"), Some(WatchdogState::Initialising));

        // Stopped VMs are not watched.
        hv.stop_domain("vm-1").await.unwrap();
        monitor.sync().await.unwrap();
        assert!(monitor.states().is_empty());
    }
}
