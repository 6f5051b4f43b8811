//! Periodic node tasks driven through the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vmgrid_api::{HOST_STATISTICS, VIRTUAL_MACHINE_FACTORY};
use vmgrid_core::ErrorKind;
use vmgrid_rpc::{CallArgs, Dispatcher, Environment};
use vmgrid_state::AutostartPolicy;

/// How often a disabled timer rereads its interval.
pub const IDLE_RECHECK: Duration = Duration::from_secs(60);

pub const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Host samples older than this are pruned after each record.
pub const STATS_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Sleep for `period`; `true` when shutdown was signalled first.
async fn sleep_or_shutdown(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        _ = shutdown.changed() => true,
    }
}

async fn sweep(dispatcher: &Dispatcher, trigger: AutostartPolicy) {
    let args = CallArgs::new().arg(json!(trigger));
    match dispatcher
        .dispatch_internal(VIRTUAL_MACHINE_FACTORY, "autostart", args)
        .await
    {
        Ok(started) => debug!(?trigger, %started, "autostart sweep done"),
        // Another node holds the cluster; the next tick retries.
        Err(e) if e.kind == ErrorKind::LockContended => debug!(?trigger, error = %e, "autostart skipped"),
        Err(e) => warn!(?trigger, error = %e, "autostart sweep failed"),
    }
}

/// One `ON_BOOT` sweep, then an `ON_POLL` sweep every `autostart_interval`
/// seconds. An interval of zero disables polling.
pub async fn run_autostart(dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
    info!("autostart timer started");
    sweep(&dispatcher, AutostartPolicy::OnBoot).await;
    loop {
        let interval = dispatcher
            .env()
            .config()
            .map(|c| c.autostart_interval)
            .unwrap_or(0);
        let wait = if interval == 0 {
            IDLE_RECHECK
        } else {
            Duration::from_secs(interval)
        };
        if sleep_or_shutdown(wait, &mut shutdown).await {
            break;
        }
        if interval > 0 {
            sweep(&dispatcher, AutostartPolicy::OnPoll).await;
        }
    }
    debug!("autostart timer stopped");
}

async fn record(dispatcher: &Dispatcher) {
    if let Err(e) = dispatcher
        .dispatch_internal(HOST_STATISTICS, "record", CallArgs::new())
        .await
    {
        warn!(error = %e, "host sample failed");
        return;
    }
    let retention = i64::try_from(STATS_RETENTION.as_millis()).unwrap_or(i64::MAX);
    let before = u64::try_from(Utc::now().timestamp_millis().saturating_sub(retention)).unwrap_or(0);
    if let Err(e) = dispatcher
        .dispatch_internal(HOST_STATISTICS, "prune", CallArgs::new().arg(before))
        .await
    {
        warn!(error = %e, "host sample pruning failed");
    }
}

/// Record a host sample now and every `statistics.interval` seconds.
pub async fn run_host_stats(dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
    info!("host statistics timer started");
    loop {
        let interval = dispatcher
            .env()
            .config()
            .map(|c| c.statistics.interval)
            .unwrap_or(0);
        if interval > 0 {
            record(&dispatcher).await;
        }
        let wait = if interval == 0 {
            IDLE_RECHECK
        } else {
            Duration::from_secs(interval)
        };
        if sleep_or_shutdown(wait, &mut shutdown).await {
            break;
        }
    }
    debug!("host statistics timer stopped");
}

pub async fn run_session_purge(env: Arc<Environment>, mut shutdown: watch::Receiver<bool>) {
    while !sleep_or_shutdown(SESSION_PURGE_INTERVAL, &mut shutdown).await {
        match env.sessions().purge_expired() {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired sessions dropped"),
            Err(e) => warn!(error = %e, "session purge failed"),
        }
    }
}
