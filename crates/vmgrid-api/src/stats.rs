//! Host CPU and memory statistics.
//!
//! ```text
//! stats timer ─► host_statistics.record ─► HostStatsSource::sample
//!                                        └► HostStatsStore (redb, node-local)
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult, Permission};
use vmgrid_rpc::object::unknown_method;
use vmgrid_rpc::{CallArgs, CallContext, MethodSpec, RpcObject};
use vmgrid_state::HostStatsSample;

/// Where host samples come from.
pub trait HostStatsSource: Send + Sync {
    fn sample(&self, timestamp_ms: u64) -> GridResult<HostStatsSample>;
}

// ── /proc ──────────────────────────────────────────────────────────

/// Reads `/proc/stat` and `/proc/meminfo`. CPU usage is the busy share of
/// the jiffies elapsed since the previous sample.
pub struct ProcStatsSource {
    root: PathBuf,
    previous: Mutex<Option<CpuTimes>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

impl ProcStatsSource {
    pub fn new() -> Self {
        Self::rooted_at(PathBuf::from("/proc"))
    }

    /// A source reading `stat` and `meminfo` under `root`.
    pub fn rooted_at(root: PathBuf) -> Self {
        Self {
            root,
            previous: Mutex::new(None),
        }
    }

    fn read(&self, file: &str) -> GridResult<String> {
        let path = self.root.join(file);
        std::fs::read_to_string(&path).map_err(|e| {
            GridError::new(
                ErrorKind::ExternalCommandFailed,
                format!("read {}: {e}", path.display()),
            )
        })
    }
}

impl Default for ProcStatsSource {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_cpu(stat: &str) -> GridResult<CpuTimes> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| GridError::new(ErrorKind::ExternalCommandFailed, "no cpu line in /proc/stat"))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields.get(3).copied().unwrap_or(0) + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// `(used, total)` in MiB.
fn parse_memory(meminfo: &str) -> GridResult<(u64, u64)> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kib| kib.parse::<u64>().ok())
            .ok_or_else(|| GridError::new(ErrorKind::ExternalCommandFailed, format!("no {name} in /proc/meminfo")))
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Ok((total.saturating_sub(available) / 1024, total / 1024))
}

fn cpu_percent(previous: Option<CpuTimes>, now: CpuTimes) -> f64 {
    let (busy, total) = match previous {
        Some(p) => (now.busy.saturating_sub(p.busy), now.total.saturating_sub(p.total)),
        None => (now.busy, now.total),
    };
    if total == 0 {
        return 0.0;
    }
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

impl HostStatsSource for ProcStatsSource {
    fn sample(&self, timestamp_ms: u64) -> GridResult<HostStatsSample> {
        let now = parse_cpu(&self.read("stat")?)?;
        let (memory_used_mib, memory_total_mib) = parse_memory(&self.read("meminfo")?)?;
        let mut previous = self
            .previous
            .lock()
            .map_err(|_| GridError::bug("stats source mutex poisoned"))?;
        let cpu_percent = cpu_percent(*previous, now);
        *previous = Some(now);
        Ok(HostStatsSample {
            timestamp_ms,
            cpu_percent,
            memory_used_mib,
            memory_total_mib,
        })
    }
}

// ── host_statistics ────────────────────────────────────────────────

const METHODS: &[MethodSpec] = &[
    // Timer-driven and node-local, so never queued behind cluster writes.
    MethodSpec::read("record"),
    MethodSpec::read("latest"),
    MethodSpec::read("range"),
    MethodSpec::read("prune"),
];

pub struct HostStatistics {
    source: Arc<dyn HostStatsSource>,
}

impl HostStatistics {
    pub fn new(source: Arc<dyn HostStatsSource>) -> Self {
        Self { source }
    }

    fn require_internal(ctx: &CallContext) -> GridResult<()> {
        if ctx.auth().internal {
            return Ok(());
        }
        ctx.require(Permission::Superuser, None)
    }
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

impl RpcObject for HostStatistics {
    fn type_name(&self) -> &'static str {
        "HostStatistics"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        METHODS
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, method: &'a str, args: CallArgs) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(async move {
            let store = ctx.env().host_stats();
            match method {
                "record" => {
                    Self::require_internal(ctx)?;
                    let sample = self.source.sample(now_ms())?;
                    store.insert(&sample)?;
                    debug!(cpu = sample.cpu_percent, memory_used_mib = sample.memory_used_mib, "host sample recorded");
                    Ok(serde_json::to_value(sample)?)
                }
                "latest" => {
                    let limit: usize = args.opt(0, "limit")?.unwrap_or(1);
                    Ok(serde_json::to_value(store.latest(limit)?)?)
                }
                "range" => {
                    let from: u64 = args.get(0, "from_ms")?;
                    let to: u64 = args.opt(1, "to_ms")?.unwrap_or_else(now_ms);
                    Ok(serde_json::to_value(store.range(from, to)?)?)
                }
                "prune" => {
                    Self::require_internal(ctx)?;
                    let before: u64 = args.get(0, "before_ms")?;
                    Ok(json!(store.prune(before)?))
                }
                other => Err(unknown_method(self.type_name(), other)),
            }
        })
    }
}
