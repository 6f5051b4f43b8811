//! vmgrid-health — the background loops of a VMGrid node.
//!
//! ```text
//! vmgridd ─┬─ run_autostart     ON_BOOT once, then ON_POLL every autostart_interval
//!          ├─ run_host_stats    host_statistics.record every statistics.interval
//!          ├─ run_session_purge drop expired sessions
//!          └─ WatchdogMonitor   one ping loop per running VM with a watchdog
//! ```
//!
//! Autostart and statistics go through the dispatcher as internal calls, so
//! they queue behind cluster writes like any other caller. Every loop stops
//! when the daemon's shutdown channel flips.

pub mod timers;
pub mod watchdog;

pub use timers::{run_autostart, run_host_stats, run_session_purge};
pub use watchdog::{GuestPinger, VirshAgentPinger, Watchdog, WatchdogMonitor, WatchdogState};
