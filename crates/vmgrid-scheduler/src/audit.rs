//! In-memory audit ring.
//!
//! Entries are kept in enqueue order; the oldest is evicted once the ring
//! is full. Every transition is also emitted on the `audit` tracing target
//! so the structured log carries the complete history.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl AuditStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub task_id: Option<String>,
    pub method: String,
    pub user: String,
    pub object_name: String,
    pub object_type: String,
    pub start: DateTime<Utc>,
    pub finish: Option<DateTime<Utc>>,
    pub status: AuditStatus,
    pub exception_message: Option<String>,
}

#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    inner: Mutex<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    next_seq: u64,
    entries: VecDeque<AuditEntry>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Ring::default()),
        }
    }

    /// Record a new call. Returns its sequence number.
    pub fn record(
        &self,
        task_id: Option<&str>,
        method: &str,
        user: &str,
        object_name: &str,
        object_type: &str,
        status: AuditStatus,
    ) -> u64 {
        let Ok(mut ring) = self.inner.lock() else {
            return 0;
        };
        let seq = ring.next_seq;
        ring.next_seq += 1;
        ring.entries.push_back(AuditEntry {
            seq,
            task_id: task_id.map(str::to_string),
            method: method.to_string(),
            user: user.to_string(),
            object_name: object_name.to_string(),
            object_type: object_type.to_string(),
            start: Utc::now(),
            finish: None,
            status,
            exception_message: None,
        });
        while ring.entries.len() > self.capacity {
            ring.entries.pop_front();
        }
        info!(
            target: "audit",
            seq,
            task = task_id.unwrap_or("-"),
            %user,
            object = %object_name,
            %method,
            status = ?status,
            "call recorded"
        );
        seq
    }

    /// Move entry `seq` to `status`. Final statuses stamp the finish time.
    /// Entries already evicted are ignored.
    pub fn transition(&self, seq: u64, status: AuditStatus, message: Option<&str>) {
        let Ok(mut ring) = self.inner.lock() else {
            return;
        };
        let Some(entry) = ring.entries.iter_mut().find(|e| e.seq == seq) else {
            return;
        };
        entry.status = status;
        if status.is_final() {
            entry.finish = Some(Utc::now());
        }
        if let Some(m) = message {
            entry.exception_message = Some(m.to_string());
        }
        info!(
            target: "audit",
            seq,
            task = entry.task_id.as_deref().unwrap_or("-"),
            user = %entry.user,
            object = %entry.object_name,
            method = %entry.method,
            status = ?status,
            error = message.unwrap_or(""),
            "call transitioned"
        );
    }

    /// Snapshot of the ring, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .map(|ring| ring.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
