//! HostStatsStore — redb time series of host CPU and memory samples.
//!
//! Samples are keyed by their epoch-millisecond timestamp and stored as
//! JSON values. The store is node-local; nothing here is replicated.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};

/// Host samples keyed by epoch milliseconds.
const HOST_STATS: TableDefinition<u64, &[u8]> = TableDefinition::new("host_stats");

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatsSample {
    pub timestamp_ms: u64,
    /// Busy CPU share since the previous sample, 0.0 ..= 100.0.
    pub cpu_percent: f64,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
}

#[derive(Clone)]
pub struct HostStatsStore {
    db: Arc<Database>,
}

impl HostStatsStore {
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "host stats store opened");
        Ok(store)
    }

    /// Ephemeral store for tests and development nodes.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(HOST_STATS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert a sample, replacing any sample with the same timestamp.
    pub fn insert(&self, sample: &HostStatsSample) -> StateResult<()> {
        let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HOST_STATS).map_err(map_err!(Table))?;
            table
                .insert(sample.timestamp_ms, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Samples with `from_ms <= timestamp <= to_ms`, oldest first.
    pub fn range(&self, from_ms: u64, to_ms: u64) -> StateResult<Vec<HostStatsSample>> {
        if from_ms > to_ms {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOST_STATS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(from_ms..=to_ms).map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let sample: HostStatsSample =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(sample);
        }
        Ok(results)
    }

    /// The most recent `limit` samples, oldest first.
    pub fn latest(&self, limit: usize) -> StateResult<Vec<HostStatsSample>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOST_STATS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let sample: HostStatsSample =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(sample);
        }
        results.reverse();
        Ok(results)
    }

    /// Delete every sample older than `before_ms`. Returns the number removed.
    pub fn prune(&self, before_ms: u64) -> StateResult<usize> {
        let keys: Vec<u64> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(HOST_STATS).map_err(map_err!(Table))?;
            table
                .range(..before_ms)
                .map_err(map_err!(Read))?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value()))
                .collect()
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HOST_STATS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(*key).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(removed = keys.len(), before_ms, "host stats pruned");
        Ok(keys.len())
    }
}
