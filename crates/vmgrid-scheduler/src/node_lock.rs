//! The per-node lock.
//!
//! A non-blocking try-lock owned by one task of one node at a time. The
//! cluster lock is built by taking this lock on every member.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vmgrid_core::{ErrorKind, GridError, GridResult};

/// Who holds a node lock: the originating node and its running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub node: String,
    pub task_id: String,
}

#[derive(Debug, Default)]
pub struct NodeLock {
    holder: Mutex<Option<LockHolder>>,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `holder`. Taking it again for the same holder is
    /// a no-op; any other holder gets `LockContended`.
    pub fn try_lock(&self, holder: &LockHolder) -> GridResult<()> {
        let mut current = self.guard()?;
        match current.as_ref() {
            Some(existing) if existing == holder => Ok(()),
            Some(existing) => Err(GridError::new(
                ErrorKind::LockContended,
                format!(
                    "node is locked by task {} of {}",
                    existing.task_id, existing.node
                ),
            )),
            None => {
                *current = Some(holder.clone());
                Ok(())
            }
        }
    }

    /// Release the lock if `holder` owns it. Returns whether it was released.
    pub fn unlock(&self, holder: &LockHolder) -> GridResult<bool> {
        let mut current = self.guard()?;
        if current.as_ref() == Some(holder) {
            *current = None;
            Ok(true)
        } else {
            if let Some(existing) = current.as_ref() {
                warn!(holder = %existing.node, requester = %holder.node, "unlock by non-holder ignored");
            }
            Ok(false)
        }
    }

    /// Drop the lock whoever holds it.
    pub fn force_clear(&self) -> GridResult<Option<LockHolder>> {
        let cleared = self.guard()?.take();
        if let Some(h) = &cleared {
            info!(holder = %h.node, task = %h.task_id, "node lock force-cleared");
        }
        Ok(cleared)
    }

    pub fn holder(&self) -> Option<LockHolder> {
        self.holder.lock().ok().and_then(|h| h.clone())
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    fn guard(&self) -> GridResult<std::sync::MutexGuard<'_, Option<LockHolder>>> {
        self.holder
            .lock()
            .map_err(|_| GridError::bug("node lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(node: &str, task: &str) -> LockHolder {
        LockHolder {
            node: node.into(),
            task_id: task.into(),
        }
    }

    #[test]
    fn one_holder_at_a_time() {
        let lock = NodeLock::new();
        lock.try_lock(&holder("alpha", "t1")).unwrap();
        lock.try_lock(&holder("alpha", "t1")).unwrap();
        let err = lock.try_lock(&holder("beta", "t2")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);

        assert!(!lock.unlock(&holder("beta", "t2")).unwrap());
        assert!(lock.unlock(&holder("alpha", "t1")).unwrap());
        lock.try_lock(&holder("beta", "t2")).unwrap();
    }

    #[test]
    fn force_clear_releases_any_holder() {
        let lock = NodeLock::new();
        lock.try_lock(&holder("alpha", "t1")).unwrap();
        assert_eq!(lock.force_clear().unwrap(), Some(holder("alpha", "t1")));
        assert!(!lock.is_locked());
    }
}
