//! The session table.
//!
//! Sessions slide: every successful validation pushes the expiry out by
//! the TTL again. Expiry uses `tokio::time::Instant` so tests can drive the
//! clock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use vmgrid_core::{ErrorKind, GridError, GridResult};

use crate::password::random_token;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct SessionTable {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a session for `username`.
    pub fn create(&self, username: &str) -> GridResult<Session> {
        let session = Session {
            id: random_token()?,
            username: username.to_string(),
            expires_at: Instant::now() + self.ttl,
        };
        self.lock()?.insert(session.id.clone(), session.clone());
        debug!(user = %username, "session created");
        Ok(session)
    }

    /// Check `id` and renew it.
    ///
    /// Unknown ids raise `Unauthenticated`; expired ones are dropped and
    /// raise `SessionExpired`.
    pub fn validate(&self, id: &str) -> GridResult<Session> {
        let mut sessions = self.lock()?;
        let now = Instant::now();
        let Some(session) = sessions.get_mut(id) else {
            return Err(GridError::unauthenticated("unknown session"));
        };
        if session.expires_at <= now {
            let username = session.username.clone();
            sessions.remove(id);
            debug!(user = %username, "session expired");
            return Err(GridError::new(ErrorKind::SessionExpired, "session has expired"));
        }
        session.expires_at = now + self.ttl;
        Ok(session.clone())
    }

    /// Destroy a session. Returns whether it existed.
    pub fn logout(&self, id: &str) -> GridResult<bool> {
        Ok(self.lock()?.remove(id).is_some())
    }

    /// Destroy every session belonging to `username`.
    pub fn remove_user(&self, username: &str) -> GridResult<usize> {
        let mut sessions = self.lock()?;
        let before = sessions.len();
        sessions.retain(|_, s| s.username != username);
        Ok(before - sessions.len())
    }

    /// Drop every expired session. Returns how many were dropped.
    pub fn purge_expired(&self) -> GridResult<usize> {
        let mut sessions = self.lock()?;
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        Ok(before - sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> GridResult<std::sync::MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|_| GridError::bug("session table poisoned"))
    }
}
