//! Request credentials and their verification.
//!
//! Precedence is session first, then username/password. A password login
//! mints a session that is returned to the caller for later requests.
//! Node identities (cluster peers and the one-time bootstrap user) may
//! additionally act on behalf of another user and claim the node lock.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vmgrid_core::{ErrorKind, GridError, GridResult, UserType};
use vmgrid_state::UserConfig;

use crate::password::verify_password;
use crate::session::SessionTable;

/// Credentials and call metadata carried by every request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "USER", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "PASS", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "SEID", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(rename = "PROXY_USER", default, skip_serializing_if = "Option::is_none")]
    pub proxy_user: Option<String>,
    #[serde(rename = "HAS_LOCK", default, skip_serializing_if = "std::ops::Not::not")]
    pub has_lock: bool,
    /// Task id of the lock holder's running task, for replays.
    #[serde(rename = "TASK", default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl Handshake {
    pub fn password(user: &str, password: &str) -> Self {
        Self {
            user: Some(user.to_string()),
            password: Some(password.to_string()),
            ..Self::default()
        }
    }

    pub fn session(user: &str, session: &str) -> Self {
        Self {
            user: Some(user.to_string()),
            session: Some(session.to_string()),
            ..Self::default()
        }
    }

    pub fn with_proxy_user(mut self, user: Option<&str>) -> Self {
        self.proxy_user = user.map(str::to_string);
        self
    }

    pub fn with_lock_claim(mut self, task: Option<&str>) -> Self {
        self.has_lock = true;
        self.task = task.map(str::to_string);
        self
    }
}

/// Where a request came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerInfo {
    pub addr: Option<SocketAddr>,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr: Some(addr) }
    }

    pub fn is_loopback(&self) -> bool {
        self.addr.is_some_and(|a| a.ip().is_loopback())
    }
}

/// Who holds this node's lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeldLock<'a> {
    pub node: &'a str,
    pub task_id: &'a str,
}

/// The outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    /// The identity that authenticated.
    pub username: String,
    pub user_type: UserType,
    /// Whose permissions apply: the proxied user, or `username`.
    pub effective_user: String,
    /// Session to hand back to the caller.
    pub session: Option<String>,
    /// Timer-originated call that skips user checks.
    pub internal: bool,
    /// The caller holds this node's lock on our behalf.
    pub lock_claim: bool,
    pub task_id: Option<String>,
}

impl AuthContext {
    /// Context for calls the daemon makes to itself.
    pub fn internal(node: &str) -> Self {
        Self {
            username: format!("internal@{node}"),
            user_type: UserType::Local,
            effective_user: format!("internal@{node}"),
            session: None,
            internal: true,
            lock_claim: false,
            task_id: None,
        }
    }

    pub fn is_proxied(&self) -> bool {
        self.effective_user != self.username
    }

    /// A node identity acting for itself rather than for a user.
    pub fn is_node_identity(&self) -> bool {
        self.user_type.can_proxy() && !self.is_proxied()
    }
}

/// Verify `hs` on `local_node`.
///
/// `lock` is the current holder of this node's lock, if any. A lock claim
/// must name the holder's task and come either from the holder's peer
/// identity or, for a lock this node holds itself, from loopback.
pub fn authenticate(
    hs: &Handshake,
    users: &BTreeMap<String, UserConfig>,
    sessions: &SessionTable,
    peer: &PeerInfo,
    local_node: &str,
    lock: Option<HeldLock<'_>>,
) -> GridResult<AuthContext> {
    let (username, session) = if let Some(seid) = &hs.session {
        let session = sessions.validate(seid)?;
        if hs.user.as_ref().is_some_and(|u| *u != session.username) {
            return Err(GridError::unauthenticated("session belongs to another user"));
        }
        (session.username, Some(session.id))
    } else if let (Some(user), Some(password)) = (&hs.user, &hs.password) {
        let valid = users.get(user).is_some_and(|cfg| match (&cfg.password, &cfg.salt) {
            (Some(hash), Some(salt)) => verify_password(password, hash, salt),
            _ => false,
        });
        if !valid {
            warn!(user = %user, "password authentication failed");
            return Err(GridError::unauthenticated("invalid username or password"));
        }
        let session = sessions.create(user)?;
        (user.clone(), Some(session.id))
    } else {
        return Err(GridError::unauthenticated("no credentials supplied"));
    };

    let Some(user) = users.get(&username) else {
        return Err(GridError::unauthenticated(format!("user '{username}' no longer exists")));
    };

    let effective_user = match &hs.proxy_user {
        Some(proxied) if *proxied != username => {
            if !user.user_type.can_proxy() {
                return Err(GridError::insufficient_privileges(format!(
                    "user '{username}' may not act on behalf of other users"
                )));
            }
            if !users.contains_key(proxied) {
                return Err(GridError::unauthenticated(format!(
                    "proxied user '{proxied}' does not exist"
                )));
            }
            proxied.clone()
        }
        _ => username.clone(),
    };

    let lock_claim = if hs.has_lock {
        verify_lock_claim(hs, user, peer, local_node, lock)?;
        true
    } else {
        false
    };

    debug!(user = %username, effective = %effective_user, lock_claim, "authenticated");
    Ok(AuthContext {
        username,
        user_type: user.user_type,
        effective_user,
        session,
        internal: false,
        lock_claim,
        task_id: hs.task.clone(),
    })
}

fn verify_lock_claim(
    hs: &Handshake,
    user: &UserConfig,
    peer: &PeerInfo,
    local_node: &str,
    lock: Option<HeldLock<'_>>,
) -> GridResult<()> {
    let Some(holder) = lock else {
        return Err(GridError::new(
            ErrorKind::LockContended,
            "lock claimed but this node is not locked",
        ));
    };
    let Some(task) = hs.task.as_deref() else {
        return Err(GridError::new(ErrorKind::LockContended, "lock claim names no task"));
    };
    if task != holder.task_id {
        return Err(GridError::new(
            ErrorKind::LockContended,
            format!("lock claim for task {task}, but {} holds the lock", holder.task_id),
        ));
    }
    let holder_identity =
        user.user_type == UserType::ClusterPeer && user.node.as_deref() == Some(holder.node);
    let own_lock = peer.is_loopback() && holder.node == local_node;
    if !(holder_identity || own_lock) {
        return Err(GridError::new(
            ErrorKind::LockContended,
            format!("node lock is held by '{}', not by the caller", holder.node),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::hash_password;
    use std::time::Duration;

    fn user(ty: UserType, password: &str, node: Option<&str>) -> UserConfig {
        let stored = hash_password(password).unwrap();
        UserConfig {
            user_type: ty,
            password: Some(stored.hash),
            salt: Some(stored.salt),
            global_permissions: vec![],
            node: node.map(str::to_string),
        }
    }

    fn users() -> BTreeMap<String, UserConfig> {
        let mut users = BTreeMap::new();
        users.insert("alice".to_string(), user(UserType::Local, "pw", None));
        users.insert("bob".to_string(), user(UserType::Local, "pw2", None));
        users.insert(
            "vmgrid-peer-beta".to_string(),
            user(UserType::ClusterPeer, "peerpw", Some("beta")),
        );
        users
    }

    fn table() -> SessionTable {
        SessionTable::new(Duration::from_secs(60))
    }

    #[test]
    fn password_login_mints_session_usable_later() {
        let users = users();
        let sessions = table();
        let ctx = authenticate(
            &Handshake::password("alice", "pw"),
            &users,
            &sessions,
            &PeerInfo::default(),
            "alpha",
            None,
        )
        .unwrap();
        let seid = ctx.session.clone().unwrap();
        assert_eq!(ctx.effective_user, "alice");

        let again =
            authenticate(&Handshake::session("alice", &seid), &users, &sessions, &PeerInfo::default(), "alpha", None)
                .unwrap();
        assert_eq!(again.username, "alice");
        assert_eq!(again.session.as_deref(), Some(seid.as_str()));
    }

    #[test]
    fn bad_or_missing_credentials() {
        let users = users();
        let sessions = table();
        let peer = PeerInfo::default();
        let wrong = authenticate(&Handshake::password("alice", "nope"), &users, &sessions, &peer, "alpha", None);
        assert_eq!(wrong.unwrap_err().kind, ErrorKind::Unauthenticated);
        let empty = authenticate(&Handshake::default(), &users, &sessions, &peer, "alpha", None);
        assert_eq!(empty.unwrap_err().kind, ErrorKind::Unauthenticated);
    }

    #[test]
    fn proxy_user_requires_node_identity() {
        let users = users();
        let sessions = table();
        let peer = PeerInfo::default();

        let hs = Handshake::password("alice", "pw").with_proxy_user(Some("bob"));
        let err = authenticate(&hs, &users, &sessions, &peer, "alpha", None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);

        let hs = Handshake::password("vmgrid-peer-beta", "peerpw").with_proxy_user(Some("bob"));
        let ctx = authenticate(&hs, &users, &sessions, &peer, "alpha", None).unwrap();
        assert_eq!(ctx.effective_user, "bob");
        assert!(ctx.is_proxied());
    }

    fn held<'a>(node: &'a str, task_id: &'a str) -> Option<HeldLock<'a>> {
        Some(HeldLock { node, task_id })
    }

    #[test]
    fn lock_claim_rules() {
        let users = users();
        let sessions = table();
        let remote = PeerInfo::new("10.0.0.2:5000".parse().unwrap());

        let claim = Handshake::password("vmgrid-peer-beta", "peerpw").with_lock_claim(Some("tsk-1"));
        let err = authenticate(&claim, &users, &sessions, &remote, "alpha", None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);

        let ctx = authenticate(&claim, &users, &sessions, &remote, "alpha", held("beta", "tsk-1")).unwrap();
        assert!(ctx.lock_claim);
        assert_eq!(ctx.task_id.as_deref(), Some("tsk-1"));

        let err = authenticate(&claim, &users, &sessions, &remote, "alpha", held("gamma", "tsk-1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);
    }

    #[test]
    fn lock_claim_must_name_the_holders_task() {
        let users = users();
        let sessions = table();
        let remote = PeerInfo::new("10.0.0.2:5000".parse().unwrap());

        let untasked = Handshake::password("vmgrid-peer-beta", "peerpw").with_lock_claim(None);
        let err = authenticate(&untasked, &users, &sessions, &remote, "alpha", held("beta", "tsk-1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);

        let stale = Handshake::password("vmgrid-peer-beta", "peerpw").with_lock_claim(Some("tsk-0"));
        let err = authenticate(&stale, &users, &sessions, &remote, "alpha", held("beta", "tsk-1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);
    }

    #[test]
    fn loopback_claims_only_cover_our_own_lock() {
        let users = users();
        let sessions = table();
        let remote = PeerInfo::new("10.0.0.2:5000".parse().unwrap());
        let loopback = PeerInfo::new("127.0.0.1:5000".parse().unwrap());

        let local_claim = Handshake::password("alice", "pw").with_lock_claim(Some("tsk-1"));
        let err = authenticate(&local_claim, &users, &sessions, &remote, "alpha", held("alpha", "tsk-1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);

        // Held by another node: loopback is no substitute for its identity.
        let err =
            authenticate(&local_claim, &users, &sessions, &loopback, "alpha", held("beta", "tsk-1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);

        let untasked = Handshake::password("alice", "pw").with_lock_claim(None);
        let err = authenticate(&untasked, &users, &sessions, &loopback, "alpha", held("alpha", "tsk-1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockContended);

        assert!(authenticate(&local_claim, &users, &sessions, &loopback, "alpha", held("alpha", "tsk-1")).is_ok());
    }

    #[test]
    fn handshake_wire_names() {
        let hs = Handshake::session("alice", "abc").with_lock_claim(None);
        let json = serde_json::to_value(&hs).unwrap();
        assert_eq!(json["USER"], "alice");
        assert_eq!(json["SEID"], "abc");
        assert_eq!(json["HAS_LOCK"], true);
        assert!(json.get("PASS").is_none());
    }
}
