//! vmgrid-auth — who is calling, and may they do this?
//!
//! - [`password`]: PBKDF2-HMAC-SHA512 hashing and random tokens
//! - [`session`]: the in-memory session table with sliding expiry
//! - [`handshake`]: turning request credentials into an [`AuthContext`]
//! - [`permissions`]: global, per-VM and group permission checks

pub mod handshake;
pub mod password;
pub mod permissions;
pub mod session;

pub use handshake::{AuthContext, Handshake, HeldLock, PeerInfo, authenticate};
pub use password::{PasswordHash, hash_password, random_token, verify_password};
pub use permissions::{check_permission, has_permission};
pub use session::{Session, SessionTable};
