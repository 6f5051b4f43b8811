//! Opaque entity identifiers.
//!
//! Ids have the form `<prefix>-<name-hash18>-<date-hash22>`: the first 18
//! hex characters of SHA-512 over the entity name, then the first 22 hex
//! characters of SHA-512 over the creation timestamp. Ids never change once
//! minted, and every cross-reference in the configuration uses them.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha512};

use crate::error::{ErrorKind, GridError, GridResult};

const NAME_HASH_LEN: usize = 18;
const DATE_HASH_LEN: usize = 22;

/// Disambiguates ids minted within the same clock tick.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(vm|hd|sb|gp|tsk)-[0-9a-f]{18}-[0-9a-f]{22}$").expect("valid id regex")
});

/// The kind of entity an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    VirtualMachine,
    HardDrive,
    StorageBackend,
    Group,
    Task,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::VirtualMachine => "vm",
            Self::HardDrive => "hd",
            Self::StorageBackend => "sb",
            Self::Group => "gp",
            Self::Task => "tsk",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "vm" => Some(Self::VirtualMachine),
            "hd" => Some(Self::HardDrive),
            "sb" => Some(Self::StorageBackend),
            "gp" => Some(Self::Group),
            "tsk" => Some(Self::Task),
            _ => None,
        }
    }
}

/// Mint a new id for an entity called `name`.
pub fn generate_id(kind: IdKind, name: &str) -> String {
    generate_id_at(kind, name, Utc::now())
}

/// Mint an id using an explicit creation time.
pub fn generate_id_at(kind: IdKind, name: &str, at: DateTime<Utc>) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let name_hash = hex::encode(Sha512::digest(name.as_bytes()));
    let stamp = format!("{}#{seq}", at.format("%Y-%m-%d %H:%M:%S%.9f"));
    let date_hash = hex::encode(Sha512::digest(stamp.as_bytes()));
    format!(
        "{}-{}-{}",
        kind.prefix(),
        &name_hash[..NAME_HASH_LEN],
        &date_hash[..DATE_HASH_LEN]
    )
}

/// The kind encoded in `id`, if it is well formed.
pub fn id_kind(id: &str) -> Option<IdKind> {
    if !ID_PATTERN.is_match(id) {
        return None;
    }
    id.split('-').next().and_then(IdKind::from_prefix)
}

/// Check that `id` is a well-formed id of the expected kind.
pub fn validate_id(kind: IdKind, id: &str) -> GridResult<()> {
    match id_kind(id) {
        Some(k) if k == kind => Ok(()),
        _ => Err(GridError::new(
            ErrorKind::InvalidId,
            format!("'{id}' is not a valid {} id", kind.prefix()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_expected_shape() {
        let id = generate_id(IdKind::VirtualMachine, "web-1");
        assert!(id.starts_with("vm-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 18);
        assert_eq!(parts[2].len(), 22);
        assert_eq!(id_kind(&id), Some(IdKind::VirtualMachine));
    }

    #[test]
    fn name_hash_is_stable_and_date_hash_differs() {
        let at = Utc::now();
        let a = generate_id_at(IdKind::HardDrive, "disk", at);
        let b = generate_id_at(IdKind::HardDrive, "disk", at);
        assert_eq!(a.split('-').nth(1), b.split('-').nth(1));
        assert_ne!(a, b);
    }

    #[test]
    fn validate_rejects_wrong_kind_and_garbage() {
        let gp = generate_id(IdKind::Group, "admins");
        assert!(validate_id(IdKind::Group, &gp).is_ok());
        let err = validate_id(IdKind::VirtualMachine, &gp).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidId);
        assert!(validate_id(IdKind::Task, "tsk-nothex").is_err());
    }
}
