//! Password hashing.
//!
//! PBKDF2-HMAC-SHA512 with a 32-byte random salt, 10 000 iterations and a
//! 64-byte output. Hash and salt are stored hex-encoded; comparison is
//! constant time.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use subtle::ConstantTimeEq;
use vmgrid_core::{GridError, GridResult};

pub const SALT_LEN: usize = 32;
pub const ITERATIONS: u32 = 10_000;
pub const HASH_LEN: usize = 64;
pub const TOKEN_LEN: usize = 32;

/// A stored password: hex hash plus hex salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub hash: String,
    pub salt: String,
}

pub fn random_bytes(buf: &mut [u8]) -> GridResult<()> {
    getrandom::getrandom(buf).map_err(|e| GridError::bug(format!("getrandom failed: {e}")))
}

/// 32 random bytes, hex-encoded. Used for session ids, one-time tokens and
/// cluster-peer passwords.
pub fn random_token() -> GridResult<String> {
    let mut buf = [0u8; TOKEN_LEN];
    random_bytes(&mut buf)?;
    Ok(hex::encode(buf))
}

pub fn hash_with_salt(password: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, ITERATIONS, &mut out);
    out
}

/// Hash `password` under a fresh salt.
pub fn hash_password(password: &str) -> GridResult<PasswordHash> {
    let mut salt = [0u8; SALT_LEN];
    random_bytes(&mut salt)?;
    Ok(PasswordHash {
        hash: hex::encode(hash_with_salt(password, &salt)),
        salt: hex::encode(salt),
    })
}

/// Check `password` against a stored hex hash and salt. Malformed stored
/// values never match.
pub fn verify_password(password: &str, hash_hex: &str, salt_hex: &str) -> bool {
    let (Ok(expected), Ok(salt)) = (hex::decode(hash_hex), hex::decode(salt_hex)) else {
        return false;
    };
    if expected.len() != HASH_LEN {
        return false;
    }
    let actual = hash_with_salt(password, &salt);
    actual.as_slice().ct_eq(expected.as_slice()).into()
}
