//! Connect strings: everything a cluster needs to adopt a fresh node.
//!
//! The string is hex-encoded JSON so it survives copy and paste through
//! terminals and ticket systems.

use serde::{Deserialize, Serialize};
use vmgrid_core::validate::{validate_hostname, validate_ip_address};
use vmgrid_core::{ErrorKind, GridError, GridResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectString {
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    /// One-time password of the joining node's bootstrap user.
    pub token: String,
    /// The joining node's CA, trusted for the bootstrap connection only.
    pub ca_pem: String,
}

impl ConnectString {
    pub fn encode(&self) -> GridResult<String> {
        let json = serde_json::to_vec(self).map_err(|e| GridError::bug(e.to_string()))?;
        Ok(hex::encode(json))
    }

    pub fn decode(s: &str) -> GridResult<Self> {
        let invalid = |detail: String| {
            GridError::new(ErrorKind::InvalidConnectString, format!("invalid connect string: {detail}"))
        };
        let bytes = hex::decode(s.trim()).map_err(|e| invalid(e.to_string()))?;
        let parsed: ConnectString =
            serde_json::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
        validate_hostname(&parsed.hostname)?;
        validate_ip_address(&parsed.ip)?;
        if parsed.token.is_empty() {
            return Err(invalid("empty token".into()));
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectString {
        ConnectString {
            hostname: "gamma".into(),
            ip: "10.0.0.3".into(),
            port: 8089,
            token: "abc123".into(),
            ca_pem: "-----BEGIN CERTIFICATE-----\n".into(),
        }
    }

    #[test]
    fn decode_reverses_encode() {
        let encoded = sample().encode().unwrap();
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ConnectString::decode(&format!("  {encoded}\n")).unwrap(), sample());
    }

    #[test]
    fn garbage_is_rejected() {
        let err = ConnectString::decode("not-hex").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConnectString);
        let err = ConnectString::decode(&hex::encode(b"{}")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConnectString);
    }

    #[test]
    fn bad_ip_uses_its_own_kind() {
        let mut cs = sample();
        cs.ip = "10.0.0".into();
        let err = ConnectString::decode(&cs.encode().unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidIPAddress);
    }
}
