//! Input validators. Each maps to its own error kind so callers can tell
//! which field was rejected.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ErrorKind, GridError, GridResult};

static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$")
        .expect("valid hostname regex")
});

static NETWORK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]{0,63}$").expect("valid network regex"));

static VOLUME_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9+_.][a-zA-Z0-9+_.-]{0,126}$").expect("valid vg regex"));

static ENTITY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").expect("valid name regex"));

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]{0,63}$").expect("valid username regex"));

pub fn validate_hostname(name: &str) -> GridResult<()> {
    if name.len() <= 253 && HOSTNAME.is_match(name) {
        Ok(())
    } else {
        Err(GridError::new(
            ErrorKind::InvalidHostname,
            format!("'{name}' is not a valid hostname"),
        ))
    }
}

pub fn validate_ip_address(ip: &str) -> GridResult<Ipv4Addr> {
    ip.parse::<Ipv4Addr>().map_err(|_| {
        GridError::new(
            ErrorKind::InvalidIPAddress,
            format!("'{ip}' is not a valid IPv4 address"),
        )
    })
}

pub fn validate_network_name(name: &str) -> GridResult<()> {
    if NETWORK_NAME.is_match(name) {
        Ok(())
    } else {
        Err(GridError::new(
            ErrorKind::InvalidNetworkName,
            format!("'{name}' is not a valid network name"),
        ))
    }
}

pub fn validate_volume_group_name(name: &str) -> GridResult<()> {
    if name != "." && name != ".." && VOLUME_GROUP.is_match(name) {
        Ok(())
    } else {
        Err(GridError::new(
            ErrorKind::InvalidVolumeGroupName,
            format!("'{name}' is not a valid volume group name"),
        ))
    }
}

/// VM, group and storage backend names.
pub fn validate_entity_name(name: &str) -> GridResult<()> {
    if ENTITY_NAME.is_match(name) {
        Ok(())
    } else {
        Err(GridError::invalid_argument(format!("'{name}' is not a valid name")))
    }
}

pub fn validate_username(name: &str) -> GridResult<()> {
    if USERNAME.is_match(name) {
        Ok(())
    } else {
        Err(GridError::invalid_argument(format!("'{name}' is not a valid username")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostnames() {
        assert!(validate_hostname("alpha").is_ok());
        assert!(validate_hostname("node-1.example.com").is_ok());
        assert!(validate_hostname("-bad").is_err());
        assert!(validate_hostname("has space").is_err());
        assert!(validate_hostname("").is_err());
    }

    #[test]
    fn ip_addresses() {
        assert!(validate_ip_address("10.0.0.1").is_ok());
        let err = validate_ip_address("10.0.0.256").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidIPAddress);
    }

    #[test]
    fn network_and_volume_group_names() {
        assert!(validate_network_name("br-prod").is_ok());
        assert_eq!(
            validate_network_name("bad/name").unwrap_err().kind,
            ErrorKind::InvalidNetworkName
        );
        assert!(validate_volume_group_name("vg_data").is_ok());
        assert_eq!(
            validate_volume_group_name("..").unwrap_err().kind,
            ErrorKind::InvalidVolumeGroupName
        );
    }
}
