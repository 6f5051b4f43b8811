//! Error taxonomy shared by every VMGrid component.
//!
//! Errors cross node boundaries, so they are plain data: a [`ErrorKind`],
//! a human-readable message, and the causes reported by peers during a
//! fan-out. Collaborator failures (libvirt, LVM, filesystem) are mapped to a
//! kind at the boundary where they are caught.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used across the workspace.
pub type GridResult<T> = Result<T, GridError>;

/// Error kinds. The names are part of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // Auth
    Unauthenticated,
    InsufficientPrivileges,
    SessionExpired,
    // Validation
    InvalidHostname,
    InvalidIPAddress,
    InvalidNetworkName,
    InvalidVolumeGroupName,
    InvalidPermission,
    InvalidId,
    InvalidConnectString,
    InvalidArgument,
    // State
    VmRunning,
    VmStopped,
    VmLocked,
    IsoInUse,
    NetworkUtilised,
    VolumeAlreadyExists,
    VolumeDoesNotExist,
    ReplicatedVolumeNotInSync,
    EntityAlreadyExists,
    // Topology
    ClusterUnavailable,
    PeerUnreachable,
    IsoNotPresentOnDestination,
    CannotMigrateLocalDisk,
    // Resource
    LockContended,
    TimeoutExceeded,
    ExternalCommandFailed,
    LibvirtFailure,
    // Upgrade
    IntermediateUpgradeRequired,
    VersionMismatch,
    // Internal
    ConfigNotFound,
    ObjectNotFound,
    Cancelled,
    Bug,
}

impl ErrorKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::InsufficientPrivileges => "InsufficientPrivileges",
            Self::SessionExpired => "SessionExpired",
            Self::InvalidHostname => "InvalidHostname",
            Self::InvalidIPAddress => "InvalidIPAddress",
            Self::InvalidNetworkName => "InvalidNetworkName",
            Self::InvalidVolumeGroupName => "InvalidVolumeGroupName",
            Self::InvalidPermission => "InvalidPermission",
            Self::InvalidId => "InvalidId",
            Self::InvalidConnectString => "InvalidConnectString",
            Self::InvalidArgument => "InvalidArgument",
            Self::VmRunning => "VmRunning",
            Self::VmStopped => "VmStopped",
            Self::VmLocked => "VmLocked",
            Self::IsoInUse => "IsoInUse",
            Self::NetworkUtilised => "NetworkUtilised",
            Self::VolumeAlreadyExists => "VolumeAlreadyExists",
            Self::VolumeDoesNotExist => "VolumeDoesNotExist",
            Self::ReplicatedVolumeNotInSync => "ReplicatedVolumeNotInSync",
            Self::EntityAlreadyExists => "EntityAlreadyExists",
            Self::ClusterUnavailable => "ClusterUnavailable",
            Self::PeerUnreachable => "PeerUnreachable",
            Self::IsoNotPresentOnDestination => "IsoNotPresentOnDestination",
            Self::CannotMigrateLocalDisk => "CannotMigrateLocalDisk",
            Self::LockContended => "LockContended",
            Self::TimeoutExceeded => "TimeoutExceeded",
            Self::ExternalCommandFailed => "ExternalCommandFailed",
            Self::LibvirtFailure => "LibvirtFailure",
            Self::IntermediateUpgradeRequired => "IntermediateUpgradeRequired",
            Self::VersionMismatch => "VersionMismatch",
            Self::ConfigNotFound => "ConfigNotFound",
            Self::ObjectNotFound => "ObjectNotFound",
            Self::Cancelled => "Cancelled",
            Self::Bug => "Bug",
        }
    }

    /// Whether the kind means the peer could not be reached at all, as
    /// opposed to the peer answering with a failure.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::PeerUnreachable | Self::TimeoutExceeded)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by one peer during a fan-out or its undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCause {
    pub node: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// The error type carried by every VMGrid operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct GridError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peer_causes: Vec<PeerCause>,
}

impl GridError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            peer_causes: Vec::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Attach the failure `cause` reported by `node`.
    pub fn with_peer_cause(mut self, node: &str, cause: &GridError) -> Self {
        self.peer_causes.push(PeerCause {
            node: node.to_string(),
            kind: cause.kind,
            message: cause.message.clone(),
        });
        self
    }

    // ── Shorthand constructors ─────────────────────────────────────

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn insufficient_privileges(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientPrivileges, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ObjectNotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EntityAlreadyExists, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "task was cancelled")
    }

    pub fn bug(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bug, message)
    }
}

impl From<serde_json::Error> for GridError {
    fn from(e: serde_json::Error) -> Self {
        GridError::invalid_argument(format!("malformed value: {e}"))
    }
}
