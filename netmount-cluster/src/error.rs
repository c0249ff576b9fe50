//! Error types for the mount layer.

use crate::protocol::Role;
use netmount_types::{NodePath, SourceId, Store};
use std::time::Duration;
use thiserror::Error;

/// Result type for mount operations.
pub type MountResult<T> = Result<T, MountError>;

/// Errors that can occur in mount operations.
#[derive(Debug, Clone, Error)]
pub enum MountError {
    /// Mountpoint discovery reached a node that does not hold the device.
    #[error("{device}: not the master for this mount point")]
    NotMaster { device: String },

    /// A message arrived that the coordinator's current role cannot serve.
    #[error("{device}: {operation} requires role {expected}, current role is {actual}")]
    RoleMismatch {
        device: String,
        operation: &'static str,
        expected: Role,
        actual: Role,
    },

    /// The peer did not answer within the ask timeout.
    #[error("{device}: no reply to {operation} within {timeout:?}, master may be down")]
    AskTimeout {
        device: String,
        operation: &'static str,
        timeout: Duration,
    },

    /// The target actor has stopped.
    #[error("channel closed")]
    ChannelClosed,

    /// The transaction proxy was committed, cancelled or abandoned.
    #[error("transaction {0} is closed")]
    TransactionClosed(String),

    /// A read through a transaction or data-tree session failed.
    #[error("read of {store} {path} failed: {source}")]
    ReadFailed {
        store: Store,
        path: NodePath,
        #[source]
        source: Box<MountError>,
    },

    /// A commit through a proxy failed.
    #[error("{device}: commit failed: {source}")]
    CommitFailed {
        device: String,
        #[source]
        source: Box<MountError>,
    },

    /// The device itself rejected or failed an operation.
    #[error("device error: {0}")]
    Device(String),

    /// No provider knows the requested schema source.
    #[error("schema source not found: {0}")]
    SourceNotFound(SourceId),

    /// Building the schema model failed.
    #[error("schema resolution failed: {source}")]
    SchemaResolution {
        #[source]
        source: Box<MountError>,
    },

    /// The device does not offer the requested service.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MountError {
    /// Follows wrapped errors down to the one that started the chain.
    pub fn root_cause(&self) -> &MountError {
        match self {
            Self::ReadFailed { source, .. }
            | Self::CommitFailed { source, .. }
            | Self::SchemaResolution { source } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the failure was a remote-call timeout, the only class the
    /// schema resolver retries.
    pub fn is_transient(&self) -> bool {
        matches!(self.root_cause(), Self::AskTimeout { .. })
    }
}

impl From<serde_json::Error> for MountError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
