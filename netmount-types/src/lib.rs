//! Core type definitions for the clustered device mount.
//!
//! This crate defines the plain data exchanged between cluster nodes:
//! - Device, transaction and schema-source identifiers
//! - Data-tree paths and nodes carried by reads and edits
//! - RPC/action names and the structured errors a device may report
//!
//! Nothing here is async and nothing here knows about roles or actors; those
//! live in `netmount-cluster`.

mod ids;
mod node;

pub use ids::{DeviceId, QName, SourceId, TransactionId};
pub use node::{
    DataNode, DataTreeId, EditOperation, ErrorSeverity, NodePath, RpcError, SchemaPath, Store,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when parsing identifiers and paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid device address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("invalid qualified name: {0}")]
    InvalidQName(String),

    #[error("invalid node path: {0}")]
    InvalidPath(String),

    #[error("invalid source identifier: {0}")]
    InvalidSource(String),
}
