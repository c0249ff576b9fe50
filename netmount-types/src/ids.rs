//! Identifier types used throughout the mount.
//!
//! Transactions use UUID v7 so that log lines sort by creation time.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a remote device: its topology name plus the address the
/// master connects to. Immutable; used as the routing and log key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    name: String,
    address: SocketAddr,
}

impl DeviceId {
    /// Creates a device identity.
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }

    /// The device's topology name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address of the device.
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteDevice{{{}}}", self.name)
    }
}

/// Unique identifier for one transaction proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Creates a new transaction ID with the current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifies one schema source (a model module), optionally pinned to a
/// revision. Written as `name` or `name@revision`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    name: String,
    revision: Option<String>,
}

impl SourceId {
    /// Creates a source identifier without a revision.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: None,
        }
    }

    /// Pins the identifier to a revision.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Revision, if pinned.
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(rev) => write!(f, "{}@{}", self.name, rev),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for SourceId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, revision) = match s.split_once('@') {
            Some((name, rev)) => (name, Some(rev)),
            None => (s, None),
        };
        if name.is_empty() || revision.is_some_and(str::is_empty) {
            return Err(Error::InvalidSource(s.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            revision: revision.map(str::to_string),
        })
    }
}

/// A module-qualified name, written `module:local`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QName {
    module: String,
    local: String,
}

impl QName {
    /// Creates a qualified name.
    pub fn new(module: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            local: local.into(),
        }
    }

    /// The owning module.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The local name inside the module.
    pub fn local(&self) -> &str {
        &self.local
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.local)
    }
}

impl FromStr for QName {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((module, local)) if !module.is_empty() && !local.is_empty() => {
                Ok(Self::new(module, local))
            }
            _ => Err(Error::InvalidQName(s.to_string())),
        }
    }
}
