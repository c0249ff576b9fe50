//! Data-tree addressing and payload types.
//!
//! The mount never interprets the content of a [`DataNode`]; it only carries
//! it between the caller and the device. Paths are likewise opaque apart
//! from their textual form, `/segment/segment`.

use crate::{Error, QName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which datastore an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Store {
    /// Intended configuration.
    Configuration,
    /// Operational state.
    Operational,
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => f.write_str("CONFIGURATION"),
            Self::Operational => f.write_str("OPERATIONAL"),
        }
    }
}

/// Path to a node in the device's data tree. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(Vec<String>);

impl NodePath {
    /// The root of the data tree.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Builds a path from its segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Returns a new path one level below this one.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// The path segments, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for NodePath {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| Error::InvalidPath(s.to_string()))?;
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(Error::InvalidPath(s.to_string()));
        }
        Ok(Self(segments))
    }
}

/// A named subtree of device data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    /// Node name (usually the last path segment it lives at).
    pub name: String,
    /// The node body.
    pub value: serde_json::Value,
}

impl DataNode {
    /// Creates a data node.
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Parses a node body from a JSON string.
    pub fn from_json(name: impl Into<String>, json: &str) -> crate::Result<Self> {
        Ok(Self::new(name, serde_json::from_str(json)?))
    }
}

/// Addresses a subtree inside a specific datastore; the target of an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataTreeId {
    pub store: Store,
    pub path: NodePath,
}

impl DataTreeId {
    pub fn new(store: Store, path: NodePath) -> Self {
        Self { store, path }
    }
}

impl fmt::Display for DataTreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store, self.path)
    }
}

/// Default operation applied to an edit when the payload does not say
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOperation {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
    None,
}

/// Absolute schema path of an action, outermost name first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaPath(Vec<QName>);

impl SchemaPath {
    pub fn new(names: Vec<QName>) -> Self {
        Self(names)
    }

    pub fn names(&self) -> &[QName] {
        &self.0
    }

    /// The innermost name, which is the action itself.
    pub fn last(&self) -> Option<&QName> {
        self.0.last()
    }
}

impl fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in &self.0 {
            write!(f, "/{name}")?;
        }
        Ok(())
    }
}

/// Severity of a device-reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Error,
    Warning,
}

/// One structured error returned alongside (or instead of) an RPC output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub severity: ErrorSeverity,
    /// Protocol error tag, e.g. `operation-failed`.
    pub tag: String,
    pub message: String,
}

impl RpcError {
    /// Creates an error-severity entry.
    pub fn error(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ErrorSeverity::Error,
            tag: tag.into(),
            message: message.into(),
        }
    }

    /// Creates a warning-severity entry.
    pub fn warning(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ErrorSeverity::Warning,
            tag: tag.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}: {}", self.severity, self.tag, self.message)
    }
}
