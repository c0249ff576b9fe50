//! Messages exchanged between mount actors.
//!
//! Every actor owns a bounded mailbox of one closed enum. Requests that
//! expect an answer carry a `oneshot` sender; fire-and-forget edits carry
//! none. Answers use a three-way outcome: `Err` for failure, and
//! [`Reply::Empty`] versus [`Reply::Value`] so a caller can tell "the device
//! had nothing to report" apart from "here is the result".

use crate::config::MountConfig;
use crate::coordinator::MountPointHandle;
use crate::error::{MountError, MountResult};
use crate::proxy::{DataTreeRef, ReadTransactionRef, TransactionRef};
use crate::schema::{SchemaModel, SchemaSource};
use crate::services::DeviceServices;
use netmount_types::{
    DataNode, DataTreeId, DeviceId, EditOperation, NodePath, QName, RpcError, SchemaPath,
    SourceId, Store,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Reply channel for one request.
pub type ReplyTx<T> = oneshot::Sender<MountResult<T>>;

/// Role a coordinator holds for its device on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Unassigned,
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unassigned => f.write_str("unassigned"),
            Self::Master => f.write_str("master"),
            Self::Slave => f.write_str("slave"),
        }
    }
}

/// Successful outcome of a proxied call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply<T> {
    /// The device answered with nothing.
    Empty,
    /// The device answered with a value.
    Value(T),
}

impl<T> Reply<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Empty => None,
            Self::Value(value) => Some(value),
        }
    }
}

impl<T> From<Option<T>> for Reply<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Value(value),
            None => Self::Empty,
        }
    }
}

/// Result of an RPC or action: an optional output plus the errors the
/// device reported alongside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcOutput {
    pub output: Option<DataNode>,
    pub errors: Vec<RpcError>,
}

impl RpcOutput {
    pub fn with_output(node: DataNode) -> Self {
        Self {
            output: Some(node),
            errors: Vec::new(),
        }
    }

    pub fn with_errors(errors: Vec<RpcError>) -> Self {
        Self {
            output: None,
            errors,
        }
    }
}

/// New settings applied by a refresh.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub config: MountConfig,
    /// Replaces the device identity when set.
    pub device: Option<DeviceId>,
}

/// Snapshot of a coordinator's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountStatus {
    pub device: DeviceId,
    pub role: Role,
    /// Bumped on every role change, refresh and unregister.
    pub generation: u64,
    /// Whether a slave façade is currently registered.
    pub mounted: bool,
}

/// Mailbox of the mount-point coordinator.
pub enum CoordinatorMessage {
    /// Take the master role with the device's live services.
    BecomeMaster {
        sources: Vec<SourceId>,
        services: DeviceServices,
        reply: ReplyTx<()>,
    },
    /// Take the slave role behind `master` (the `RegisterMountpoint` message).
    BecomeSlave {
        sources: Vec<SourceId>,
        master: MountPointHandle,
        reply: ReplyTx<()>,
    },
    /// A slave looks for the master; answered with `NotMaster` elsewhere.
    AskForMasterMountpoint {
        slave: MountPointHandle,
        reply: ReplyTx<()>,
    },
    Refresh {
        settings: RefreshSettings,
        reply: ReplyTx<()>,
    },
    Unregister,
    Status {
        reply: ReplyTx<MountStatus>,
    },
    FetchSchemaSource {
        source: SourceId,
        reply: ReplyTx<SchemaSource>,
    },
    NewReadTransaction {
        reply: ReplyTx<ReadTransactionRef>,
    },
    NewWriteTransaction {
        reply: ReplyTx<TransactionRef>,
    },
    NewReadWriteTransaction {
        reply: ReplyTx<TransactionRef>,
    },
    NewDataTreeService {
        reply: ReplyTx<DataTreeRef>,
    },
    /// One-shot read against the shared read-only transaction.
    Read {
        store: Store,
        path: NodePath,
        fields: Vec<NodePath>,
        reply: ReplyTx<Reply<DataNode>>,
    },
    Exists {
        store: Store,
        path: NodePath,
        reply: ReplyTx<bool>,
    },
    InvokeRpc {
        name: QName,
        input: Option<DataNode>,
        reply: ReplyTx<Reply<RpcOutput>>,
    },
    InvokeAction {
        path: SchemaPath,
        target: DataTreeId,
        input: Option<DataNode>,
        reply: ReplyTx<Reply<RpcOutput>>,
    },
    /// Continuation: a schema model was built for `generation`.
    SchemaResolved {
        generation: u64,
        model: SchemaModel,
    },
    /// Continuation: resolution attempt `attempt` for `generation` failed.
    SchemaResolutionFailed {
        generation: u64,
        attempt: u32,
        error: MountError,
    },
    Shutdown,
}

impl CoordinatorMessage {
    /// Short name used in logs and role-mismatch errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BecomeMaster { .. } => "BecomeMaster",
            Self::BecomeSlave { .. } => "BecomeSlave",
            Self::AskForMasterMountpoint { .. } => "AskForMasterMountpoint",
            Self::Refresh { .. } => "Refresh",
            Self::Unregister => "Unregister",
            Self::Status { .. } => "Status",
            Self::FetchSchemaSource { .. } => "FetchSchemaSource",
            Self::NewReadTransaction { .. } => "NewReadTransaction",
            Self::NewWriteTransaction { .. } => "NewWriteTransaction",
            Self::NewReadWriteTransaction { .. } => "NewReadWriteTransaction",
            Self::NewDataTreeService { .. } => "NewDataTreeService",
            Self::Read { .. } => "Read",
            Self::Exists { .. } => "Exists",
            Self::InvokeRpc { .. } => "InvokeRpc",
            Self::InvokeAction { .. } => "InvokeAction",
            Self::SchemaResolved { .. } => "SchemaResolved",
            Self::SchemaResolutionFailed { .. } => "SchemaResolutionFailed",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Mailbox of a write or read-write transaction proxy.
pub enum TransactionRequest {
    Read {
        store: Store,
        path: NodePath,
        fields: Vec<NodePath>,
        reply: ReplyTx<Reply<DataNode>>,
    },
    Exists {
        store: Store,
        path: NodePath,
        reply: ReplyTx<bool>,
    },
    Put {
        store: Store,
        path: NodePath,
        node: DataNode,
    },
    Merge {
        store: Store,
        path: NodePath,
        node: DataNode,
    },
    Delete {
        store: Store,
        path: NodePath,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Commit {
        reply: ReplyTx<()>,
    },
}

/// Mailbox of a data-tree service proxy.
pub enum DataTreeRequest {
    Lock {
        reply: ReplyTx<Reply<RpcOutput>>,
    },
    Unlock {
        reply: ReplyTx<Reply<RpcOutput>>,
    },
    DiscardChanges {
        reply: ReplyTx<Reply<RpcOutput>>,
    },
    Get {
        path: NodePath,
        fields: Vec<NodePath>,
        reply: ReplyTx<Reply<DataNode>>,
    },
    GetConfig {
        path: NodePath,
        fields: Vec<NodePath>,
        reply: ReplyTx<Reply<DataNode>>,
    },
    Merge {
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    },
    Replace {
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    },
    Create {
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    },
    Delete {
        store: Store,
        path: NodePath,
    },
    Remove {
        store: Store,
        path: NodePath,
    },
    Commit {
        reply: ReplyTx<Reply<RpcOutput>>,
    },
    Cancel {
        reply: ReplyTx<Reply<RpcOutput>>,
    },
}

/// Waits for the answer to an ask, bounded by `timeout`.
pub(crate) async fn await_reply<T>(
    device: &DeviceId,
    operation: &'static str,
    timeout: std::time::Duration,
    rx: oneshot::Receiver<MountResult<T>>,
) -> MountResult<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(MountError::ChannelClosed),
        Err(_) => Err(MountError::AskTimeout {
            device: device.to_string(),
            operation,
            timeout,
        }),
    }
}
