//! Device-side collaborator interfaces.
//!
//! The master implements these against the live device session; the slave
//! gets proxy implementations (see [`crate::facade`]) that forward every call
//! to the master. Code above the mount cannot tell the two apart.

use crate::error::MountResult;
use crate::protocol::RpcOutput;
use crate::schema::SchemaModel;
use async_trait::async_trait;
use netmount_types::{DataNode, DataTreeId, DeviceId, EditOperation, NodePath, QName, SchemaPath, Store};
use std::sync::Arc;

/// A transaction that can read device data.
#[async_trait]
pub trait ReadTransaction: Send + Sync {
    /// Reads the subtree at `path`, restricted to `fields` when non-empty.
    /// `None` means nothing exists there.
    async fn read(
        &self,
        store: Store,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>>;

    /// Whether anything exists at `path`.
    async fn exists(&self, store: Store, path: &NodePath) -> MountResult<bool>;
}

/// A transaction that stages writes and commits them atomically.
#[async_trait]
pub trait WriteTransaction: Send + Sync {
    async fn put(&mut self, store: Store, path: NodePath, node: DataNode) -> MountResult<()>;

    async fn merge(&mut self, store: Store, path: NodePath, node: DataNode) -> MountResult<()>;

    async fn delete(&mut self, store: Store, path: NodePath) -> MountResult<()>;

    /// Abandons staged changes. Returns `false` if the transaction was
    /// already finished.
    async fn cancel(&mut self) -> bool;

    async fn commit(&mut self) -> MountResult<()>;
}

/// A transaction that can both read and write.
pub trait ReadWriteTransaction: ReadTransaction + WriteTransaction {}

impl<T: ReadTransaction + WriteTransaction> ReadWriteTransaction for T {}

/// Factory for device transactions.
#[async_trait]
pub trait DataBroker: Send + Sync {
    /// Read-only transactions are side-effect free and may be shared.
    async fn new_read_only_transaction(&self) -> MountResult<Arc<dyn ReadTransaction>>;

    async fn new_write_only_transaction(&self) -> MountResult<Box<dyn WriteTransaction>>;

    async fn new_read_write_transaction(&self) -> MountResult<Box<dyn ReadWriteTransaction>>;
}

/// Simplified edit/commit interface over the device's datastores.
#[async_trait]
pub trait DataTreeService: Send + Sync {
    async fn lock(&self) -> MountResult<Option<RpcOutput>>;

    async fn unlock(&self) -> MountResult<Option<RpcOutput>>;

    async fn discard_changes(&self) -> MountResult<Option<RpcOutput>>;

    /// Reads operational data.
    async fn get(&self, path: &NodePath, fields: &[NodePath]) -> MountResult<Option<DataNode>>;

    /// Reads configuration data.
    async fn get_config(
        &self,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>>;

    async fn merge(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()>;

    async fn replace(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()>;

    async fn create(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()>;

    async fn delete(&self, store: Store, path: NodePath) -> MountResult<()>;

    async fn remove(&self, store: Store, path: NodePath) -> MountResult<()>;

    async fn commit(&self) -> MountResult<Option<RpcOutput>>;

    async fn cancel(&self) -> MountResult<Option<RpcOutput>>;
}

/// Invokes device RPCs. `Ok(None)` is a device answer with no result.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn invoke_rpc(&self, name: &QName, input: Option<DataNode>)
    -> MountResult<Option<RpcOutput>>;
}

/// Invokes device actions bound to a data-tree node.
#[async_trait]
pub trait ActionService: Send + Sync {
    async fn invoke_action(
        &self,
        path: &SchemaPath,
        target: &DataTreeId,
        input: Option<DataNode>,
    ) -> MountResult<Option<RpcOutput>>;
}

/// Capability token returned by a registry; closing it withdraws what was
/// registered. Consuming `self` makes a second close impossible.
pub trait Registration: Send + Sync {
    fn close(self: Box<Self>);
}

/// The set of services a mount point exposes.
#[derive(Clone)]
pub struct DeviceServices {
    pub data_broker: Arc<dyn DataBroker>,
    pub data_tree: Option<Arc<dyn DataTreeService>>,
    pub rpcs: Option<Arc<dyn RpcService>>,
    pub actions: Option<Arc<dyn ActionService>>,
}

impl DeviceServices {
    /// Services with only a data broker.
    pub fn new(data_broker: Arc<dyn DataBroker>) -> Self {
        Self {
            data_broker,
            data_tree: None,
            rpcs: None,
            actions: None,
        }
    }

    pub fn with_data_tree(mut self, data_tree: Arc<dyn DataTreeService>) -> Self {
        self.data_tree = Some(data_tree);
        self
    }

    pub fn with_rpcs(mut self, rpcs: Arc<dyn RpcService>) -> Self {
        self.rpcs = Some(rpcs);
        self
    }

    pub fn with_actions(mut self, actions: Arc<dyn ActionService>) -> Self {
        self.actions = Some(actions);
        self
    }
}

/// Node-local sink where a resolved model and its services become visible
/// to the rest of the node.
pub trait MountPointService: Send + Sync {
    fn register(
        &self,
        device: &DeviceId,
        model: SchemaModel,
        services: DeviceServices,
    ) -> MountResult<Box<dyn Registration>>;
}
