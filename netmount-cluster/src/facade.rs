//! Slave-side services that forward every call to the master.
//!
//! These are what a slave registers with its [`MountPointService`]: code on
//! the slave uses them exactly as it would use the device's own services.
//!
//! [`MountPointService`]: crate::services::MountPointService

use crate::coordinator::MountPointHandle;
use crate::error::MountResult;
use crate::protocol::{Reply, RpcOutput};
use crate::proxy::DataTreeRef;
use crate::schema::{SchemaSource, SchemaSourceProvider};
use crate::services::{
    ActionService, DataBroker, DataTreeService, DeviceServices, ReadTransaction,
    ReadWriteTransaction, RpcService, WriteTransaction,
};
use async_trait::async_trait;
use netmount_types::{
    DataNode, DataTreeId, EditOperation, NodePath, QName, SchemaPath, SourceId, Store,
};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Builds the full set of forwarding services for a slave of `master`.
pub fn slave_services(master: MountPointHandle) -> DeviceServices {
    DeviceServices::new(Arc::new(ProxyDataBroker::new(master.clone())))
        .with_data_tree(Arc::new(ProxyDataTreeService::new(master.clone())))
        .with_rpcs(Arc::new(ProxyRpcService::new(master.clone())))
        .with_actions(Arc::new(ProxyActionService::new(master)))
}

/// Opens every transaction on the master.
pub struct ProxyDataBroker {
    master: MountPointHandle,
}

impl ProxyDataBroker {
    pub fn new(master: MountPointHandle) -> Self {
        Self { master }
    }
}

#[async_trait]
impl DataBroker for ProxyDataBroker {
    async fn new_read_only_transaction(&self) -> MountResult<Arc<dyn ReadTransaction>> {
        Ok(Arc::new(self.master.new_read_transaction().await?))
    }

    async fn new_write_only_transaction(&self) -> MountResult<Box<dyn WriteTransaction>> {
        Ok(Box::new(self.master.new_write_transaction().await?))
    }

    async fn new_read_write_transaction(&self) -> MountResult<Box<dyn ReadWriteTransaction>> {
        Ok(Box::new(self.master.new_read_write_transaction().await?))
    }
}

pub struct ProxyRpcService {
    master: MountPointHandle,
}

impl ProxyRpcService {
    pub fn new(master: MountPointHandle) -> Self {
        Self { master }
    }
}

#[async_trait]
impl RpcService for ProxyRpcService {
    async fn invoke_rpc(
        &self,
        name: &QName,
        input: Option<DataNode>,
    ) -> MountResult<Option<RpcOutput>> {
        self.master
            .invoke_rpc(name.clone(), input)
            .await
            .map(Reply::into_option)
    }
}

pub struct ProxyActionService {
    master: MountPointHandle,
}

impl ProxyActionService {
    pub fn new(master: MountPointHandle) -> Self {
        Self { master }
    }
}

#[async_trait]
impl ActionService for ProxyActionService {
    async fn invoke_action(
        &self,
        path: &SchemaPath,
        target: &DataTreeId,
        input: Option<DataNode>,
    ) -> MountResult<Option<RpcOutput>> {
        self.master
            .invoke_action(path.clone(), target.clone(), input)
            .await
            .map(Reply::into_option)
    }
}

/// Fetches schema source text from the master.
pub struct ProxySchemaSourceProvider {
    master: MountPointHandle,
}

impl ProxySchemaSourceProvider {
    pub fn new(master: MountPointHandle) -> Self {
        Self { master }
    }
}

#[async_trait]
impl SchemaSourceProvider for ProxySchemaSourceProvider {
    async fn get_source(&self, id: &SourceId) -> MountResult<SchemaSource> {
        self.master.fetch_schema_source(id.clone()).await
    }
}

/// Data-tree service backed by sessions on the master.
///
/// A session is opened on first use and reused until it ends (after a
/// read, a commit, a cancel or the idle timeout); the next call opens a
/// fresh one. Calls are forwarded one at a time, so an edit never queues
/// behind a request that ends the session.
pub struct ProxyDataTreeService {
    master: MountPointHandle,
    session: Mutex<Option<DataTreeRef>>,
}

/// A live session, holding the slot lock until the forwarded call returns.
struct SessionGuard<'a> {
    _slot: MutexGuard<'a, Option<DataTreeRef>>,
    session: DataTreeRef,
}

impl Deref for SessionGuard<'_> {
    type Target = DataTreeRef;

    fn deref(&self) -> &DataTreeRef {
        &self.session
    }
}

impl ProxyDataTreeService {
    pub fn new(master: MountPointHandle) -> Self {
        Self {
            master,
            session: Mutex::new(None),
        }
    }

    async fn session(&self) -> MountResult<SessionGuard<'_>> {
        let mut slot = self.session.lock().await;
        let open = slot.as_ref().filter(|s| !s.is_closed()).cloned();
        let session = match open {
            Some(session) => session,
            None => {
                let session = self.master.new_data_tree_service().await?;
                *slot = Some(session.clone());
                session
            }
        };
        Ok(SessionGuard {
            _slot: slot,
            session,
        })
    }
}

#[async_trait]
impl DataTreeService for ProxyDataTreeService {
    async fn lock(&self) -> MountResult<Option<RpcOutput>> {
        self.session().await?.lock().await
    }

    async fn unlock(&self) -> MountResult<Option<RpcOutput>> {
        self.session().await?.unlock().await
    }

    async fn discard_changes(&self) -> MountResult<Option<RpcOutput>> {
        self.session().await?.discard_changes().await
    }

    async fn get(&self, path: &NodePath, fields: &[NodePath]) -> MountResult<Option<DataNode>> {
        self.session().await?.get(path, fields).await
    }

    async fn get_config(
        &self,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>> {
        self.session().await?.get_config(path, fields).await
    }

    async fn merge(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        self.session()
            .await?
            .merge(store, path, node, default_operation)
            .await
    }

    async fn replace(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        self.session()
            .await?
            .replace(store, path, node, default_operation)
            .await
    }

    async fn create(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        self.session()
            .await?
            .create(store, path, node, default_operation)
            .await
    }

    async fn delete(&self, store: Store, path: NodePath) -> MountResult<()> {
        self.session().await?.delete(store, path).await
    }

    async fn remove(&self, store: Store, path: NodePath) -> MountResult<()> {
        self.session().await?.remove(store, path).await
    }

    async fn commit(&self) -> MountResult<Option<RpcOutput>> {
        self.session().await?.commit().await
    }

    async fn cancel(&self) -> MountResult<Option<RpcOutput>> {
        self.session().await?.cancel().await
    }
}
