//! One-shot reads against the master's shared read-only transaction.

use super::read_failed;
use crate::coordinator::MountPointHandle;
use crate::error::MountResult;
use crate::protocol::{Reply, ReplyTx};
use crate::services::ReadTransaction;
use async_trait::async_trait;
use netmount_types::{DataNode, DeviceId, NodePath, Store};
use std::sync::Arc;
use tracing::debug;

/// Serves one read in its own task and tears it down after replying.
pub(crate) fn spawn_read(
    device: DeviceId,
    tx: Arc<dyn ReadTransaction>,
    store: Store,
    path: NodePath,
    fields: Vec<NodePath>,
    reply: ReplyTx<Reply<DataNode>>,
) {
    tokio::spawn(async move {
        let result = tx.read(store, &path, &fields).await.map(Reply::from);
        match &result {
            Ok(answer) => debug!("{device}: read {store} {path} done, empty: {}", answer.is_empty()),
            Err(e) => debug!("{device}: read {store} {path} failed: {e}"),
        }
        let _ = reply.send(result);
    });
}

pub(crate) fn spawn_exists(
    device: DeviceId,
    tx: Arc<dyn ReadTransaction>,
    store: Store,
    path: NodePath,
    reply: ReplyTx<bool>,
) {
    tokio::spawn(async move {
        let result = tx.exists(store, &path).await;
        if let Err(e) = &result {
            debug!("{device}: exists {store} {path} failed: {e}");
        }
        let _ = reply.send(result);
    });
}

/// Client reference to the master's read-only transaction. Each read is a
/// separate round trip to the master coordinator.
#[derive(Clone)]
pub struct ReadTransactionRef {
    master: MountPointHandle,
}

impl ReadTransactionRef {
    pub(crate) fn new(master: MountPointHandle) -> Self {
        Self { master }
    }
}

#[async_trait]
impl ReadTransaction for ReadTransactionRef {
    async fn read(
        &self,
        store: Store,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>> {
        self.master
            .read(store, path.clone(), fields.to_vec())
            .await
            .map(Reply::into_option)
            .map_err(|e| read_failed(store, path, e))
    }

    async fn exists(&self, store: Store, path: &NodePath) -> MountResult<bool> {
        self.master
            .exists(store, path.clone())
            .await
            .map_err(|e| read_failed(store, path, e))
    }
}
