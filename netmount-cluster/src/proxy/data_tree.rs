//! Data-tree edit sessions held open on the master.

use super::{Stop, drain, next_request, read_failed};
use crate::config::MountConfig;
use crate::error::{MountError, MountResult};
use crate::protocol::{DataTreeRequest, Reply, RpcOutput, await_reply};
use crate::services::DataTreeService;
use async_trait::async_trait;
use netmount_types::{DataNode, DeviceId, EditOperation, NodePath, Store, TransactionId};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

struct DataTreeProxy {
    id: TransactionId,
    device: DeviceId,
    service: Arc<dyn DataTreeService>,
    idle_timeout: Duration,
    requests: mpsc::Receiver<DataTreeRequest>,
    shutdown: watch::Receiver<bool>,
}

pub(crate) fn spawn_data_tree_proxy(
    device: DeviceId,
    service: Arc<dyn DataTreeService>,
    config: &MountConfig,
    shutdown: watch::Receiver<bool>,
) -> DataTreeRef {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let id = TransactionId::new();
    debug!("{device}: opened data-tree session {id}");

    let proxy = DataTreeProxy {
        id,
        device: device.clone(),
        service,
        idle_timeout: config.idle_timeout(),
        requests: rx,
        shutdown,
    };
    tokio::spawn(proxy.run());

    DataTreeRef {
        id,
        device,
        ask_timeout: config.ask_timeout(),
        requests: tx,
        finished: Arc::new(AtomicBool::new(false)),
    }
}

impl DataTreeProxy {
    async fn run(mut self) {
        loop {
            match next_request(&mut self.requests, &mut self.shutdown, self.idle_timeout).await {
                ControlFlow::Continue(request) => {
                    if self.handle_request(request).await.is_break() {
                        break;
                    }
                }
                ControlFlow::Break(stop) => {
                    if let Stop::Idle = stop {
                        warn!(
                            "{}: data-tree session {} received no message for {:?}, cancelling",
                            self.device, self.id, self.idle_timeout
                        );
                    }
                    if let Err(e) = self.service.cancel().await {
                        warn!("{}: cancel of data-tree session {} failed: {e}", self.device, self.id);
                    }
                    break;
                }
            }
        }
        for request in drain(&mut self.requests) {
            self.discard(request);
        }
        debug!("{}: data-tree session {} stopped", self.device, self.id);
    }

    /// Answers a request that arrived after the session ended.
    fn discard(&self, request: DataTreeRequest) {
        let closed = || MountError::TransactionClosed(self.id.to_string());
        match request {
            DataTreeRequest::Lock { reply }
            | DataTreeRequest::Unlock { reply }
            | DataTreeRequest::DiscardChanges { reply }
            | DataTreeRequest::Commit { reply }
            | DataTreeRequest::Cancel { reply } => {
                let _ = reply.send(Err(closed()));
            }
            DataTreeRequest::Get { reply, .. } | DataTreeRequest::GetConfig { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            DataTreeRequest::Merge { store, path, .. }
            | DataTreeRequest::Replace { store, path, .. }
            | DataTreeRequest::Create { store, path, .. }
            | DataTreeRequest::Delete { store, path }
            | DataTreeRequest::Remove { store, path } => warn!(
                "{}: edit of {store} {path} arrived after session {} ended, dropped",
                self.device, self.id
            ),
        }
    }

    fn log_edit(&self, operation: &str, store: Store, path: &NodePath, result: MountResult<()>) {
        if let Err(e) = result {
            warn!("{}: {operation} {store} {path} in session {} failed: {e}", self.device, self.id);
        }
    }

    async fn handle_request(&mut self, request: DataTreeRequest) -> ControlFlow<()> {
        match request {
            DataTreeRequest::Lock { reply } => {
                let _ = reply.send(self.service.lock().await.map(Reply::from));
            }
            DataTreeRequest::Unlock { reply } => {
                let _ = reply.send(self.service.unlock().await.map(Reply::from));
            }
            DataTreeRequest::DiscardChanges { reply } => {
                let _ = reply.send(self.service.discard_changes().await.map(Reply::from));
            }
            DataTreeRequest::Get {
                path,
                fields,
                reply,
            } => {
                let _ = reply.send(self.service.get(&path, &fields).await.map(Reply::from));
                return ControlFlow::Break(());
            }
            DataTreeRequest::GetConfig {
                path,
                fields,
                reply,
            } => {
                let _ = reply.send(self.service.get_config(&path, &fields).await.map(Reply::from));
                return ControlFlow::Break(());
            }
            DataTreeRequest::Merge {
                store,
                path,
                node,
                default_operation,
            } => {
                let result = self
                    .service
                    .merge(store, path.clone(), node, default_operation)
                    .await;
                self.log_edit("merge", store, &path, result);
            }
            DataTreeRequest::Replace {
                store,
                path,
                node,
                default_operation,
            } => {
                let result = self
                    .service
                    .replace(store, path.clone(), node, default_operation)
                    .await;
                self.log_edit("replace", store, &path, result);
            }
            DataTreeRequest::Create {
                store,
                path,
                node,
                default_operation,
            } => {
                let result = self
                    .service
                    .create(store, path.clone(), node, default_operation)
                    .await;
                self.log_edit("create", store, &path, result);
            }
            DataTreeRequest::Delete { store, path } => {
                let result = self.service.delete(store, path.clone()).await;
                self.log_edit("delete", store, &path, result);
            }
            DataTreeRequest::Remove { store, path } => {
                let result = self.service.remove(store, path.clone()).await;
                self.log_edit("remove", store, &path, result);
            }
            DataTreeRequest::Commit { reply } => {
                let _ = reply.send(self.service.commit().await.map(Reply::from));
                return ControlFlow::Break(());
            }
            DataTreeRequest::Cancel { reply } => {
                let _ = reply.send(self.service.cancel().await.map(Reply::from));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Client reference to one data-tree session on the master.
///
/// A session ends after `get`, `get_config`, `commit` or `cancel`; later
/// calls fail with [`MountError::TransactionClosed`].
#[derive(Clone)]
pub struct DataTreeRef {
    id: TransactionId,
    device: DeviceId,
    ask_timeout: Duration,
    requests: mpsc::Sender<DataTreeRequest>,
    finished: Arc<AtomicBool>,
}

impl DataTreeRef {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.finished.load(Ordering::SeqCst) || self.requests.is_closed()
    }

    fn closed(&self) -> MountError {
        MountError::TransactionClosed(self.id.to_string())
    }

    async fn tell(&self, request: DataTreeRequest) -> MountResult<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(self.closed());
        }
        self.requests.send(request).await.map_err(|_| self.closed())
    }

    async fn ask<T>(
        &self,
        operation: &'static str,
        request: DataTreeRequest,
        rx: oneshot::Receiver<MountResult<Reply<T>>>,
    ) -> MountResult<Option<T>> {
        self.tell(request).await?;
        self.wait(operation, rx).await
    }

    /// Like `ask`, for the requests after which the session ends. The
    /// reference is closed as soon as the request is queued, so no edit
    /// can slip in behind it.
    async fn ask_last<T>(
        &self,
        operation: &'static str,
        request: DataTreeRequest,
        rx: oneshot::Receiver<MountResult<Reply<T>>>,
    ) -> MountResult<Option<T>> {
        self.tell(request).await?;
        self.finished.store(true, Ordering::SeqCst);
        self.wait(operation, rx).await
    }

    async fn wait<T>(
        &self,
        operation: &'static str,
        rx: oneshot::Receiver<MountResult<Reply<T>>>,
    ) -> MountResult<Option<T>> {
        match await_reply(&self.device, operation, self.ask_timeout, rx).await {
            Ok(reply) => Ok(reply.into_option()),
            Err(MountError::ChannelClosed) => Err(self.closed()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DataTreeService for DataTreeRef {
    async fn lock(&self) -> MountResult<Option<RpcOutput>> {
        let (reply, rx) = oneshot::channel();
        self.ask("lock", DataTreeRequest::Lock { reply }, rx).await
    }

    async fn unlock(&self) -> MountResult<Option<RpcOutput>> {
        let (reply, rx) = oneshot::channel();
        self.ask("unlock", DataTreeRequest::Unlock { reply }, rx).await
    }

    async fn discard_changes(&self) -> MountResult<Option<RpcOutput>> {
        let (reply, rx) = oneshot::channel();
        self.ask("discard-changes", DataTreeRequest::DiscardChanges { reply }, rx)
            .await
    }

    async fn get(&self, path: &NodePath, fields: &[NodePath]) -> MountResult<Option<DataNode>> {
        let (reply, rx) = oneshot::channel();
        let request = DataTreeRequest::Get {
            path: path.clone(),
            fields: fields.to_vec(),
            reply,
        };
        self.ask_last("get", request, rx)
            .await
            .map_err(|e| read_failed(Store::Operational, path, e))
    }

    async fn get_config(
        &self,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>> {
        let (reply, rx) = oneshot::channel();
        let request = DataTreeRequest::GetConfig {
            path: path.clone(),
            fields: fields.to_vec(),
            reply,
        };
        self.ask_last("get-config", request, rx)
            .await
            .map_err(|e| read_failed(Store::Configuration, path, e))
    }

    async fn merge(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        self.tell(DataTreeRequest::Merge {
            store,
            path,
            node,
            default_operation,
        })
        .await
    }

    async fn replace(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        self.tell(DataTreeRequest::Replace {
            store,
            path,
            node,
            default_operation,
        })
        .await
    }

    async fn create(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        self.tell(DataTreeRequest::Create {
            store,
            path,
            node,
            default_operation,
        })
        .await
    }

    async fn delete(&self, store: Store, path: NodePath) -> MountResult<()> {
        self.tell(DataTreeRequest::Delete { store, path }).await
    }

    async fn remove(&self, store: Store, path: NodePath) -> MountResult<()> {
        self.tell(DataTreeRequest::Remove { store, path }).await
    }

    async fn commit(&self) -> MountResult<Option<RpcOutput>> {
        let (reply, rx) = oneshot::channel();
        self.ask_last("commit", DataTreeRequest::Commit { reply }, rx)
            .await
            .map_err(|e| match e {
                MountError::CommitFailed { .. } => e,
                other => MountError::CommitFailed {
                    device: self.device.to_string(),
                    source: Box::new(other),
                },
            })
    }

    async fn cancel(&self) -> MountResult<Option<RpcOutput>> {
        let (reply, rx) = oneshot::channel();
        self.ask_last("cancel", DataTreeRequest::Cancel { reply }, rx).await
    }
}
