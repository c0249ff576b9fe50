//! Write and read-write transaction proxies.

use super::{Stop, drain, next_request, read_failed};
use crate::config::MountConfig;
use crate::error::{MountError, MountResult};
use crate::protocol::{Reply, TransactionRequest, await_reply};
use crate::services::{ReadTransaction, ReadWriteTransaction, WriteTransaction};
use async_trait::async_trait;
use netmount_types::{DataNode, DeviceId, NodePath, Store, TransactionId};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// The device handle a proxy owns exclusively for its whole life.
pub(crate) enum TxHandle {
    WriteOnly(Box<dyn WriteTransaction>),
    ReadWrite(Box<dyn ReadWriteTransaction>),
}

impl TxHandle {
    fn kind(&self) -> &'static str {
        match self {
            Self::WriteOnly(_) => "write",
            Self::ReadWrite(_) => "read-write",
        }
    }

    fn reader(&self) -> Option<&dyn ReadTransaction> {
        match self {
            Self::WriteOnly(_) => None,
            Self::ReadWrite(tx) => {
                let reader: &dyn ReadTransaction = &**tx;
                Some(reader)
            }
        }
    }

    fn writer(&mut self) -> &mut dyn WriteTransaction {
        match self {
            Self::WriteOnly(tx) => &mut **tx,
            Self::ReadWrite(tx) => &mut **tx,
        }
    }
}

struct TransactionProxy {
    id: TransactionId,
    device: DeviceId,
    handle: TxHandle,
    idle_timeout: Duration,
    requests: mpsc::Receiver<TransactionRequest>,
    shutdown: watch::Receiver<bool>,
}

/// Starts a proxy actor around `handle` and returns the reference callers
/// use to reach it.
pub(crate) fn spawn_transaction_proxy(
    device: DeviceId,
    handle: TxHandle,
    config: &MountConfig,
    shutdown: watch::Receiver<bool>,
) -> TransactionRef {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let id = TransactionId::new();
    debug!("{device}: opened {} transaction {id}", handle.kind());

    let proxy = TransactionProxy {
        id,
        device: device.clone(),
        handle,
        idle_timeout: config.idle_timeout(),
        requests: rx,
        shutdown,
    };
    tokio::spawn(proxy.run());

    TransactionRef {
        id,
        device,
        ask_timeout: config.ask_timeout(),
        requests: tx,
        finished: Arc::new(AtomicBool::new(false)),
    }
}

impl TransactionProxy {
    async fn run(mut self) {
        loop {
            match next_request(&mut self.requests, &mut self.shutdown, self.idle_timeout).await {
                ControlFlow::Continue(request) => {
                    if self.handle_request(request).await.is_break() {
                        break;
                    }
                }
                ControlFlow::Break(stop) => {
                    self.abandon(stop).await;
                    break;
                }
            }
        }
        for request in drain(&mut self.requests) {
            self.discard(request);
        }
        debug!("{}: transaction {} stopped", self.device, self.id);
    }

    /// Answers a request that arrived after the transaction ended.
    fn discard(&self, request: TransactionRequest) {
        let closed = || MountError::TransactionClosed(self.id.to_string());
        match request {
            TransactionRequest::Read { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            TransactionRequest::Exists { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            TransactionRequest::Commit { reply } => {
                let _ = reply.send(Err(closed()));
            }
            TransactionRequest::Cancel { reply } => {
                let _ = reply.send(false);
            }
            TransactionRequest::Put { store, path, .. }
            | TransactionRequest::Merge { store, path, .. }
            | TransactionRequest::Delete { store, path } => warn!(
                "{}: edit of {store} {path} arrived after transaction {} ended, dropped",
                self.device, self.id
            ),
        }
    }

    async fn abandon(&mut self, stop: Stop) {
        match stop {
            Stop::Idle => warn!(
                "{}: transaction {} received no message for {:?}, cancelling",
                self.device, self.id, self.idle_timeout
            ),
            Stop::Shutdown => debug!(
                "{}: coordinator released transaction {}, cancelling",
                self.device, self.id
            ),
            Stop::Abandoned => debug!(
                "{}: every reference to transaction {} was dropped, cancelling",
                self.device, self.id
            ),
        }
        self.handle.writer().cancel().await;
    }

    async fn handle_request(&mut self, request: TransactionRequest) -> ControlFlow<()> {
        match request {
            TransactionRequest::Read {
                store,
                path,
                fields,
                reply,
            } => {
                let result = match self.handle.reader() {
                    Some(reader) => reader.read(store, &path, &fields).await.map(Reply::from),
                    None => Err(MountError::Unsupported(format!(
                        "read on write-only transaction {}",
                        self.id
                    ))),
                };
                if let Err(e) = &result {
                    debug!("{}: read {store} {path} in {} failed: {e}", self.device, self.id);
                }
                let _ = reply.send(result);
            }
            TransactionRequest::Exists { store, path, reply } => {
                let result = match self.handle.reader() {
                    Some(reader) => reader.exists(store, &path).await,
                    None => Err(MountError::Unsupported(format!(
                        "exists on write-only transaction {}",
                        self.id
                    ))),
                };
                let _ = reply.send(result);
            }
            TransactionRequest::Put { store, path, node } => {
                if let Err(e) = self.handle.writer().put(store, path.clone(), node).await {
                    warn!("{}: put {store} {path} in {} failed: {e}", self.device, self.id);
                }
            }
            TransactionRequest::Merge { store, path, node } => {
                if let Err(e) = self.handle.writer().merge(store, path.clone(), node).await {
                    warn!("{}: merge {store} {path} in {} failed: {e}", self.device, self.id);
                }
            }
            TransactionRequest::Delete { store, path } => {
                if let Err(e) = self.handle.writer().delete(store, path.clone()).await {
                    warn!("{}: delete {store} {path} in {} failed: {e}", self.device, self.id);
                }
            }
            TransactionRequest::Cancel { reply } => {
                let cancelled = self.handle.writer().cancel().await;
                debug!("{}: transaction {} cancelled: {cancelled}", self.device, self.id);
                let _ = reply.send(cancelled);
                return ControlFlow::Break(());
            }
            TransactionRequest::Commit { reply } => {
                let result = self.handle.writer().commit().await;
                match &result {
                    Ok(()) => debug!("{}: transaction {} committed", self.device, self.id),
                    Err(e) => debug!("{}: transaction {} commit failed: {e}", self.device, self.id),
                }
                let _ = reply.send(result);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Client reference to a write or read-write transaction proxy.
///
/// Edits are sent without waiting for the device; `commit` and `cancel`
/// wait for the outcome. Once the proxy has stopped every call fails with
/// [`MountError::TransactionClosed`], and `cancel` returns `false`.
#[derive(Clone)]
pub struct TransactionRef {
    id: TransactionId,
    device: DeviceId,
    ask_timeout: Duration,
    requests: mpsc::Sender<TransactionRequest>,
    finished: Arc<AtomicBool>,
}

impl TransactionRef {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Whether the proxy behind this reference has stopped.
    pub fn is_closed(&self) -> bool {
        self.finished.load(Ordering::SeqCst) || self.requests.is_closed()
    }

    fn closed(&self) -> MountError {
        MountError::TransactionClosed(self.id.to_string())
    }

    async fn tell(&self, request: TransactionRequest) -> MountResult<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(self.closed());
        }
        self.requests.send(request).await.map_err(|_| self.closed())
    }

    /// Sends a request and waits for its answer. A proxy that stopped
    /// before answering reports the transaction as closed.
    async fn ask<T>(
        &self,
        operation: &'static str,
        request: TransactionRequest,
        rx: oneshot::Receiver<MountResult<T>>,
    ) -> MountResult<T> {
        self.tell(request).await?;
        match await_reply(&self.device, operation, self.ask_timeout, rx).await {
            Err(MountError::ChannelClosed) => Err(self.closed()),
            other => other,
        }
    }
}

#[async_trait]
impl ReadTransaction for TransactionRef {
    async fn read(
        &self,
        store: Store,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>> {
        let (reply, rx) = oneshot::channel();
        let request = TransactionRequest::Read {
            store,
            path: path.clone(),
            fields: fields.to_vec(),
            reply,
        };
        self.ask("read", request, rx)
            .await
            .map(Reply::into_option)
            .map_err(|e| read_failed(store, path, e))
    }

    async fn exists(&self, store: Store, path: &NodePath) -> MountResult<bool> {
        let (reply, rx) = oneshot::channel();
        let request = TransactionRequest::Exists {
            store,
            path: path.clone(),
            reply,
        };
        self.ask("exists", request, rx)
            .await
            .map_err(|e| read_failed(store, path, e))
    }
}

#[async_trait]
impl WriteTransaction for TransactionRef {
    async fn put(&mut self, store: Store, path: NodePath, node: DataNode) -> MountResult<()> {
        debug!("{}: put {store} {path} via transaction {}", self.device, self.id);
        self.tell(TransactionRequest::Put { store, path, node }).await
    }

    async fn merge(&mut self, store: Store, path: NodePath, node: DataNode) -> MountResult<()> {
        debug!("{}: merge {store} {path} via transaction {}", self.device, self.id);
        self.tell(TransactionRequest::Merge { store, path, node }).await
    }

    async fn delete(&mut self, store: Store, path: NodePath) -> MountResult<()> {
        debug!("{}: delete {store} {path} via transaction {}", self.device, self.id);
        self.tell(TransactionRequest::Delete { store, path }).await
    }

    async fn cancel(&mut self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tell(TransactionRequest::Cancel { reply }).await.is_err() {
            return false;
        }
        self.finished.store(true, Ordering::SeqCst);
        matches!(tokio::time::timeout(self.ask_timeout, rx).await, Ok(Ok(true)))
    }

    /// Every failure, including a transaction that already ended, comes
    /// back as [`MountError::CommitFailed`].
    async fn commit(&mut self) -> MountResult<()> {
        let (reply, rx) = oneshot::channel();
        let result = match self.tell(TransactionRequest::Commit { reply }).await {
            Ok(()) => {
                self.finished.store(true, Ordering::SeqCst);
                match await_reply(&self.device, "commit", self.ask_timeout, rx).await {
                    Err(MountError::ChannelClosed) => Err(self.closed()),
                    other => other,
                }
            }
            Err(e) => Err(e),
        };
        result.map_err(|e| match e {
            MountError::CommitFailed { .. } => e,
            other => MountError::CommitFailed {
                device: self.device.to_string(),
                source: Box::new(other),
            },
        })
    }
}
