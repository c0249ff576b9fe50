//! Mount-point coordinator: one actor per device per node.
//!
//! The coordinator owns the device's role on this node. As master it holds
//! the live device services and spawns proxies for remote callers; as slave
//! it resolves the schema through the master and registers a forwarding
//! façade. Work that may wait on the network runs in spawned tasks whose
//! outcome either goes straight to the caller's reply channel or comes back
//! as a [`CoordinatorMessage`] tagged with the generation it belongs to.

use crate::config::MountConfig;
use crate::error::{MountError, MountResult};
use crate::facade;
use crate::forwarder::RpcForwarder;
use crate::protocol::{
    CoordinatorMessage, MountStatus, RefreshSettings, Reply, ReplyTx, Role, RpcOutput,
    await_reply,
};
use crate::proxy::{
    DataTreeRef, ReadTransactionRef, TransactionRef, TxHandle, spawn_data_tree_proxy,
    spawn_exists, spawn_read, spawn_transaction_proxy,
};
use crate::resolver::{Decision, SchemaResolver};
use crate::schema::{SchemaModel, SchemaRepository, SchemaSource};
use crate::services::{DeviceServices, MountPointService, ReadTransaction, Registration};
use netmount_types::{DataNode, DataTreeId, DeviceId, NodePath, QName, SchemaPath, SourceId, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running coordinator. Cheap to clone; the coordinator stops
/// once every handle is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct MountPointHandle {
    device: DeviceId,
    tx: mpsc::Sender<CoordinatorMessage>,
    ask_timeout: Duration,
}

impl std::fmt::Debug for MountPointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountPointHandle")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl MountPointHandle {
    /// Starts a coordinator for `device` in the `Unassigned` role.
    pub fn spawn(
        device: DeviceId,
        config: MountConfig,
        repository: Arc<dyn SchemaRepository>,
        mount_service: Arc<dyn MountPointService>,
    ) -> MountResult<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let handle = Self {
            device: device.clone(),
            tx: tx.clone(),
            ask_timeout: config.ask_timeout(),
        };

        let coordinator = Coordinator {
            device,
            config,
            repository,
            mount_service,
            self_tx: tx.downgrade(),
            generation: 0,
            state: MountState::Unassigned,
            mailbox: rx,
        };
        info!("{}: starting mount-point coordinator", coordinator.device);
        tokio::spawn(coordinator.run());

        Ok(handle)
    }

    /// Device identity this handle was created for.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn tell(&self, message: CoordinatorMessage) -> MountResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| MountError::ChannelClosed)
    }

    async fn ask<T>(
        &self,
        operation: &'static str,
        message: impl FnOnce(ReplyTx<T>) -> CoordinatorMessage,
    ) -> MountResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tell(message(reply)).await?;
        await_reply(&self.device, operation, self.ask_timeout, rx).await
    }

    pub async fn become_master(
        &self,
        sources: Vec<SourceId>,
        services: DeviceServices,
    ) -> MountResult<()> {
        self.ask("become-master", |reply| CoordinatorMessage::BecomeMaster {
            sources,
            services,
            reply,
        })
        .await
    }

    /// Makes this coordinator a slave of `master`. Returns once the role is
    /// taken; schema resolution continues in the background.
    pub async fn become_slave(
        &self,
        sources: Vec<SourceId>,
        master: MountPointHandle,
    ) -> MountResult<()> {
        self.ask("become-slave", |reply| CoordinatorMessage::BecomeSlave {
            sources,
            master,
            reply,
        })
        .await
    }

    /// Asks this coordinator whether it is the master. If it is, it sends
    /// `slave` its schema sources and itself as the master, and the slave's
    /// answer is returned. Otherwise fails with [`MountError::NotMaster`].
    pub async fn ask_for_master_mountpoint(&self, slave: MountPointHandle) -> MountResult<()> {
        self.ask("ask-for-master-mountpoint", |reply| {
            CoordinatorMessage::AskForMasterMountpoint { slave, reply }
        })
        .await
    }

    pub async fn refresh(&self, settings: RefreshSettings) -> MountResult<()> {
        self.ask("refresh", |reply| CoordinatorMessage::Refresh { settings, reply })
            .await
    }

    pub async fn unregister(&self) -> MountResult<()> {
        self.tell(CoordinatorMessage::Unregister).await
    }

    pub async fn status(&self) -> MountResult<MountStatus> {
        self.ask("status", |reply| CoordinatorMessage::Status { reply })
            .await
    }

    pub async fn fetch_schema_source(&self, source: SourceId) -> MountResult<SchemaSource> {
        self.ask("fetch-schema-source", |reply| {
            CoordinatorMessage::FetchSchemaSource { source, reply }
        })
        .await
    }

    pub async fn new_read_transaction(&self) -> MountResult<ReadTransactionRef> {
        self.ask("new-read-transaction", |reply| {
            CoordinatorMessage::NewReadTransaction { reply }
        })
        .await
    }

    pub async fn new_write_transaction(&self) -> MountResult<TransactionRef> {
        self.ask("new-write-transaction", |reply| {
            CoordinatorMessage::NewWriteTransaction { reply }
        })
        .await
    }

    pub async fn new_read_write_transaction(&self) -> MountResult<TransactionRef> {
        self.ask("new-read-write-transaction", |reply| {
            CoordinatorMessage::NewReadWriteTransaction { reply }
        })
        .await
    }

    pub async fn new_data_tree_service(&self) -> MountResult<DataTreeRef> {
        self.ask("new-data-tree-service", |reply| {
            CoordinatorMessage::NewDataTreeService { reply }
        })
        .await
    }

    /// One-shot read against the master's shared read-only transaction.
    pub async fn read(
        &self,
        store: Store,
        path: NodePath,
        fields: Vec<NodePath>,
    ) -> MountResult<Reply<DataNode>> {
        self.ask("read", |reply| CoordinatorMessage::Read {
            store,
            path,
            fields,
            reply,
        })
        .await
    }

    pub async fn exists(&self, store: Store, path: NodePath) -> MountResult<bool> {
        self.ask("exists", |reply| CoordinatorMessage::Exists {
            store,
            path,
            reply,
        })
        .await
    }

    pub async fn invoke_rpc(
        &self,
        name: QName,
        input: Option<DataNode>,
    ) -> MountResult<Reply<RpcOutput>> {
        self.ask("invoke-rpc", |reply| CoordinatorMessage::InvokeRpc {
            name,
            input,
            reply,
        })
        .await
    }

    pub async fn invoke_action(
        &self,
        path: SchemaPath,
        target: DataTreeId,
        input: Option<DataNode>,
    ) -> MountResult<Reply<RpcOutput>> {
        self.ask("invoke-action", |reply| CoordinatorMessage::InvokeAction {
            path,
            target,
            input,
            reply,
        })
        .await
    }

    /// Stops the coordinator, releasing whatever its role holds.
    pub async fn shutdown(&self) {
        let _ = self.tell(CoordinatorMessage::Shutdown).await;
    }
}

struct MasterState {
    sources: Vec<SourceId>,
    services: DeviceServices,
    read_tx: Arc<dyn ReadTransaction>,
    forwarder: RpcForwarder,
    /// Dropping or signalling this stops every proxy spawned for the role.
    shutdown: watch::Sender<bool>,
}

struct SlaveState {
    master: MountPointHandle,
    resolver: Option<SchemaResolver>,
    mount: Option<Box<dyn Registration>>,
}

enum MountState {
    Unassigned,
    Master(MasterState),
    Slave(SlaveState),
}

impl MountState {
    fn role(&self) -> Role {
        match self {
            Self::Unassigned => Role::Unassigned,
            Self::Master(_) => Role::Master,
            Self::Slave(_) => Role::Slave,
        }
    }
}

struct Coordinator {
    device: DeviceId,
    config: MountConfig,
    repository: Arc<dyn SchemaRepository>,
    mount_service: Arc<dyn MountPointService>,
    self_tx: mpsc::WeakSender<CoordinatorMessage>,
    generation: u64,
    state: MountState,
    mailbox: mpsc::Receiver<CoordinatorMessage>,
}

impl Coordinator {
    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            if let CoordinatorMessage::Shutdown = message {
                break;
            }
            self.handle(message).await;
        }
        self.release();
        info!("{}: mount-point coordinator stopped", self.device);
    }

    fn self_handle(&self) -> Option<MountPointHandle> {
        self.self_tx.upgrade().map(|tx| MountPointHandle {
            device: self.device.clone(),
            tx,
            ask_timeout: self.config.ask_timeout(),
        })
    }

    fn mismatch(&self, operation: &'static str, expected: Role) -> MountError {
        MountError::RoleMismatch {
            device: self.device.to_string(),
            operation,
            expected,
            actual: self.state.role(),
        }
    }

    fn master(&self, operation: &'static str) -> MountResult<&MasterState> {
        match &self.state {
            MountState::Master(master) => Ok(master),
            _ => Err(self.mismatch(operation, Role::Master)),
        }
    }

    /// Drops everything the current role holds and returns to `Unassigned`.
    fn release(&mut self) {
        match std::mem::replace(&mut self.state, MountState::Unassigned) {
            MountState::Unassigned => {}
            MountState::Master(master) => {
                let _ = master.shutdown.send(true);
                debug!("{}: released master services", self.device);
            }
            MountState::Slave(mut slave) => {
                if let Some(mount) = slave.mount.take() {
                    mount.close();
                    info!("{}: unregistered slave mount point", self.device);
                }
                if let Some(resolver) = slave.resolver.take() {
                    resolver.close();
                }
                debug!("{}: released slave state", self.device);
            }
        }
    }

    async fn handle(&mut self, message: CoordinatorMessage) {
        debug!(
            "{}: handling {} as {}",
            self.device,
            message.name(),
            self.state.role()
        );
        match message {
            CoordinatorMessage::BecomeMaster {
                sources,
                services,
                reply,
            } => {
                let result = self.become_master(sources, services).await;
                let _ = reply.send(result);
            }
            CoordinatorMessage::BecomeSlave {
                sources,
                master,
                reply,
            } => {
                self.become_slave(sources, master);
                let _ = reply.send(Ok(()));
            }
            CoordinatorMessage::AskForMasterMountpoint { slave, reply } => {
                self.register_slave(slave, reply);
            }
            CoordinatorMessage::Refresh { settings, reply } => {
                let _ = reply.send(self.refresh(settings));
            }
            CoordinatorMessage::Unregister => {
                self.release();
                self.generation += 1;
                info!("{}: unregistered", self.device);
            }
            CoordinatorMessage::Status { reply } => {
                let mounted = matches!(
                    &self.state,
                    MountState::Slave(SlaveState { mount: Some(_), .. })
                );
                let _ = reply.send(Ok(MountStatus {
                    device: self.device.clone(),
                    role: self.state.role(),
                    generation: self.generation,
                    mounted,
                }));
            }
            CoordinatorMessage::FetchSchemaSource { source, reply } => {
                if let Err(e) = self.master("fetch-schema-source") {
                    let _ = reply.send(Err(e));
                    return;
                }
                let repository = Arc::clone(&self.repository);
                let device = self.device.clone();
                tokio::spawn(async move {
                    let result = repository.get_source(&source).await;
                    if let Err(e) = &result {
                        debug!("{device}: serving schema source {source} failed: {e}");
                    }
                    let _ = reply.send(result);
                });
            }
            CoordinatorMessage::NewReadTransaction { reply } => {
                let result = self
                    .master("new-read-transaction")
                    .map(|_| ())
                    .and_then(|()| {
                        self.self_handle()
                            .map(ReadTransactionRef::new)
                            .ok_or(MountError::ChannelClosed)
                    });
                let _ = reply.send(result);
            }
            CoordinatorMessage::NewWriteTransaction { reply } => {
                let _ = reply.send(self.new_transaction(false).await);
            }
            CoordinatorMessage::NewReadWriteTransaction { reply } => {
                let _ = reply.send(self.new_transaction(true).await);
            }
            CoordinatorMessage::NewDataTreeService { reply } => {
                let _ = reply.send(self.new_data_tree_service());
            }
            CoordinatorMessage::Read {
                store,
                path,
                fields,
                reply,
            } => match self.master("read") {
                Ok(master) => spawn_read(
                    self.device.clone(),
                    Arc::clone(&master.read_tx),
                    store,
                    path,
                    fields,
                    reply,
                ),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            CoordinatorMessage::Exists { store, path, reply } => match self.master("exists") {
                Ok(master) => spawn_exists(
                    self.device.clone(),
                    Arc::clone(&master.read_tx),
                    store,
                    path,
                    reply,
                ),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            CoordinatorMessage::InvokeRpc { name, input, reply } => {
                match self.master("invoke-rpc") {
                    Ok(master) => master.forwarder.invoke_rpc(name, input, reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            CoordinatorMessage::InvokeAction {
                path,
                target,
                input,
                reply,
            } => match self.master("invoke-action") {
                Ok(master) => master.forwarder.invoke_action(path, target, input, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            CoordinatorMessage::SchemaResolved { generation, model } => {
                self.on_schema_resolved(generation, model);
            }
            CoordinatorMessage::SchemaResolutionFailed {
                generation,
                attempt,
                error,
            } => {
                self.on_schema_resolution_failed(generation, attempt, error);
            }
            CoordinatorMessage::Shutdown => {}
        }
    }

    async fn become_master(
        &mut self,
        sources: Vec<SourceId>,
        services: DeviceServices,
    ) -> MountResult<()> {
        self.release();
        self.generation += 1;

        let read_tx = services.data_broker.new_read_only_transaction().await?;
        let (shutdown, _) = watch::channel(false);
        let forwarder = RpcForwarder::new(
            self.device.clone(),
            services.rpcs.clone(),
            services.actions.clone(),
        );
        info!(
            "{}: became master with {} schema sources",
            self.device,
            sources.len()
        );
        self.state = MountState::Master(MasterState {
            sources,
            services,
            read_tx,
            forwarder,
            shutdown,
        });
        Ok(())
    }

    fn become_slave(&mut self, sources: Vec<SourceId>, master: MountPointHandle) {
        self.release();
        self.generation += 1;

        info!(
            "{}: became slave of {}, resolving {} schema sources",
            self.device,
            master.device(),
            sources.len()
        );
        let resolver = SchemaResolver::new(
            self.device.clone(),
            Arc::clone(&self.repository),
            sources,
            master.clone(),
        );
        resolver.spawn_attempt(self.generation, 1, self.self_tx.clone());
        self.state = MountState::Slave(SlaveState {
            master,
            resolver: Some(resolver),
            mount: None,
        });
    }

    fn register_slave(&self, slave: MountPointHandle, reply: ReplyTx<()>) {
        let master = match self.master("ask-for-master-mountpoint") {
            Ok(master) => master,
            Err(_) => {
                debug!(
                    "{}: not master, rejecting mountpoint request from {}",
                    self.device,
                    slave.device()
                );
                let _ = reply.send(Err(MountError::NotMaster {
                    device: self.device.to_string(),
                }));
                return;
            }
        };
        let Some(me) = self.self_handle() else {
            let _ = reply.send(Err(MountError::ChannelClosed));
            return;
        };

        let sources = master.sources.clone();
        let device = self.device.clone();
        tokio::spawn(async move {
            debug!("{device}: registering mount point on {}", slave.device());
            let result = slave.become_slave(sources, me).await;
            if let Err(e) = &result {
                warn!("{device}: slave {} failed to register: {e}", slave.device());
            }
            let _ = reply.send(result);
        });
    }

    fn refresh(&mut self, settings: RefreshSettings) -> MountResult<()> {
        settings.config.validate()?;
        self.release();
        self.generation += 1;
        self.config = settings.config;
        if let Some(device) = settings.device {
            info!("{}: device identity refreshed to {device}", self.device);
            self.device = device;
        }
        info!("{}: refreshed, waiting for a new role", self.device);
        Ok(())
    }

    async fn new_transaction(&self, readable: bool) -> MountResult<TransactionRef> {
        let operation = if readable {
            "new-read-write-transaction"
        } else {
            "new-write-transaction"
        };
        let master = self.master(operation)?;
        let broker = Arc::clone(&master.services.data_broker);
        let shutdown = master.shutdown.subscribe();

        let handle = if readable {
            TxHandle::ReadWrite(broker.new_read_write_transaction().await?)
        } else {
            TxHandle::WriteOnly(broker.new_write_only_transaction().await?)
        };
        Ok(spawn_transaction_proxy(
            self.device.clone(),
            handle,
            &self.config,
            shutdown,
        ))
    }

    fn new_data_tree_service(&self) -> MountResult<DataTreeRef> {
        let master = self.master("new-data-tree-service")?;
        let service = master.services.data_tree.clone().ok_or_else(|| {
            MountError::Unsupported(format!("{}: no data-tree service", self.device))
        })?;
        Ok(spawn_data_tree_proxy(
            self.device.clone(),
            service,
            &self.config,
            master.shutdown.subscribe(),
        ))
    }

    fn on_schema_resolved(&mut self, generation: u64, model: SchemaModel) {
        if generation != self.generation {
            debug!(
                "{}: ignoring schema model of superseded generation {generation}",
                self.device
            );
            return;
        }
        let MountState::Slave(slave) = &mut self.state else {
            return;
        };
        if slave.mount.is_some() {
            return;
        }

        let services = facade::slave_services(slave.master.clone());
        match self.mount_service.register(&self.device, model.clone(), services) {
            Ok(registration) => {
                slave.mount = Some(registration);
                info!(
                    "{}: mounted slave mount point with modules {:?}",
                    self.device,
                    model.modules()
                );
            }
            Err(e) => {
                error!("{}: failed to register slave mount point: {e}", self.device);
                if let Some(resolver) = slave.resolver.take() {
                    resolver.close();
                }
            }
        }
    }

    fn on_schema_resolution_failed(&mut self, generation: u64, attempt: u32, error: MountError) {
        if generation != self.generation {
            debug!(
                "{}: ignoring resolution failure of superseded generation {generation}: {error}",
                self.device
            );
            return;
        }
        let MountState::Slave(slave) = &mut self.state else {
            return;
        };
        let Some(resolver) = slave.resolver.as_ref() else {
            return;
        };

        match resolver.on_failure(attempt, &error) {
            Decision::Retry { next } => {
                resolver.spawn_attempt(generation, next, self.self_tx.clone());
            }
            Decision::GiveUp => {
                if let Some(resolver) = slave.resolver.take() {
                    resolver.close();
                }
            }
        }
    }
}
