//! In-memory device and mount sink for tests and demos.

use crate::error::{MountError, MountResult};
use crate::protocol::RpcOutput;
use crate::schema::{SchemaModel, SchemaSource, SchemaSourceProvider};
use crate::services::{
    ActionService, DataBroker, DataTreeService, DeviceServices, MountPointService,
    ReadTransaction, ReadWriteTransaction, Registration, RpcService, WriteTransaction,
};
use async_trait::async_trait;
use netmount_types::{
    DataNode, DataTreeId, DeviceId, EditOperation, NodePath, QName, SchemaPath, SourceId, Store,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call the mock device observed.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOp {
    Read(Store, NodePath),
    Put(Store, NodePath),
    Merge(Store, NodePath),
    Delete(Store, NodePath),
    Commit,
    Cancel,
    Lock,
    Unlock,
    DiscardChanges,
    Get(NodePath),
    GetConfig(NodePath),
    Edit(EditOperation, Store, NodePath, Option<EditOperation>),
    TreeCommit,
    TreeCancel,
    Rpc(QName),
    Action(SchemaPath, DataTreeId),
}

#[derive(Debug, Clone)]
enum Staged {
    Put(Store, NodePath, DataNode),
    Merge(Store, NodePath, DataNode),
    Delete(Store, NodePath),
}

#[derive(Default)]
struct DeviceState {
    data: HashMap<(Store, NodePath), DataNode>,
    ops: Vec<DeviceOp>,
    cancels: usize,
    tree_staged: Vec<Staged>,
    commit_error: Option<MountError>,
    read_error: Option<MountError>,
    rpc_error: Option<MountError>,
    rpc_replies: HashMap<QName, RpcOutput>,
    action_reply: Option<RpcOutput>,
    latency: Option<Duration>,
}

impl DeviceState {
    fn apply(&mut self, staged: Vec<Staged>) {
        for edit in staged {
            match edit {
                Staged::Put(store, path, node) => {
                    self.data.insert((store, path), node);
                }
                Staged::Merge(store, path, node) => {
                    let key = (store, path);
                    match self.data.get_mut(&key) {
                        Some(existing) => merge_value(&mut existing.value, node.value),
                        None => {
                            self.data.insert(key, node);
                        }
                    }
                }
                Staged::Delete(store, path) => {
                    self.data.remove(&(store, path));
                }
            }
        }
    }

    fn read(&self, store: Store, path: &NodePath, fields: &[NodePath]) -> Option<DataNode> {
        let node = self.data.get(&(store, path.clone()))?;
        Some(restrict(node, fields))
    }
}

fn merge_value(existing: &mut serde_json::Value, incoming: serde_json::Value) {
    match (existing, incoming) {
        (serde_json::Value::Object(current), serde_json::Value::Object(update)) => {
            for (key, value) in update {
                match current.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        current.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Keeps only the top-level members named by the first segment of each
/// field path. An empty field list keeps everything.
fn restrict(node: &DataNode, fields: &[NodePath]) -> DataNode {
    let serde_json::Value::Object(members) = &node.value else {
        return node.clone();
    };
    if fields.is_empty() {
        return node.clone();
    }
    let kept = members
        .iter()
        .filter(|(key, _)| {
            fields
                .iter()
                .any(|f| f.segments().first().map(String::as_str) == Some(key.as_str()))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    DataNode::new(node.name.clone(), serde_json::Value::Object(kept))
}

/// A device kept entirely in memory.
///
/// Transactions stage edits and apply them on commit; every call is
/// recorded so tests can compare what reached the device.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four services backed by this device.
    pub fn services(&self) -> DeviceServices {
        DeviceServices::new(Arc::new(self.clone()))
            .with_data_tree(Arc::new(self.clone()))
            .with_rpcs(Arc::new(self.clone()))
            .with_actions(Arc::new(self.clone()))
    }

    /// Stores `node` as committed data.
    pub fn set_data(&self, store: Store, path: NodePath, node: DataNode) {
        locked(&self.state).data.insert((store, path), node);
    }

    /// Committed data at `path`.
    pub fn committed(&self, store: Store, path: &NodePath) -> Option<DataNode> {
        locked(&self.state).data.get(&(store, path.clone())).cloned()
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        locked(&self.state).ops.clone()
    }

    /// Number of transactions and data-tree sessions cancelled.
    pub fn cancel_count(&self) -> usize {
        locked(&self.state).cancels
    }

    pub fn fail_commits_with(&self, error: MountError) {
        locked(&self.state).commit_error = Some(error);
    }

    pub fn fail_reads_with(&self, error: MountError) {
        locked(&self.state).read_error = Some(error);
    }

    pub fn fail_rpcs_with(&self, error: MountError) {
        locked(&self.state).rpc_error = Some(error);
    }

    /// Answer for `name`. RPCs without an answer return no result.
    pub fn set_rpc_reply(&self, name: QName, output: RpcOutput) {
        locked(&self.state).rpc_replies.insert(name, output);
    }

    pub fn set_action_reply(&self, output: Option<RpcOutput>) {
        locked(&self.state).action_reply = output;
    }

    /// Delays reads, commits and RPCs by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        locked(&self.state).latency = Some(latency);
    }

    async fn wait_latency(&self) {
        let latency = locked(&self.state).latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn record(&self, op: DeviceOp) {
        locked(&self.state).ops.push(op);
    }

    fn transaction(&self) -> MockTransaction {
        MockTransaction {
            device: self.clone(),
            staged: Vec::new(),
            finished: false,
        }
    }

    fn read_data(
        &self,
        store: Store,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>> {
        let state = locked(&self.state);
        if let Some(error) = &state.read_error {
            return Err(error.clone());
        }
        Ok(state.read(store, path, fields))
    }

    fn stage_tree_edit(
        &self,
        operation: EditOperation,
        staged: Staged,
        default_operation: Option<EditOperation>,
    ) {
        let (store, path) = match &staged {
            Staged::Put(store, path, _)
            | Staged::Merge(store, path, _)
            | Staged::Delete(store, path) => (*store, path.clone()),
        };
        let mut state = locked(&self.state);
        state
            .ops
            .push(DeviceOp::Edit(operation, store, path, default_operation));
        state.tree_staged.push(staged);
    }
}

/// A transaction on [`MockDevice`].
pub struct MockTransaction {
    device: MockDevice,
    staged: Vec<Staged>,
    finished: bool,
}

#[async_trait]
impl ReadTransaction for MockTransaction {
    async fn read(
        &self,
        store: Store,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>> {
        self.device.record(DeviceOp::Read(store, path.clone()));
        self.device.wait_latency().await;
        self.device.read_data(store, path, fields)
    }

    async fn exists(&self, store: Store, path: &NodePath) -> MountResult<bool> {
        Ok(self.read(store, path, &[]).await?.is_some())
    }
}

#[async_trait]
impl WriteTransaction for MockTransaction {
    async fn put(&mut self, store: Store, path: NodePath, node: DataNode) -> MountResult<()> {
        self.device.record(DeviceOp::Put(store, path.clone()));
        self.staged.push(Staged::Put(store, path, node));
        Ok(())
    }

    async fn merge(&mut self, store: Store, path: NodePath, node: DataNode) -> MountResult<()> {
        self.device.record(DeviceOp::Merge(store, path.clone()));
        self.staged.push(Staged::Merge(store, path, node));
        Ok(())
    }

    async fn delete(&mut self, store: Store, path: NodePath) -> MountResult<()> {
        self.device.record(DeviceOp::Delete(store, path.clone()));
        self.staged.push(Staged::Delete(store, path));
        Ok(())
    }

    async fn cancel(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.staged.clear();
        let mut state = locked(&self.device.state);
        state.ops.push(DeviceOp::Cancel);
        state.cancels += 1;
        true
    }

    async fn commit(&mut self) -> MountResult<()> {
        if self.finished {
            return Err(MountError::Device("transaction already finished".into()));
        }
        self.finished = true;
        self.device.wait_latency().await;
        let mut state = locked(&self.device.state);
        state.ops.push(DeviceOp::Commit);
        if let Some(error) = &state.commit_error {
            return Err(error.clone());
        }
        state.apply(std::mem::take(&mut self.staged));
        Ok(())
    }
}

#[async_trait]
impl DataBroker for MockDevice {
    async fn new_read_only_transaction(&self) -> MountResult<Arc<dyn ReadTransaction>> {
        Ok(Arc::new(self.transaction()))
    }

    async fn new_write_only_transaction(&self) -> MountResult<Box<dyn WriteTransaction>> {
        Ok(Box::new(self.transaction()))
    }

    async fn new_read_write_transaction(&self) -> MountResult<Box<dyn ReadWriteTransaction>> {
        Ok(Box::new(self.transaction()))
    }
}

#[async_trait]
impl DataTreeService for MockDevice {
    async fn lock(&self) -> MountResult<Option<RpcOutput>> {
        self.record(DeviceOp::Lock);
        Ok(None)
    }

    async fn unlock(&self) -> MountResult<Option<RpcOutput>> {
        self.record(DeviceOp::Unlock);
        Ok(None)
    }

    async fn discard_changes(&self) -> MountResult<Option<RpcOutput>> {
        let mut state = locked(&self.state);
        state.ops.push(DeviceOp::DiscardChanges);
        state.tree_staged.clear();
        Ok(None)
    }

    async fn get(&self, path: &NodePath, fields: &[NodePath]) -> MountResult<Option<DataNode>> {
        self.record(DeviceOp::Get(path.clone()));
        self.wait_latency().await;
        self.read_data(Store::Operational, path, fields)
    }

    async fn get_config(
        &self,
        path: &NodePath,
        fields: &[NodePath],
    ) -> MountResult<Option<DataNode>> {
        self.record(DeviceOp::GetConfig(path.clone()));
        self.read_data(Store::Configuration, path, fields)
    }

    async fn merge(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        self.stage_tree_edit(
            EditOperation::Merge,
            Staged::Merge(store, path, node),
            default_operation,
        );
        Ok(())
    }

    async fn replace(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        self.stage_tree_edit(
            EditOperation::Replace,
            Staged::Put(store, path, node),
            default_operation,
        );
        Ok(())
    }

    async fn create(
        &self,
        store: Store,
        path: NodePath,
        node: DataNode,
        default_operation: Option<EditOperation>,
    ) -> MountResult<()> {
        if self.committed(store, &path).is_some() {
            return Err(MountError::Device(format!("data already exists at {path}")));
        }
        self.stage_tree_edit(
            EditOperation::Create,
            Staged::Put(store, path, node),
            default_operation,
        );
        Ok(())
    }

    async fn delete(&self, store: Store, path: NodePath) -> MountResult<()> {
        if self.committed(store, &path).is_none() {
            return Err(MountError::Device(format!("no data to delete at {path}")));
        }
        self.stage_tree_edit(EditOperation::Delete, Staged::Delete(store, path), None);
        Ok(())
    }

    async fn remove(&self, store: Store, path: NodePath) -> MountResult<()> {
        self.stage_tree_edit(EditOperation::Remove, Staged::Delete(store, path), None);
        Ok(())
    }

    async fn commit(&self) -> MountResult<Option<RpcOutput>> {
        self.wait_latency().await;
        let mut state = locked(&self.state);
        state.ops.push(DeviceOp::TreeCommit);
        if let Some(error) = &state.commit_error {
            return Err(error.clone());
        }
        let staged = std::mem::take(&mut state.tree_staged);
        state.apply(staged);
        Ok(None)
    }

    async fn cancel(&self) -> MountResult<Option<RpcOutput>> {
        let mut state = locked(&self.state);
        state.ops.push(DeviceOp::TreeCancel);
        state.tree_staged.clear();
        state.cancels += 1;
        Ok(None)
    }
}

#[async_trait]
impl RpcService for MockDevice {
    async fn invoke_rpc(
        &self,
        name: &QName,
        _input: Option<DataNode>,
    ) -> MountResult<Option<RpcOutput>> {
        self.wait_latency().await;
        let mut state = locked(&self.state);
        state.ops.push(DeviceOp::Rpc(name.clone()));
        if let Some(error) = &state.rpc_error {
            return Err(error.clone());
        }
        Ok(state.rpc_replies.get(name).cloned())
    }
}

#[async_trait]
impl ActionService for MockDevice {
    async fn invoke_action(
        &self,
        path: &SchemaPath,
        target: &DataTreeId,
        _input: Option<DataNode>,
    ) -> MountResult<Option<RpcOutput>> {
        let mut state = locked(&self.state);
        state
            .ops
            .push(DeviceOp::Action(path.clone(), target.clone()));
        Ok(state.action_reply.clone())
    }
}

struct MountRecord {
    device: DeviceId,
    model: SchemaModel,
    services: DeviceServices,
    active: bool,
}

/// Mount-point sink that records every registration.
#[derive(Clone, Default)]
pub struct MockMountPointService {
    records: Arc<Mutex<Vec<MountRecord>>>,
    failure: Arc<Mutex<Option<MountError>>>,
}

impl MockMountPointService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following registration fail.
    pub fn fail_with(&self, error: MountError) {
        *locked(&self.failure) = Some(error);
    }

    /// Total registrations ever made.
    pub fn registration_count(&self) -> usize {
        locked(&self.records).len()
    }

    /// Models of registrations not yet closed.
    pub fn active_models(&self) -> Vec<SchemaModel> {
        locked(&self.records)
            .iter()
            .filter(|r| r.active)
            .map(|r| r.model.clone())
            .collect()
    }

    /// Services of the most recent registration still open.
    pub fn active_services(&self) -> Option<DeviceServices> {
        locked(&self.records)
            .iter()
            .rev()
            .find(|r| r.active)
            .map(|r| r.services.clone())
    }

    /// Devices of registrations not yet closed.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        locked(&self.records)
            .iter()
            .filter(|r| r.active)
            .map(|r| r.device.clone())
            .collect()
    }
}

impl MountPointService for MockMountPointService {
    fn register(
        &self,
        device: &DeviceId,
        model: SchemaModel,
        services: DeviceServices,
    ) -> MountResult<Box<dyn Registration>> {
        if let Some(error) = locked(&self.failure).clone() {
            return Err(error);
        }
        let mut records = locked(&self.records);
        records.push(MountRecord {
            device: device.clone(),
            model,
            services,
            active: true,
        });
        Ok(Box::new(MockRegistration {
            records: Arc::clone(&self.records),
            index: records.len() - 1,
        }))
    }
}

struct MockRegistration {
    records: Arc<Mutex<Vec<MountRecord>>>,
    index: usize,
}

impl Registration for MockRegistration {
    fn close(self: Box<Self>) {
        if let Some(record) = locked(&self.records).get_mut(self.index) {
            record.active = false;
        }
    }
}

/// Source provider that fails a fixed number of times before answering.
pub struct MockSchemaProvider {
    text: String,
    failures_left: AtomicU32,
    error: MountError,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl MockSchemaProvider {
    /// A provider that always answers with `text`.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            failures_left: AtomicU32::new(0),
            error: MountError::ChannelClosed,
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    /// Fails the first `failures` calls with `error`.
    pub fn failing(mut self, failures: u32, error: MountError) -> Self {
        self.failures_left = AtomicU32::new(failures);
        self.error = error;
        self
    }

    /// Waits `delay` before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaSourceProvider for MockSchemaProvider {
    async fn get_source(&self, id: &SourceId) -> MountResult<SchemaSource> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(self.error.clone());
        }
        Ok(SchemaSource::new(id.clone(), self.text.clone()))
    }
}
