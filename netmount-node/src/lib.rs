//! In-process demo of a clustered mount.
//!
//! Boots a master and a slave coordinator for the same device, lets the
//! slave resolve its schema through the master, then drives a write, a
//! read and an RPC through the slave's façade.

use anyhow::{Context, Result, bail};
use netmount_cluster::mock::{MockDevice, MockMountPointService};
use netmount_cluster::{
    InMemorySchemaRepository, MountConfig, MountPointHandle, MountStatus, ReadTransaction,
    RpcOutput, RpcService, WriteTransaction,
};
use netmount_types::{DataNode, DeviceId, NodePath, QName, SourceId, Store};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What to mount.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub device: DeviceId,
    pub sources: Vec<SourceId>,
    pub config: MountConfig,
}

/// Outcome of a demo run, printed as JSON by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoReport {
    pub device: String,
    pub modules: Vec<String>,
    pub written: serde_json::Value,
    pub read_back: Option<serde_json::Value>,
    pub rpc_output: Option<serde_json::Value>,
    pub slave_generation: u64,
}

/// The RPC the demo device answers.
pub fn ping_rpc() -> QName {
    QName::new("netmount-demo", "ping")
}

pub async fn run_demo(options: DemoOptions) -> Result<DemoReport> {
    options.config.validate().context("invalid mount configuration")?;

    let master_repo = InMemorySchemaRepository::new();
    for source in &options.sources {
        master_repo.add_source(source.clone(), format!("module {} {{}}", source.name()));
    }

    let device = MockDevice::new();
    device.set_rpc_reply(
        ping_rpc(),
        RpcOutput::with_output(DataNode::new("output", serde_json::json!({"reply": "pong"}))),
    );

    let slave_sink = MockMountPointService::new();
    let master = MountPointHandle::spawn(
        options.device.clone(),
        options.config.clone(),
        Arc::new(master_repo),
        Arc::new(MockMountPointService::new()),
    )?;
    let slave = MountPointHandle::spawn(
        options.device.clone(),
        options.config.clone(),
        Arc::new(InMemorySchemaRepository::new()),
        Arc::new(slave_sink.clone()),
    )?;

    master
        .become_master(options.sources.clone(), device.services())
        .await
        .context("master failed to initialise")?;
    master
        .ask_for_master_mountpoint(slave.clone())
        .await
        .context("slave failed to register with master")?;

    let status = wait_mounted(&slave, options.config.ask_timeout() * 3).await?;
    info!("{}: slave mounted at generation {}", options.device, status.generation);

    let services = slave_sink
        .active_services()
        .context("slave mounted without services")?;
    let modules = slave_sink
        .active_models()
        .first()
        .map(|model| model.modules().into_iter().map(String::from).collect())
        .unwrap_or_default();

    let path = NodePath::from_segments(["system"]);
    let written = serde_json::json!({"hostname": options.device.name()});
    let mut tx = services.data_broker.new_write_only_transaction().await?;
    tx.put(
        Store::Configuration,
        path.clone(),
        DataNode::new("system", written.clone()),
    )
    .await?;
    tx.commit().await.context("commit through slave failed")?;
    debug!("{}: committed {path} through slave", options.device);

    let reader = services.data_broker.new_read_only_transaction().await?;
    let read_back = reader
        .read(Store::Configuration, &path, &[])
        .await?
        .map(|node| node.value);

    let rpc_output = match &services.rpcs {
        Some(rpcs) => rpcs
            .invoke_rpc(&ping_rpc(), None)
            .await?
            .and_then(|output| output.output)
            .map(|node| node.value),
        None => None,
    };

    slave.shutdown().await;
    master.shutdown().await;

    Ok(DemoReport {
        device: options.device.to_string(),
        modules,
        written,
        read_back,
        rpc_output,
        slave_generation: status.generation,
    })
}

async fn wait_mounted(slave: &MountPointHandle, limit: Duration) -> Result<MountStatus> {
    let started = tokio::time::Instant::now();
    loop {
        let status = slave.status().await?;
        if status.mounted {
            return Ok(status);
        }
        if started.elapsed() > limit {
            bail!("{}: slave not mounted after {limit:?}", status.device);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
