//! Master-side RPC and action invocation.

use crate::error::{MountError, MountResult};
use crate::protocol::{Reply, ReplyTx, RpcOutput};
use crate::services::{ActionService, RpcService};
use netmount_types::{DataNode, DataTreeId, DeviceId, QName, SchemaPath};
use std::sync::Arc;
use tracing::debug;

/// Runs RPCs and actions against the device and answers the caller. Holds
/// no state between calls; each invocation runs in its own task.
#[derive(Clone)]
pub struct RpcForwarder {
    device: DeviceId,
    rpcs: Option<Arc<dyn RpcService>>,
    actions: Option<Arc<dyn ActionService>>,
}

impl RpcForwarder {
    pub fn new(
        device: DeviceId,
        rpcs: Option<Arc<dyn RpcService>>,
        actions: Option<Arc<dyn ActionService>>,
    ) -> Self {
        Self {
            device,
            rpcs,
            actions,
        }
    }

    pub fn invoke_rpc(
        &self,
        name: QName,
        input: Option<DataNode>,
        reply: ReplyTx<Reply<RpcOutput>>,
    ) {
        let Some(rpcs) = self.rpcs.clone() else {
            let _ = reply.send(Err(MountError::Unsupported(format!(
                "{}: no rpc service for {name}",
                self.device
            ))));
            return;
        };
        let device = self.device.clone();

        tokio::spawn(async move {
            debug!("{device}: invoking rpc {name}");
            let result = rpcs.invoke_rpc(&name, input).await.map(Reply::from);
            log_outcome(&device, "rpc", &name.to_string(), &result);
            let _ = reply.send(result);
        });
    }

    pub fn invoke_action(
        &self,
        path: SchemaPath,
        target: DataTreeId,
        input: Option<DataNode>,
        reply: ReplyTx<Reply<RpcOutput>>,
    ) {
        let Some(actions) = self.actions.clone() else {
            let _ = reply.send(Err(MountError::Unsupported(format!(
                "{}: no action service for {path}",
                self.device
            ))));
            return;
        };
        let device = self.device.clone();

        tokio::spawn(async move {
            debug!("{device}: invoking action {path} on {target}");
            let result = actions
                .invoke_action(&path, &target, input)
                .await
                .map(Reply::from);
            log_outcome(&device, "action", &path.to_string(), &result);
            let _ = reply.send(result);
        });
    }
}

fn log_outcome(
    device: &DeviceId,
    kind: &str,
    name: &str,
    result: &MountResult<Reply<RpcOutput>>,
) {
    match result {
        Ok(Reply::Empty) => debug!("{device}: {kind} {name} returned no result"),
        Ok(Reply::Value(output)) => debug!(
            "{device}: {kind} {name} returned, {} errors",
            output.errors.len()
        ),
        Err(e) => debug!("{device}: {kind} {name} failed: {e}"),
    }
}
