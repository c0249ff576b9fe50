//! Master-side proxies that own device handles on behalf of remote callers,
//! and the client references callers use to reach them.
//!
//! - Read: a scoped task per read against the shared read-only transaction.
//! - Write / read-write: one actor per transaction, stopped by commit,
//!   cancel, idle timeout or coordinator shutdown.
//! - Data tree: one actor per edit session with the same idle policy.

mod data_tree;
mod read;
mod transaction;

pub use data_tree::DataTreeRef;
pub use read::ReadTransactionRef;
pub use transaction::TransactionRef;

pub(crate) use data_tree::spawn_data_tree_proxy;
pub(crate) use read::{spawn_exists, spawn_read};
pub(crate) use transaction::{TxHandle, spawn_transaction_proxy};

use crate::error::MountError;
use netmount_types::{NodePath, Store};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Wraps a failed read so callers see which store and path failed.
pub(crate) fn read_failed(store: Store, path: &NodePath, error: MountError) -> MountError {
    match error {
        MountError::ReadFailed { .. } => error,
        other => MountError::ReadFailed {
            store,
            path: path.clone(),
            source: Box::new(other),
        },
    }
}

/// Why a proxy's mailbox loop ended without a terminal request.
pub(crate) enum Stop {
    Idle,
    Shutdown,
    Abandoned,
}

/// Waits for the next request, giving up after `idle` of silence or when
/// the owning coordinator signals shutdown.
pub(crate) async fn next_request<T>(
    requests: &mut mpsc::Receiver<T>,
    shutdown: &mut watch::Receiver<bool>,
    idle: Duration,
) -> ControlFlow<Stop, T> {
    tokio::select! {
        biased;
        _ = shutdown.changed() => ControlFlow::Break(Stop::Shutdown),
        next = tokio::time::timeout(idle, requests.recv()) => match next {
            Ok(Some(request)) => ControlFlow::Continue(request),
            Ok(None) => ControlFlow::Break(Stop::Abandoned),
            Err(_) => ControlFlow::Break(Stop::Idle),
        },
    }
}

/// Closes a stopped proxy's inbox and returns whatever was still queued
/// behind the request that stopped it.
pub(crate) fn drain<T>(requests: &mut mpsc::Receiver<T>) -> Vec<T> {
    requests.close();
    let mut left = Vec::new();
    while let Ok(request) = requests.try_recv() {
        left.push(request);
    }
    left
}
