use netmount_cluster::mock::{DeviceOp, MockDevice, MockMountPointService};
use netmount_cluster::{
    DataBroker, InMemorySchemaRepository, MountConfig, MountError, MountPointHandle,
    ReadTransaction, WriteTransaction,
};
use netmount_types::{DataNode, DeviceId, NodePath, SourceId, Store};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn interfaces() -> NodePath {
    NodePath::from_segments(["interfaces"])
}

fn eth0() -> NodePath {
    interfaces().child("eth0")
}

fn node(value: serde_json::Value) -> DataNode {
    DataNode::new("eth0", value)
}

async fn master_with(device: &MockDevice, config: MountConfig) -> MountPointHandle {
    let master = MountPointHandle::spawn(
        DeviceId::new("core-1", "203.0.113.1:830".parse().unwrap()),
        config,
        Arc::new(InMemorySchemaRepository::new()),
        Arc::new(MockMountPointService::new()),
    )
    .unwrap();
    master
        .become_master(vec![SourceId::new("ietf-interfaces")], device.services())
        .await
        .unwrap();
    master
}

async fn master(device: &MockDevice) -> MountPointHandle {
    master_with(device, MountConfig::default()).await
}

fn short_idle() -> MountConfig {
    MountConfig {
        idle_timeout_ms: 1_000,
        ..MountConfig::default()
    }
}

// ── Write proxy ─────────────────────────────────────────────────

#[tokio::test]
async fn put_then_commit_matches_direct_commit() {
    let proxied = MockDevice::new();
    let master = master(&proxied).await;
    let mut tx = master.new_write_transaction().await.unwrap();
    tx.put(Store::Configuration, eth0(), node(json!({"mtu": 1500})))
        .await
        .unwrap();
    tx.merge(Store::Configuration, eth0(), node(json!({"enabled": true})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let direct = MockDevice::new();
    let mut dtx = direct.new_write_only_transaction().await.unwrap();
    dtx.put(Store::Configuration, eth0(), node(json!({"mtu": 1500})))
        .await
        .unwrap();
    dtx.merge(Store::Configuration, eth0(), node(json!({"enabled": true})))
        .await
        .unwrap();
    dtx.commit().await.unwrap();

    assert_eq!(
        proxied.committed(Store::Configuration, &eth0()),
        direct.committed(Store::Configuration, &eth0())
    );
    assert_eq!(proxied.ops(), direct.ops());
    assert_eq!(
        proxied.committed(Store::Configuration, &eth0()).unwrap().value,
        json!({"mtu": 1500, "enabled": true})
    );
}

#[tokio::test]
async fn edits_apply_in_send_order() {
    let device = MockDevice::new();
    let master = master(&device).await;
    let mut tx = master.new_write_transaction().await.unwrap();

    tx.put(Store::Configuration, eth0(), node(json!({"mtu": 1500})))
        .await
        .unwrap();
    tx.delete(Store::Configuration, eth0()).await.unwrap();
    tx.put(Store::Configuration, eth0(), node(json!({"mtu": 9000})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        device.ops(),
        vec![
            DeviceOp::Put(Store::Configuration, eth0()),
            DeviceOp::Delete(Store::Configuration, eth0()),
            DeviceOp::Put(Store::Configuration, eth0()),
            DeviceOp::Commit,
        ]
    );
    assert_eq!(
        device.committed(Store::Configuration, &eth0()).unwrap().value,
        json!({"mtu": 9000})
    );
}

#[tokio::test]
async fn cancel_answers_once() {
    let device = MockDevice::new();
    let master = master(&device).await;
    let mut tx = master.new_write_transaction().await.unwrap();
    tx.put(Store::Configuration, eth0(), node(json!({"mtu": 1500})))
        .await
        .unwrap();

    assert!(tx.cancel().await);
    assert!(!tx.cancel().await);
    assert!(tx.is_closed());
    assert_eq!(device.cancel_count(), 1);
    assert!(device.committed(Store::Configuration, &eth0()).is_none());
}

#[tokio::test]
async fn calls_after_commit_report_closed_transaction() {
    let device = MockDevice::new();
    let master = master(&device).await;
    let mut tx = master.new_write_transaction().await.unwrap();
    tx.commit().await.unwrap();

    let err = tx
        .put(Store::Configuration, eth0(), node(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, MountError::TransactionClosed(id) if id == tx.id().to_string()));
    assert!(!tx.cancel().await);
    assert_eq!(device.cancel_count(), 0);
}

#[tokio::test]
async fn second_commit_fails_as_commit_failure() {
    let device = MockDevice::new();
    let master = master(&device).await;
    let mut tx = master.new_write_transaction().await.unwrap();
    tx.commit().await.unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, MountError::CommitFailed { .. }));
    assert!(matches!(err.root_cause(), MountError::TransactionClosed(id) if *id == tx.id().to_string()));
}

#[tokio::test]
async fn edit_from_clone_behind_pending_commit_is_refused() {
    let device = MockDevice::new();
    let master = master(&device).await;
    let tx = master.new_write_transaction().await.unwrap();
    device.set_latency(Duration::from_millis(200));

    let mut committer = tx.clone();
    let commit = tokio::spawn(async move { committer.commit().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut writer = tx.clone();
    let err = writer
        .put(Store::Configuration, eth0(), node(json!({"mtu": 9000})))
        .await
        .unwrap_err();
    assert!(matches!(err, MountError::TransactionClosed(_)));

    commit.await.unwrap().unwrap();
    assert!(device.committed(Store::Configuration, &eth0()).is_none());
}

#[tokio::test]
async fn failed_commit_is_reported_to_caller() {
    let device = MockDevice::new();
    device.fail_commits_with(MountError::Device("validation failed".into()));
    let master = master(&device).await;
    let mut tx = master.new_write_transaction().await.unwrap();
    tx.put(Store::Configuration, eth0(), node(json!({"mtu": 1})))
        .await
        .unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, MountError::CommitFailed { .. }));
    assert!(matches!(err.root_cause(), MountError::Device(msg) if msg == "validation failed"));
    assert!(!err.is_transient());
}

// ── Read-write proxy ────────────────────────────────────────────

#[tokio::test]
async fn read_distinguishes_empty_from_value() {
    let device = MockDevice::new();
    device.set_data(Store::Operational, eth0(), node(json!({"oper-status": "up"})));
    let master = master(&device).await;
    let tx = master.new_read_write_transaction().await.unwrap();

    let found = tx.read(Store::Operational, &eth0(), &[]).await.unwrap();
    assert_eq!(found, Some(node(json!({"oper-status": "up"}))));

    let missing = tx
        .read(Store::Operational, &interfaces().child("eth9"), &[])
        .await
        .unwrap();
    assert_eq!(missing, None);

    assert!(tx.exists(Store::Operational, &eth0()).await.unwrap());
    assert!(!tx.exists(Store::Configuration, &eth0()).await.unwrap());
}

#[tokio::test]
async fn read_restricted_to_fields() {
    let device = MockDevice::new();
    device.set_data(
        Store::Operational,
        eth0(),
        node(json!({"mtu": 1500, "oper-status": "up", "speed": 1000})),
    );
    let master = master(&device).await;
    let tx = master.new_read_write_transaction().await.unwrap();

    let fields = vec![
        NodePath::from_segments(["mtu"]),
        NodePath::from_segments(["speed"]),
    ];
    let found = tx.read(Store::Operational, &eth0(), &fields).await.unwrap();
    assert_eq!(found.unwrap().value, json!({"mtu": 1500, "speed": 1000}));
}

#[tokio::test]
async fn failed_read_names_store_and_path() {
    let device = MockDevice::new();
    device.fail_reads_with(MountError::Device("session dropped".into()));
    let master = master(&device).await;
    let tx = master.new_read_write_transaction().await.unwrap();

    let err = tx.read(Store::Operational, &eth0(), &[]).await.unwrap_err();
    match &err {
        MountError::ReadFailed { store, path, .. } => {
            assert_eq!(*store, Store::Operational);
            assert_eq!(*path, eth0());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root_cause(), MountError::Device(_)));
}

#[tokio::test]
async fn read_on_write_only_transaction_is_unsupported() {
    let device = MockDevice::new();
    let master = master(&device).await;
    let tx = master.new_write_transaction().await.unwrap();

    let err = tx.read(Store::Operational, &eth0(), &[]).await.unwrap_err();
    assert!(matches!(err.root_cause(), MountError::Unsupported(_)));
}

#[tokio::test]
async fn read_write_transaction_reads_and_commits() {
    let device = MockDevice::new();
    device.set_data(Store::Configuration, eth0(), node(json!({"mtu": 1500})));
    let master = master(&device).await;
    let mut tx = master.new_read_write_transaction().await.unwrap();

    let current = tx.read(Store::Configuration, &eth0(), &[]).await.unwrap().unwrap();
    tx.merge(Store::Configuration, eth0(), node(json!({"description": "uplink"})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(current.value, json!({"mtu": 1500}));
    assert_eq!(
        device.committed(Store::Configuration, &eth0()).unwrap().value,
        json!({"mtu": 1500, "description": "uplink"})
    );
}

// ── Read-only transaction ───────────────────────────────────────

#[tokio::test]
async fn read_only_transaction_shares_master_handle() {
    let device = MockDevice::new();
    device.set_data(Store::Operational, eth0(), node(json!({"mtu": 1500})));
    let master = master(&device).await;

    let first = master.new_read_transaction().await.unwrap();
    let second = master.new_read_transaction().await.unwrap();
    let path_a = eth0();
    let path_b = eth0();
    let (a, b) = tokio::join!(
        first.read(Store::Operational, &path_a, &[]),
        second.exists(Store::Operational, &path_b),
    );

    assert_eq!(a.unwrap().unwrap().value, json!({"mtu": 1500}));
    assert!(b.unwrap());
}

// ── Idle timeout ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_proxy_cancels_exactly_once() {
    let device = MockDevice::new();
    let master = master_with(&device, short_idle()).await;
    let mut tx = master.new_read_write_transaction().await.unwrap();
    tx.put(Store::Configuration, eth0(), node(json!({"mtu": 1500})))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(device.cancel_count(), 1);
    assert!(tx.is_closed());

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, MountError::CommitFailed { .. }));
    assert!(matches!(err.root_cause(), MountError::TransactionClosed(_)));
    assert!(!tx.cancel().await);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(device.cancel_count(), 1);
    assert!(device.committed(Store::Configuration, &eth0()).is_none());
}

#[tokio::test(start_paused = true)]
async fn activity_resets_idle_timer() {
    let device = MockDevice::new();
    let master = master_with(&device, short_idle()).await;
    let mut tx = master.new_write_transaction().await.unwrap();

    for mtu in [1500, 1600, 1700] {
        tokio::time::sleep(Duration::from_millis(700)).await;
        tx.put(Store::Configuration, eth0(), node(json!({"mtu": mtu})))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(700)).await;
    tx.commit().await.unwrap();

    assert_eq!(device.cancel_count(), 0);
    assert_eq!(
        device.committed(Store::Configuration, &eth0()).unwrap().value,
        json!({"mtu": 1700})
    );
}

#[tokio::test]
async fn dropped_reference_cancels_transaction() {
    let device = MockDevice::new();
    let master = master(&device).await;
    let mut tx = master.new_write_transaction().await.unwrap();
    tx.put(Store::Configuration, eth0(), node(json!({"mtu": 1500})))
        .await
        .unwrap();
    drop(tx);

    for _ in 0..100 {
        if device.cancel_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(device.cancel_count(), 1);
}

#[tokio::test]
async fn master_shutdown_cancels_live_proxies() {
    let device = MockDevice::new();
    let master = master(&device).await;
    let _a = master.new_write_transaction().await.unwrap();
    let _b = master.new_read_write_transaction().await.unwrap();

    master.shutdown().await;
    for _ in 0..100 {
        if device.cancel_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(device.cancel_count(), 2);
}

// ── Master down ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn slow_master_surfaces_as_ask_timeout() {
    let device = MockDevice::new();
    device.set_latency(Duration::from_secs(30));
    let master = master_with(
        &device,
        MountConfig {
            ask_timeout_ms: 500,
            ..MountConfig::default()
        },
    )
    .await;

    let reader = master.new_read_write_transaction().await.unwrap();
    let err = reader.read(Store::Operational, &eth0(), &[]).await.unwrap_err();
    assert!(matches!(err, MountError::ReadFailed { .. }));
    assert!(matches!(
        err.root_cause(),
        MountError::AskTimeout { operation: "read", .. }
    ));
    assert!(err.is_transient());

    let mut writer = master.new_write_transaction().await.unwrap();
    let err = writer.commit().await.unwrap_err();
    assert!(matches!(err, MountError::CommitFailed { .. }));
    assert!(matches!(
        err.root_cause(),
        MountError::AskTimeout { operation: "commit", .. }
    ));
}
