use netmount_cluster::mock::{MockDevice, MockMountPointService, MockSchemaProvider};
use netmount_cluster::{
    InMemorySchemaRepository, MountConfig, MountError, MountPointHandle, MountStatus,
    RefreshSettings, Role, SchemaRepository, WriteTransaction,
};
use netmount_types::{DeviceId, SourceId};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn device(name: &str) -> DeviceId {
    DeviceId::new(name, "192.0.2.10:830".parse().unwrap())
}

fn source(name: &str) -> SourceId {
    SourceId::new(name).with_revision("2024-01-01")
}

fn repository(sources: &[&str]) -> InMemorySchemaRepository {
    let repo = InMemorySchemaRepository::new();
    for name in sources {
        repo.add_source(source(name), format!("module {name} {{}}"));
    }
    repo
}

fn spawn(
    name: &str,
    repo: &InMemorySchemaRepository,
    sink: &MockMountPointService,
) -> MountPointHandle {
    MountPointHandle::spawn(
        device(name),
        MountConfig::default(),
        Arc::new(repo.clone()),
        Arc::new(sink.clone()),
    )
    .unwrap()
}

async fn wait_for<F: Fn(&MountStatus) -> bool>(handle: &MountPointHandle, check: F) -> MountStatus {
    for _ in 0..500 {
        let status = handle.status().await.unwrap();
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("coordinator never reached the expected state");
}

async fn wait_mounted(handle: &MountPointHandle) -> MountStatus {
    wait_for(handle, |s| s.mounted).await
}

// ── Roles ───────────────────────────────────────────────────────

#[tokio::test]
async fn new_coordinator_is_unassigned() {
    let sink = MockMountPointService::new();
    let coordinator = spawn("r1", &repository(&[]), &sink);

    let status = coordinator.status().await.unwrap();
    assert_eq!(status.role, Role::Unassigned);
    assert_eq!(status.generation, 0);
    assert!(!status.mounted);
    assert_eq!(status.device, device("r1"));
}

#[tokio::test]
async fn become_master_takes_master_role() {
    let sink = MockMountPointService::new();
    let master = spawn("r1", &repository(&["a"]), &sink);

    master
        .become_master(vec![source("a")], MockDevice::new().services())
        .await
        .unwrap();

    let status = master.status().await.unwrap();
    assert_eq!(status.role, Role::Master);
    assert_eq!(status.generation, 1);
    assert!(!status.mounted);
}

#[tokio::test]
async fn wrong_role_replies_mismatch_and_keeps_running() {
    let sink = MockMountPointService::new();
    let coordinator = spawn("r1", &repository(&[]), &sink);

    let err = coordinator.new_write_transaction().await.err().unwrap();
    match err {
        MountError::RoleMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, Role::Master);
            assert_eq!(actual, Role::Unassigned);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(coordinator.new_data_tree_service().await.is_err());
    assert!(coordinator.new_read_transaction().await.is_err());
    assert_eq!(coordinator.status().await.unwrap().role, Role::Unassigned);
}

#[tokio::test]
async fn ask_for_master_on_non_master_is_not_master() {
    let sink = MockMountPointService::new();
    let peer = spawn("r1", &repository(&[]), &sink);
    let slave = spawn("r1", &repository(&[]), &sink);

    let err = peer.ask_for_master_mountpoint(slave.clone()).await.unwrap_err();
    assert!(matches!(err, MountError::NotMaster { .. }));
    assert_eq!(slave.status().await.unwrap().role, Role::Unassigned);
}

// ── Mount scenario ──────────────────────────────────────────────

#[tokio::test]
async fn slave_mounts_model_built_from_master_sources() {
    let master_sink = MockMountPointService::new();
    let slave_sink = MockMountPointService::new();
    let slave_repo = repository(&[]);
    let master = spawn("r1", &repository(&["a", "b"]), &master_sink);
    let slave = spawn("r1", &slave_repo, &slave_sink);

    master
        .become_master(vec![source("a"), source("b")], MockDevice::new().services())
        .await
        .unwrap();
    master.ask_for_master_mountpoint(slave.clone()).await.unwrap();

    let status = wait_mounted(&slave).await;
    assert_eq!(status.role, Role::Slave);

    let models = slave_sink.active_models();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].source_ids(), vec![source("a"), source("b")]);
    assert_eq!(models[0].sources()[1].text, "module b {}");
    assert_eq!(slave_sink.active_devices(), vec![device("r1")]);
    assert_eq!(slave_repo.remote_registration_count(), 2);
    assert_eq!(master_sink.registration_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_resolution_is_never_applied() {
    let master_repo = repository(&["b"]);
    let slow = Arc::new(MockSchemaProvider::new("module a {}").with_delay(Duration::from_millis(300)));
    let _origin = master_repo.register_source(source("a"), slow.clone());

    let slave_sink = MockMountPointService::new();
    let master = spawn("r1", &master_repo, &MockMountPointService::new());
    let slave = spawn("r1", &repository(&[]), &slave_sink);
    master
        .become_master(vec![source("a"), source("b")], MockDevice::new().services())
        .await
        .unwrap();

    slave.become_slave(vec![source("a")], master.clone()).await.unwrap();
    slave
        .become_slave(vec![source("a"), source("b")], master.clone())
        .await
        .unwrap();

    let status = wait_mounted(&slave).await;
    assert_eq!(status.generation, 2);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(slow.calls(), 2);
    assert_eq!(slave_sink.registration_count(), 1);
    let models = slave_sink.active_models();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].source_ids(), vec![source("a"), source("b")]);
}

#[tokio::test]
async fn permanent_resolution_failure_leaves_device_unmounted() {
    let slave_sink = MockMountPointService::new();
    let slave_repo = repository(&[]);
    let master = spawn("r1", &repository(&["a"]), &MockMountPointService::new());
    let slave = spawn("r1", &slave_repo, &slave_sink);

    master
        .become_master(vec![source("a"), source("missing")], MockDevice::new().services())
        .await
        .unwrap();
    master.ask_for_master_mountpoint(slave.clone()).await.unwrap();

    for _ in 0..500 {
        if slave_repo.remote_registration_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(slave_repo.remote_registration_count(), 0);

    let status = slave.status().await.unwrap();
    assert_eq!(status.role, Role::Slave);
    assert!(!status.mounted);
    assert_eq!(slave_sink.registration_count(), 0);
}

#[tokio::test]
async fn rejected_registration_closes_source_registrations() {
    let slave_sink = MockMountPointService::new();
    slave_sink.fail_with(MountError::Device("mount point busy".into()));
    let slave_repo = repository(&[]);
    let master = spawn("r1", &repository(&["a"]), &MockMountPointService::new());
    let slave = spawn("r1", &slave_repo, &slave_sink);

    master
        .become_master(vec![source("a")], MockDevice::new().services())
        .await
        .unwrap();
    master.ask_for_master_mountpoint(slave.clone()).await.unwrap();

    for _ in 0..500 {
        if slave_repo.remote_registration_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(slave_repo.remote_registration_count(), 0);
    assert!(!slave.status().await.unwrap().mounted);
}

// ── Release ─────────────────────────────────────────────────────

#[tokio::test]
async fn unregister_releases_slave_mount() {
    let slave_sink = MockMountPointService::new();
    let slave_repo = repository(&[]);
    let master = spawn("r1", &repository(&["a"]), &MockMountPointService::new());
    let slave = spawn("r1", &slave_repo, &slave_sink);

    master
        .become_master(vec![source("a")], MockDevice::new().services())
        .await
        .unwrap();
    master.ask_for_master_mountpoint(slave.clone()).await.unwrap();
    let mounted = wait_mounted(&slave).await;

    slave.unregister().await.unwrap();
    let status = slave.status().await.unwrap();
    assert_eq!(status.role, Role::Unassigned);
    assert_eq!(status.generation, mounted.generation + 1);
    assert!(!status.mounted);
    assert!(slave_sink.active_models().is_empty());
    assert_eq!(slave_repo.remote_registration_count(), 0);
}

#[tokio::test]
async fn switching_to_master_releases_slave_state() {
    let slave_sink = MockMountPointService::new();
    let slave_repo = repository(&[]);
    let master = spawn("r1", &repository(&["a"]), &MockMountPointService::new());
    let slave = spawn("r1", &slave_repo, &slave_sink);

    master
        .become_master(vec![source("a")], MockDevice::new().services())
        .await
        .unwrap();
    master.ask_for_master_mountpoint(slave.clone()).await.unwrap();
    wait_mounted(&slave).await;

    slave
        .become_master(vec![source("a")], MockDevice::new().services())
        .await
        .unwrap();

    assert_eq!(slave.status().await.unwrap().role, Role::Master);
    assert!(slave_sink.active_models().is_empty());
    assert_eq!(slave_repo.remote_registration_count(), 0);
}

#[tokio::test]
async fn refresh_returns_master_to_unassigned() {
    let device_state = MockDevice::new();
    let master = spawn("r1", &repository(&["a"]), &MockMountPointService::new());
    master
        .become_master(vec![source("a")], device_state.services())
        .await
        .unwrap();
    let mut tx = master.new_write_transaction().await.unwrap();

    let settings = RefreshSettings {
        config: MountConfig {
            idle_timeout_ms: 5_000,
            ..MountConfig::default()
        },
        device: Some(device("r1-renamed")),
    };
    master.refresh(settings).await.unwrap();

    let status = master.status().await.unwrap();
    assert_eq!(status.role, Role::Unassigned);
    assert_eq!(status.generation, 2);
    assert_eq!(status.device, device("r1-renamed"));
    assert!(master.new_write_transaction().await.is_err());

    for _ in 0..100 {
        if device_state.cancel_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(device_state.cancel_count(), 1);
    assert!(tx.commit().await.is_err());
}

#[tokio::test]
async fn refresh_with_invalid_config_keeps_role() {
    let master = spawn("r1", &repository(&["a"]), &MockMountPointService::new());
    master
        .become_master(vec![source("a")], MockDevice::new().services())
        .await
        .unwrap();

    let settings = RefreshSettings {
        config: MountConfig {
            mailbox_capacity: 0,
            ..MountConfig::default()
        },
        device: None,
    };
    let err = master.refresh(settings).await.unwrap_err();
    assert!(matches!(err, MountError::Config(_)));
    assert_eq!(master.status().await.unwrap().role, Role::Master);
}

#[tokio::test]
async fn shutdown_unregisters_slave_and_stops() {
    let slave_sink = MockMountPointService::new();
    let slave_repo = repository(&[]);
    let master = spawn("r1", &repository(&["a"]), &MockMountPointService::new());
    let slave = spawn("r1", &slave_repo, &slave_sink);

    master
        .become_master(vec![source("a")], MockDevice::new().services())
        .await
        .unwrap();
    master.ask_for_master_mountpoint(slave.clone()).await.unwrap();
    wait_mounted(&slave).await;

    slave.shutdown().await;
    for _ in 0..500 {
        if slave.status().await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(matches!(slave.status().await, Err(MountError::ChannelClosed)));
    assert!(slave_sink.active_models().is_empty());
    assert_eq!(slave_repo.remote_registration_count(), 0);
}

// ── Schema serving ──────────────────────────────────────────────

#[tokio::test]
async fn master_serves_schema_sources() {
    let master = spawn("r1", &repository(&["a"]), &MockMountPointService::new());

    let err = master.fetch_schema_source(source("a")).await.unwrap_err();
    assert!(matches!(err, MountError::RoleMismatch { .. }));

    master
        .become_master(vec![source("a")], MockDevice::new().services())
        .await
        .unwrap();

    let served = master.fetch_schema_source(source("a")).await.unwrap();
    assert_eq!(served.id, source("a"));
    assert_eq!(served.text, "module a {}");

    let err = master.fetch_schema_source(source("zz")).await.unwrap_err();
    assert!(matches!(err, MountError::SourceNotFound(id) if id == source("zz")));
}
