// tests/registry_test.rs

//! Registry persistence across restarts: the `data_group.info` round trip,
//! the demotion of previously live statuses, and leader survival.

use slicestore::config::{Config, GroupEntry, ServerEntry};
use slicestore::core::registry::{ClusterRegistry, ServerStatus};

fn two_node_config() -> Config {
    Config {
        server_id: 1,
        servers: vec![
            ServerEntry {
                id: 1,
                host: "127.0.0.1".into(),
                service_port: 9012,
                replica_port: 9014,
            },
            ServerEntry {
                id: 2,
                host: "127.0.0.1".into(),
                service_port: 9022,
                replica_port: 9024,
            },
        ],
        groups: vec![GroupEntry {
            group_id: 1,
            servers: vec![1, 2],
            preseted_master: Some(1),
        }],
        ..Config::default()
    }
}

#[test]
fn restart_demotes_live_statuses_to_offline() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_node_config();

    let registry = ClusterRegistry::from_config(&config);
    registry.set_master(1, 1).unwrap();
    registry.set_status(1, 1, ServerStatus::Active);
    registry.set_status(1, 2, ServerStatus::Syncing);
    registry.set_data_version(1, 2, 40);
    registry.set_my_data_version(1, 42);
    registry.set_leader(true);
    registry.persist(dir.path()).unwrap();

    let reloaded = ClusterRegistry::from_config(&config);
    let last_shutdown = reloaded.load(dir.path()).unwrap();
    assert!(last_shutdown.is_some(), "mtime read back as shutdown time");

    // Anything that was serving demotes until it reconnects.
    assert_eq!(reloaded.status_of(1, 1), Some(ServerStatus::Offline));
    assert_eq!(reloaded.status_of(1, 2), Some(ServerStatus::Offline));
    assert!(reloaded.is_leader());
    assert_eq!(reloaded.my_data_version(1), 42);
    let group = reloaded.group(1).unwrap();
    assert_eq!(group.member(2).unwrap().data_version, 40);
}

#[test]
fn change_version_survives_the_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_node_config();

    let registry = ClusterRegistry::from_config(&config);
    let before = registry.change_version();
    registry.set_status(1, 2, ServerStatus::Online);
    assert!(registry.change_version() > before);
    registry.persist(dir.path()).unwrap();

    let reloaded = ClusterRegistry::from_config(&config);
    reloaded.load(dir.path()).unwrap();
    assert_eq!(reloaded.change_version(), registry.change_version());
}

#[test]
fn offline_statuses_load_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_node_config();

    let registry = ClusterRegistry::from_config(&config);
    registry.set_status(1, 2, ServerStatus::Rebuilding);
    registry.persist(dir.path()).unwrap();

    let reloaded = ClusterRegistry::from_config(&config);
    reloaded.load(dir.path()).unwrap();
    assert_eq!(reloaded.status_of(1, 2), Some(ServerStatus::Rebuilding));
}

#[test]
fn corrupt_info_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("data_group.info"),
        "is_leader=0\nversion=notanumber\n",
    )
    .unwrap();

    let registry = ClusterRegistry::from_config(&two_node_config());
    assert!(registry.load(dir.path()).is_err());
}
