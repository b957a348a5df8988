// tests/replication_test.rs

//! Master→slave replication end-to-end over real sockets: catch-up from an
//! empty slave, live streaming, and byte-exact convergence.

mod common;

use bytes::Bytes;
use common::{cluster_configs, start_node, wait_for};
use slicestore::core::data_worker::{OpKind, OpSource, SliceOpContext};
use slicestore::core::registry::ServerStatus;
use slicestore::core::replication;
use slicestore::core::slice_index::{BlockKey, SliceKey, SliceRange};
use std::time::Duration;

const GROUP: u32 = 1;

fn write_ctx(oid: i64, offset: u32, payload: Vec<u8>) -> SliceOpContext {
    SliceOpContext {
        kind: OpKind::SliceWrite,
        source: OpSource::MasterService,
        group_id: GROUP,
        key: SliceKey {
            block: BlockKey { oid, offset: 0 },
            slice: SliceRange::new(offset, payload.len() as u32),
        },
        payload: Bytes::from(payload),
        data_version: 0,
    }
}

fn read_key(oid: i64, offset: u32, length: u32) -> SliceKey {
    SliceKey {
        block: BlockKey { oid, offset: 0 },
        slice: SliceRange::new(offset, length),
    }
}

#[tokio::test]
async fn slave_catches_up_and_follows_live_writes() {
    let (mut configs, mut listeners) = cluster_configs(2).await;

    let (master_service, master_replica) = listeners.remove(0);
    let master = start_node(configs.remove(0), master_service, master_replica).await;
    assert!(master.state.registry.am_master(GROUP));

    // A history the slave has never seen.
    for i in 0..50i64 {
        let payload = vec![(i % 251) as u8; 1024];
        master
            .state
            .workers
            .execute_master(write_ctx(i, 0, payload))
            .await
            .unwrap();
    }
    assert_eq!(master.state.registry.my_data_version(GROUP), 50);

    // Bring the slave up and let its follower connect.
    let (slave_service, slave_replica) = listeners.remove(0);
    let slave = start_node(configs.remove(0), slave_service, slave_replica).await;
    let follower = tokio::spawn(replication::worker::run(
        slave.state.clone(),
        GROUP,
        slave.state.shutdown_rx(),
    ));

    {
        let slave_state = slave.state.clone();
        wait_for("slave catch-up", Duration::from_secs(10), move || {
            slave_state.registry.my_data_version(GROUP) >= 50
                && slave_state.registry.status_of(GROUP, 2) == Some(ServerStatus::Active)
        })
        .await;
    }

    // The master's view of the slave converged too.
    {
        let master_state = master.state.clone();
        wait_for("master sees active slave", Duration::from_secs(10), move || {
            let slave_dv = master_state
                .registry
                .group(GROUP)
                .and_then(|g| g.member(2).map(|m| m.data_version))
                .unwrap_or(0);
            master_state.registry.status_of(GROUP, 2) == Some(ServerStatus::Active)
                && slave_dv >= 50
        })
        .await;
    }

    // Byte-exact convergence of the replicated content.
    for i in [0i64, 7, 23, 49] {
        let expected = vec![(i % 251) as u8; 1024];
        let data = slave
            .state
            .engine
            .read_slice(&read_key(i, 0, 1024))
            .await
            .unwrap();
        assert_eq!(&data[..], &expected[..], "object {i} diverged");
    }
    assert_eq!(slave.state.binlogs.durable_version(GROUP), 50);

    // A live write after catch-up reaches the slave as well.
    master
        .state
        .workers
        .execute_master(write_ctx(100, 64, b"live-write".to_vec()))
        .await
        .unwrap();

    {
        let slave_state = slave.state.clone();
        wait_for("live replication", Duration::from_secs(10), move || {
            slave_state.registry.my_data_version(GROUP) >= 51
        })
        .await;
    }
    let data = slave
        .state
        .engine
        .read_slice(&read_key(100, 64, 10))
        .await
        .unwrap();
    assert_eq!(&data[..], b"live-write");

    // Replayed deletes follow the same path.
    master
        .state
        .workers
        .execute_master(SliceOpContext {
            kind: OpKind::BlockDelete,
            source: OpSource::MasterService,
            group_id: GROUP,
            key: read_key(0, 0, 0),
            payload: Bytes::new(),
            data_version: 0,
        })
        .await
        .unwrap();

    {
        let slave_state = slave.state.clone();
        wait_for("delete replication", Duration::from_secs(10), move || {
            slave_state.registry.my_data_version(GROUP) >= 52
        })
        .await;
    }
    assert!(
        slave
            .state
            .engine
            .read_slice(&read_key(0, 0, 1024))
            .await
            .unwrap()
            .is_empty()
    );

    slave.state.begin_shutdown();
    master.state.begin_shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), follower).await;
}
