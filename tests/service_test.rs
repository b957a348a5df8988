// tests/service_test.rs

//! Service front-end behavior over real sockets: liveness, joins, cluster
//! lookups, the read path, and protocol error handling.

mod common;

use bytes::{BufMut, Bytes, BytesMut};
use common::{TestClient, start_single_node};
use slicestore::core::errors::status;
use slicestore::core::protocol::commands::{self, ClientJoinReq, ServerAddrResp, cmd};
use slicestore::core::slice_index::{BlockKey, SliceKey, SliceRange};

#[tokio::test]
async fn active_test_answers() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;
    let resp = client.call(cmd::ACTIVE_TEST_REQ, Bytes::new()).await;
    assert_eq!(resp.header.status, status::OK);
    assert!(resp.header.is_response());
    assert_eq!(resp.header.base_cmd(), cmd::ACTIVE_TEST_REQ);
    assert!(resp.body.is_empty());
}

#[tokio::test]
async fn client_join_validates_the_topology() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;

    let good = ClientJoinReq {
        data_group_count: 1,
        file_block_size: node.config.file_block_size,
        flags: 0,
        channel_id: 0,
        key: 0,
    };
    let resp = client.call(cmd::CLIENT_JOIN_REQ, good.encode()).await;
    assert_eq!(resp.header.status, status::OK);

    let bad_block_size = ClientJoinReq {
        file_block_size: 1024,
        ..good
    };
    let resp = client
        .call(cmd::CLIENT_JOIN_REQ, bad_block_size.encode())
        .await;
    assert_eq!(resp.header.status, status::INVALID);
    assert!(!resp.body.is_empty(), "diagnostic message expected");

    let bad_group_count = ClientJoinReq {
        data_group_count: 9,
        ..good
    };
    let resp = client
        .call(cmd::CLIENT_JOIN_REQ, bad_group_count.encode())
        .await;
    assert_eq!(resp.header.status, status::INVALID);
}

#[tokio::test]
async fn cluster_lookups_report_the_master() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;

    let resp = client
        .call(cmd::GET_MASTER_REQ, commands::encode_group_id(1))
        .await;
    assert_eq!(resp.header.status, status::OK);
    let master = ServerAddrResp::parse(&resp.body).unwrap();
    assert_eq!(master.server_id, 1);
    assert_eq!(master.port, node.config.service_port);

    let resp = client
        .call(cmd::GET_READABLE_SERVER_REQ, commands::encode_group_id(1))
        .await;
    assert_eq!(resp.header.status, status::OK);
    assert_eq!(ServerAddrResp::parse(&resp.body).unwrap().server_id, 1);

    let resp = client
        .call(cmd::GET_MASTER_REQ, commands::encode_group_id(99))
        .await;
    assert_eq!(resp.header.status, status::NOT_FOUND);
}

#[tokio::test]
async fn cluster_stat_lists_every_member() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;

    let resp = client.call(cmd::CLUSTER_STAT_REQ, Bytes::new()).await;
    assert_eq!(resp.header.status, status::OK);
    let entries = commands::parse_cluster_stat_resp(&resp.body).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].group_id, 1);
    assert_eq!(entries[0].server_id, 1);
    assert!(entries[0].is_master);

    // Filtered by group id.
    let resp = client
        .call(cmd::CLUSTER_STAT_REQ, commands::encode_group_id(1))
        .await;
    assert_eq!(
        commands::parse_cluster_stat_resp(&resp.body).unwrap().len(),
        1
    );

    // A bad body length is a shape error.
    let mut bad = BytesMut::new();
    bad.put_u16(1);
    let resp = client.call(cmd::CLUSTER_STAT_REQ, bad.freeze()).await;
    assert_eq!(resp.header.status, status::INVALID);
}

#[tokio::test]
async fn service_stat_reports_connections() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;

    let resp = client.call(cmd::SERVICE_STAT_REQ, Bytes::new()).await;
    assert_eq!(resp.header.status, status::OK);
    let stat = commands::ServiceStatResp::parse(&resp.body).unwrap();
    assert_eq!(stat.server_id, 1);
    assert!(stat.conn_current >= 1);
    assert_eq!(stat.conn_max, node.config.max_clients as u32);
}

#[tokio::test]
async fn disk_space_stat_reports_capacity() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;

    let resp = client.call(cmd::DISK_SPACE_STAT_REQ, Bytes::new()).await;
    assert_eq!(resp.header.status, status::OK);
    assert_eq!(resp.body.len(), 24);
}

#[tokio::test]
async fn write_then_read_over_the_wire() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;

    let key = SliceKey {
        block: BlockKey { oid: 11, offset: 0 },
        slice: SliceRange::new(256, 13),
    };
    let resp = client
        .call(
            cmd::SLICE_WRITE_REQ,
            commands::encode_slice_request(&key, b"wire payload!"),
        )
        .await;
    assert_eq!(resp.header.status, status::OK);

    let resp = client
        .call(
            cmd::SLICE_READ_REQ,
            commands::encode_slice_request(&key, b""),
        )
        .await;
    assert_eq!(resp.header.status, status::OK);
    assert_eq!(&resp.body[..], b"wire payload!");
}

#[tokio::test]
async fn unknown_command_is_invalid() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;
    let resp = client.call(0x7777, Bytes::new()).await;
    assert_eq!(resp.header.status, status::INVALID);
    assert!(!resp.body.is_empty());
}

#[tokio::test]
async fn get_leader_requires_a_leader() {
    let node = start_single_node().await;
    let mut client = TestClient::connect(&node).await;

    let resp = client.call(cmd::GET_LEADER_REQ, Bytes::new()).await;
    assert_eq!(resp.header.status, status::NO_SERVER);

    node.state.registry.set_leader(true);
    let resp = client.call(cmd::GET_LEADER_REQ, Bytes::new()).await;
    assert_eq!(resp.header.status, status::OK);
    assert_eq!(ServerAddrResp::parse(&resp.body).unwrap().server_id, 1);
}
