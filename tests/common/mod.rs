// tests/common/mod.rs

//! Shared test harness: builds single- or multi-node topologies on
//! ephemeral ports, runs the real accept loops, and speaks the wire
//! protocol through a tiny frame client.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slicestore::config::{Config, GroupEntry, ServerEntry};
use slicestore::connection::{ConnectionHandler, ReplicaConnectionHandler};
use slicestore::core::protocol::{Frame, FrameCodec};
use slicestore::core::state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// One running node: its shared state, listeners already accepting, and
/// the tempdir keeping its data alive for the test's duration.
pub struct TestNode {
    pub state: Arc<ServerState>,
    pub config: Config,
    #[allow(dead_code)] // deleted on drop
    data_dir: tempfile::TempDir,
}

/// Builds the configs of an `n`-node cluster sharing one data group, with
/// server 1 as the preset master, each node bound to ephemeral ports.
pub async fn cluster_configs(n: u32) -> (Vec<Config>, Vec<(TcpListener, TcpListener)>) {
    let mut servers = Vec::new();
    let mut listeners = Vec::new();
    for id in 1..=n {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let replica = TcpListener::bind("127.0.0.1:0").await.unwrap();
        servers.push(ServerEntry {
            id,
            host: "127.0.0.1".into(),
            service_port: service.local_addr().unwrap().port(),
            replica_port: replica.local_addr().unwrap().port(),
        });
        listeners.push((service, replica));
    }

    let group = GroupEntry {
        group_id: 1,
        servers: (1..=n).collect(),
        preseted_master: Some(1),
    };

    let configs = (1..=n)
        .map(|id| {
            let me = servers.iter().find(|s| s.id == id).unwrap();
            Config {
                server_id: id,
                service_port: me.service_port,
                replica_port: me.replica_port,
                file_block_size: 4 * 1024 * 1024,
                data_thread_count: 4,
                servers: servers.clone(),
                groups: vec![group.clone()],
                ..Config::default()
            }
        })
        .collect();
    (configs, listeners)
}

/// Initializes a node's state and spawns its two accept loops.
pub async fn start_node(
    mut config: Config,
    service_listener: TcpListener,
    replica_listener: TcpListener,
) -> TestNode {
    let data_dir = tempfile::tempdir().unwrap();
    config.data_dir = data_dir.path().to_str().unwrap().to_string();

    let init = ServerState::initialize(config.clone()).await.unwrap();
    let state = init.state;

    let service_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = service_listener.accept().await else {
                return;
            };
            let handler = ConnectionHandler::new(service_state.clone(), peer);
            tokio::spawn(handler.run(stream, service_state.shutdown_rx()));
        }
    });

    let replica_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = replica_listener.accept().await else {
                return;
            };
            let handler = ReplicaConnectionHandler::new(replica_state.clone(), peer);
            tokio::spawn(handler.run(stream, replica_state.shutdown_rx()));
        }
    });

    TestNode {
        state,
        config,
        data_dir,
    }
}

/// Convenience for the single-node tests.
#[allow(dead_code)] // not every test binary is multi-node
pub async fn start_single_node() -> TestNode {
    let (mut configs, mut listeners) = cluster_configs(1).await;
    let (service, replica) = listeners.remove(0);
    start_node(configs.remove(0), service, replica).await
}

/// A minimal frame-level client.
pub struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestClient {
    pub async fn connect(node: &TestNode) -> Self {
        let me = node
            .config
            .server(node.config.server_id)
            .unwrap()
            .service_addr();
        let stream = TcpStream::connect(me).await.unwrap();
        Self {
            framed: Framed::new(stream, FrameCodec),
        }
    }

    /// Sends a request and awaits its response frame.
    pub async fn call(&mut self, cmd: u16, body: Bytes) -> Frame {
        self.framed.send(Frame::request(cmd, body)).await.unwrap();
        self.framed
            .next()
            .await
            .expect("server closed the connection")
            .expect("frame decode")
    }
}

/// Polls `probe` every 50ms until it returns true or the timeout passes.
#[allow(dead_code)] // not every test binary polls
pub async fn wait_for(what: &str, timeout: Duration, mut probe: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
