// src/server/initialization.rs

//! Builds the `ServerContext`: shared state, recovery from persisted
//! registry and binlogs, and the two listening sockets.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::ServerState;
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::info;

pub async fn setup(config: Config) -> Result<ServerContext> {
    let service_addr = format!("{}:{}", config.bind_addr, config.service_port);
    let replica_addr = format!("{}:{}", config.bind_addr, config.replica_port);

    let init = ServerState::initialize(config)
        .await
        .context("initializing server state")?;

    let service_listener = TcpListener::bind(&service_addr)
        .await
        .with_context(|| format!("binding service port at {service_addr}"))?;
    let replica_listener = TcpListener::bind(&replica_addr)
        .await
        .with_context(|| format!("binding replica port at {replica_addr}"))?;

    info!(
        "server {} listening on {} (service) and {} (replica)",
        init.state.registry.my_server_id, service_addr, replica_addr
    );

    Ok(ServerContext {
        state: init.state,
        space_rx: Some(init.space_rx),
        service_listener,
        replica_listener,
        background_tasks: JoinSet::new(),
    })
}
