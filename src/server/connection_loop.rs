// src/server/connection_loop.rs

//! The accept loop for both listening sockets, plus orderly shutdown on
//! SIGINT: flip the shutdown flag, drain the workers, persist the registry
//! and binlog tails, then exit.

use super::context::ServerContext;
use crate::connection::{ConnectionHandler, ReplicaConnectionHandler};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(mut context: ServerContext) {
    let state = context.state.clone();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            accepted = context.service_listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                if state.conn_current.load(Ordering::Acquire) >= state.config.max_clients {
                    warn!("max clients reached, rejecting {}", peer);
                    continue;
                }
                let handler = ConnectionHandler::new(state.clone(), peer);
                tokio::spawn(handler.run(stream, state.shutdown_rx()));
            }
            accepted = context.replica_listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let handler = ReplicaConnectionHandler::new(state.clone(), peer);
                tokio::spawn(handler.run(stream, state.shutdown_rx()));
            }
        }
    }

    state.begin_shutdown();

    let drain = async {
        while context.background_tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("background tasks did not drain in time, aborting them");
        context.background_tasks.abort_all();
    }

    state.persist_on_shutdown().await;
    info!("shutdown complete");
}
