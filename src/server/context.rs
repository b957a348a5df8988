// src/server/context.rs

use crate::core::slice_index::SpaceDelta;
use crate::core::state::ServerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub state: Arc<ServerState>,
    /// Taken by the spawner for the trunk reclaimer task.
    pub space_rx: Option<mpsc::UnboundedReceiver<SpaceDelta>>,
    pub service_listener: TcpListener,
    pub replica_listener: TcpListener,
    pub background_tasks: JoinSet<()>,
}
