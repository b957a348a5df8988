// src/core/tasks/channel_pruner.rs

//! Periodically evicts idle idempotency channels and expired finished
//! entries past the reserve interval.

use crate::core::state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => state.channels.prune(),
        }
    }
}
