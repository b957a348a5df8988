// src/server/spawner.rs

//! Spawns the server's long-running background tasks: registry sync,
//! channel pruning, trunk reclamation, and one replication follower per
//! data group this server belongs to.

use super::context::ServerContext;
use crate::core::replication;
use crate::core::tasks;
use tracing::info;

pub fn spawn_all(context: &mut ServerContext) {
    let state = &context.state;

    context.background_tasks.spawn(tasks::registry_sync::run(
        state.clone(),
        state.shutdown_rx(),
    ));
    context.background_tasks.spawn(tasks::channel_pruner::run(
        state.clone(),
        state.shutdown_rx(),
    ));

    let space_rx = context
        .space_rx
        .take()
        .expect("space_rx consumed exactly once");
    context.background_tasks.spawn(tasks::trunk_reclaim::run(
        state.clone(),
        space_rx,
        state.shutdown_rx(),
    ));

    // A follower per group; it idles while this server is the master.
    for group_id in state.registry.my_group_ids() {
        context.background_tasks.spawn(replication::worker::run(
            state.clone(),
            group_id,
            state.shutdown_rx(),
        ));
    }

    info!("background tasks started");
}
