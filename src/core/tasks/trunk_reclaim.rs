// src/core/tasks/trunk_reclaim.rs

//! The trunk reclaimer: the single consumer of the index's `SpaceDelta`
//! stream. Freed extents are booked against their trunks, and a trunk whose
//! every byte has been freed is deleted from disk.

use crate::core::engine::TrunkStore;
use crate::core::slice_index::SpaceDelta;
use crate::core::state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::warn;

const RECLAIM_SCAN_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(
    state: Arc<ServerState>,
    mut space_rx: mpsc::UnboundedReceiver<SpaceDelta>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(RECLAIM_SCAN_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            maybe_delta = space_rx.recv() => {
                let Some(delta) = maybe_delta else { return };
                if let Err(e) = state.trunk.free(&delta.loc, delta.freed_bytes).await {
                    warn!("booking freed trunk extent failed: {}", e);
                }
            }
            _ = ticker.tick() => {
                for trunk_id in state.trunk.reclaimable().await {
                    if let Err(e) = state.trunk.remove_trunk(trunk_id).await {
                        warn!("reclaiming trunk {} failed: {}", trunk_id, e);
                    }
                }
            }
        }
    }
}
