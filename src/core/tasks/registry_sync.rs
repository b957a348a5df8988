// src/core/tasks/registry_sync.rs

//! Keeps `data_group.info` on disk in step with the registry.
//!
//! Once a second the task compares the registry's change version with the
//! last one written; a difference rewrites the file. When nothing changed
//! for a minute, only the file's mtime is refreshed so a later restart can
//! still read a truthful last-alive time from it.

use crate::core::registry::persist;
use crate::core::state::ServerState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error};

const SYNC_INTERVAL: Duration = Duration::from_secs(1);
const MTIME_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut last_synced_version = 0u64;
    let mut last_refresh = Instant::now();
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if let Err(e) = state.registry.persist(state.data_dir()) {
                    error!("final registry persist failed: {}", e);
                }
                return;
            }
            _ = ticker.tick() => {}
        }

        let current = state.registry.change_version();
        if current != last_synced_version {
            match state.registry.persist(state.data_dir()) {
                Ok(()) => {
                    last_synced_version = current;
                    last_refresh = Instant::now();
                }
                Err(e) => error!("registry persist failed: {}", e),
            }
        } else if last_refresh.elapsed() > MTIME_REFRESH_INTERVAL {
            last_refresh = Instant::now();
            if let Err(e) = persist::touch_info(state.data_dir()) {
                debug!("registry mtime refresh failed: {}", e);
            }
        }
    }
}
