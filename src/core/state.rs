// src/core/state.rs

//! Defines the central `ServerState` struct, holding all shared server-wide
//! state. It is assembled once at startup and threaded through every
//! handler and task as `Arc<ServerState>`; test fixtures can build several
//! independent instances in one process.

use crate::config::Config;
use crate::core::SliceStoreError;
use crate::core::binlog::{BinlogSet, TextBinlogCodec};
use crate::core::data_worker::{WorkerPool, WorkerShared};
use crate::core::engine::{SliceEngine, TrunkFileStore};
use crate::core::idempotency::ChannelTable;
use crate::core::registry::{ClusterRegistry, ServerStatus};
use crate::core::replication::ReplicationDispatcher;
use crate::core::slice_index::{SliceIndex, SpaceDelta};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Contains the initialized state plus the channel ends consumed by the
/// background task spawner.
pub struct ServerInit {
    pub state: Arc<ServerState>,
    /// Freed trunk extents, consumed by the trunk reclaimer task.
    pub space_rx: mpsc::UnboundedReceiver<SpaceDelta>,
}

/// The central struct holding all shared, server-wide state.
pub struct ServerState {
    pub config: Config,
    pub index: Arc<SliceIndex>,
    pub engine: Arc<SliceEngine>,
    pub trunk: Arc<TrunkFileStore>,
    pub binlogs: Arc<BinlogSet>,
    pub registry: Arc<ClusterRegistry>,
    pub channels: Arc<ChannelTable>,
    pub dispatcher: Arc<ReplicationDispatcher>,
    pub workers: WorkerPool,
    /// Flipping this to `true` starts the shutdown drain everywhere.
    pub shutdown_tx: watch::Sender<bool>,
    pub conn_current: AtomicUsize,
    pub conn_peak: AtomicUsize,
}

impl ServerState {
    /// Initializes the entire server state from the given configuration:
    /// opens the trunk store and per-group binlogs, loads the persisted
    /// registry, applies preset masters, and spawns the data workers.
    pub async fn initialize(config: Config) -> Result<ServerInit, SliceStoreError> {
        let data_dir = PathBuf::from(&config.data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let (space_tx, space_rx) = mpsc::unbounded_channel();
        let index = Arc::new(SliceIndex::new(space_tx));
        let trunk = Arc::new(TrunkFileStore::open(&data_dir).await?);
        let engine = Arc::new(SliceEngine::new(
            index.clone(),
            trunk.clone(),
            config.file_block_size,
        ));

        let registry = Arc::new(ClusterRegistry::from_config(&config));
        if let Some(shutdown) = registry.load(&data_dir)? {
            info!("previous shutdown at {:?}", shutdown);
        }

        // The binlog tail, not the registry snapshot, is the authority on
        // this server's own data versions.
        let binlogs = Arc::new(BinlogSet::new(
            &data_dir,
            config.binlog_rotate_size,
            Arc::new(TextBinlogCodec),
        ));
        for group_id in registry.my_group_ids() {
            let last = binlogs.open_group(group_id).await?;
            registry.set_my_data_version(group_id, last);
            info!("group {}: binlog recovered at version {}", group_id, last);
        }

        apply_preset_masters(&config, &registry);

        let channels = Arc::new(ChannelTable::new(
            config.max_channel_count,
            config.idempotency_channel_reserve_interval,
        ));
        let dispatcher = Arc::new(ReplicationDispatcher::new(
            registry.clone(),
            config.replica_queue_demote_threshold,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = WorkerPool::spawn(
            Arc::new(WorkerShared {
                engine: engine.clone(),
                binlogs: binlogs.clone(),
                registry: registry.clone(),
                dispatcher: dispatcher.clone(),
            }),
            config.workers_per_array(),
            shutdown_rx,
        );

        registry.persist(&data_dir)?;

        let state = Arc::new(Self {
            config,
            index,
            engine,
            trunk,
            binlogs,
            registry,
            channels,
            dispatcher,
            workers,
            shutdown_tx,
            conn_current: AtomicUsize::new(0),
            conn_peak: AtomicUsize::new(0),
        });

        Ok(ServerInit { state, space_rx })
    }

    pub fn data_dir(&self) -> &Path {
        Path::new(&self.config.data_dir)
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// True once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Connection accounting for `SERVICE_STAT`.
    pub fn connection_opened(&self) -> usize {
        let current = self.conn_current.fetch_add(1, Ordering::AcqRel) + 1;
        self.conn_peak.fetch_max(current, Ordering::AcqRel);
        current
    }

    pub fn connection_closed(&self) {
        self.conn_current.fetch_sub(1, Ordering::AcqRel);
    }

    /// Persists what must survive a restart; called on orderly shutdown.
    pub async fn persist_on_shutdown(&self) {
        self.binlogs.close_all().await;
        if let Err(e) = self.registry.persist(self.data_dir()) {
            tracing::error!("persisting registry on shutdown failed: {}", e);
        }
    }
}

/// Honors the operator's preset master hints for any group that has no
/// master yet; the external leader protocol overrides these at runtime.
/// Becoming master makes this server `Active` for the group.
fn apply_preset_masters(config: &Config, registry: &Arc<ClusterRegistry>) {
    for group in &config.groups {
        let Some(preset) = group.preseted_master else {
            continue;
        };
        if registry.get_master(group.group_id).is_err() {
            let _ = registry.set_master(group.group_id, preset);
        }
        if registry.am_master(group.group_id) {
            registry.set_status(group.group_id, config.server_id, ServerStatus::Active);
        }
    }
}
