// src/core/replication/dispatcher.rs

//! The master-side replication dispatcher.
//!
//! Every committed mutation is pushed onto the queue of each registered
//! slave; a long-lived sender (the replica connection handler) drains the
//! queue onto the wire and feeds acks back here. Pushing never blocks the
//! writing worker: a slave whose unacked backlog grows past the configured
//! threshold is demoted to `Offline` and must resync.

use crate::core::protocol::commands::ReplicaRpcBody;
use crate::core::registry::{ClusterRegistry, ServerStatus};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct SlaveHandle {
    tx: mpsc::UnboundedSender<ReplicaRpcBody>,
    /// Operations pushed but not yet acked.
    queued: Arc<AtomicUsize>,
    confirmed: Arc<AtomicU64>,
}

/// Tracks the live replica sessions of every group this server masters.
pub struct ReplicationDispatcher {
    registry: Arc<ClusterRegistry>,
    slaves: DashMap<(u32, u32), SlaveHandle>,
    demote_threshold: usize,
}

impl ReplicationDispatcher {
    pub fn new(registry: Arc<ClusterRegistry>, demote_threshold: usize) -> Self {
        Self {
            registry,
            slaves: DashMap::new(),
            demote_threshold,
        }
    }

    /// Registers a slave session and returns the queue its sender drains.
    /// A re-register replaces any stale session; the old receiver closes
    /// and its handler winds down.
    pub fn register(
        &self,
        group_id: u32,
        server_id: u32,
    ) -> mpsc::UnboundedReceiver<ReplicaRpcBody> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.slaves.insert(
            (group_id, server_id),
            SlaveHandle {
                tx,
                queued: Arc::new(AtomicUsize::new(0)),
                confirmed: Arc::new(AtomicU64::new(0)),
            },
        );
        self.registry
            .set_status(group_id, server_id, ServerStatus::Online);
        info!("group {}: slave {} registered", group_id, server_id);
        rx
    }

    /// Drops a slave session, demoting it to `Offline`. Its queue is lost;
    /// the slave resyncs from its own last persisted version on reconnect.
    pub fn unregister(&self, group_id: u32, server_id: u32) {
        if self.slaves.remove(&(group_id, server_id)).is_some() {
            self.registry
                .set_status(group_id, server_id, ServerStatus::Offline);
            info!("group {}: slave {} unregistered", group_id, server_id);
        }
    }

    /// Fans a committed mutation out to every registered slave of the
    /// group. Never blocks; an overloaded slave is demoted instead.
    pub fn push(&self, group_id: u32, body: ReplicaRpcBody) {
        let mut demote = Vec::new();
        for entry in self.slaves.iter() {
            let (entry_group, server_id) = *entry.key();
            if entry_group != group_id {
                continue;
            }
            let handle = entry.value();
            let backlog = handle.queued.fetch_add(1, Ordering::AcqRel) + 1;
            if backlog > self.demote_threshold || handle.tx.send(body.clone()).is_err() {
                demote.push(server_id);
            }
        }
        for server_id in demote {
            warn!(
                "group {}: slave {} fell behind (queue > {}), demoting",
                group_id, server_id, self.demote_threshold
            );
            self.unregister(group_id, server_id);
        }
    }

    /// Records a slave's `ack(data_version)`: advances its confirmed
    /// watermark and its registry bookkeeping, and promotes it to `Active`
    /// once it has caught up with the master's own version.
    pub fn ack(&self, group_id: u32, server_id: u32, data_version: u64) {
        let Some(handle) = self.slaves.get(&(group_id, server_id)) else {
            return;
        };
        handle
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                Some(q.saturating_sub(1))
            })
            .ok();
        handle.confirmed.fetch_max(data_version, Ordering::AcqRel);
        drop(handle);

        self.registry
            .set_data_version(group_id, server_id, data_version);
        self.registry
            .set_confirmed_version(group_id, server_id, data_version);

        if self.registry.status_of(group_id, server_id) == Some(ServerStatus::Syncing)
            && data_version >= self.registry.my_data_version(group_id)
        {
            self.registry
                .set_status(group_id, server_id, ServerStatus::Active);
        }
    }

    /// The last version this slave has acknowledged in its live session.
    pub fn confirmed_version(&self, group_id: u32, server_id: u32) -> u64 {
        self.slaves
            .get(&(group_id, server_id))
            .map(|h| h.confirmed.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// The lowest acknowledged version across the group's live slaves;
    /// `None` with no slave registered.
    pub fn confirmed_floor(&self, group_id: u32) -> Option<u64> {
        self.slaves
            .iter()
            .filter(|entry| entry.key().0 == group_id)
            .map(|entry| entry.value().confirmed.load(Ordering::Acquire))
            .min()
    }

    /// Live slave session count for the group.
    pub fn slave_count(&self, group_id: u32) -> usize {
        self.slaves
            .iter()
            .filter(|entry| entry.key().0 == group_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GroupEntry, ServerEntry};
    use crate::core::binlog::{BinlogOpType, BinlogRecord, RecordSource};
    use crate::core::slice_index::{BlockKey, SliceRange};
    use bytes::Bytes;

    fn registry() -> Arc<ClusterRegistry> {
        let config = Config {
            server_id: 1,
            servers: vec![
                ServerEntry {
                    id: 1,
                    host: "127.0.0.1".into(),
                    service_port: 9012,
                    replica_port: 9014,
                },
                ServerEntry {
                    id: 2,
                    host: "127.0.0.1".into(),
                    service_port: 9022,
                    replica_port: 9024,
                },
            ],
            groups: vec![GroupEntry {
                group_id: 1,
                servers: vec![1, 2],
                preseted_master: Some(1),
            }],
            ..Config::default()
        };
        Arc::new(ClusterRegistry::from_config(&config))
    }

    fn body(data_version: u64) -> ReplicaRpcBody {
        ReplicaRpcBody {
            record: BinlogRecord::slice_op(
                BinlogOpType::WriteSlice,
                RecordSource::Rpc,
                data_version,
                BlockKey { oid: 1, offset: 0 },
                SliceRange::new(0, 1),
            ),
            payload: Bytes::from_static(b"x"),
        }
    }

    #[tokio::test]
    async fn push_reaches_registered_slave() {
        let registry = registry();
        let dispatcher = ReplicationDispatcher::new(registry.clone(), 16);
        let mut rx = dispatcher.register(1, 2);
        assert_eq!(registry.status_of(1, 2), Some(ServerStatus::Online));

        dispatcher.push(1, body(1));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.record.data_version, 1);
    }

    #[tokio::test]
    async fn ack_advances_watermarks_and_promotes() {
        let registry = registry();
        registry.set_master(1, 1).unwrap();
        registry.set_my_data_version(1, 2);
        let dispatcher = ReplicationDispatcher::new(registry.clone(), 16);
        let _rx = dispatcher.register(1, 2);
        registry.set_status(1, 2, ServerStatus::Syncing);

        dispatcher.push(1, body(1));
        dispatcher.push(1, body(2));
        dispatcher.ack(1, 2, 1);
        assert_eq!(dispatcher.confirmed_version(1, 2), 1);
        assert_eq!(registry.status_of(1, 2), Some(ServerStatus::Syncing));

        dispatcher.ack(1, 2, 2);
        assert_eq!(registry.status_of(1, 2), Some(ServerStatus::Active));
    }

    #[tokio::test]
    async fn lagging_slave_is_demoted() {
        let registry = registry();
        let dispatcher = ReplicationDispatcher::new(registry.clone(), 2);
        let _rx = dispatcher.register(1, 2);

        dispatcher.push(1, body(1));
        dispatcher.push(1, body(2));
        assert_eq!(dispatcher.slave_count(1), 1);
        dispatcher.push(1, body(3));
        assert_eq!(dispatcher.slave_count(1), 0);
        assert_eq!(registry.status_of(1, 2), Some(ServerStatus::Offline));
    }
}
