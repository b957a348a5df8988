// src/core/binlog/mod.rs

//! The per-data-group replication binlog: an append-only, monotonic log of
//! mutations, with a writer, a positioned reader, and a consistency check.

pub mod codec;
pub mod consistency;
pub mod reader;
pub mod record;
pub mod writer;

pub use codec::{BinlogCodec, TextBinlogCodec};
pub use reader::BinlogReader;
pub use record::{BinlogOpType, BinlogRecord, RecordSource};
pub use writer::BinlogWriter;

use crate::core::SliceStoreError;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// All binlogs of the groups this server participates in, keyed by group id.
pub struct BinlogSet {
    base_dir: PathBuf,
    rotate_size: u64,
    codec: Arc<dyn BinlogCodec>,
    writers: DashMap<u32, Arc<Mutex<BinlogWriter>>>,
    durables: DashMap<u32, Arc<AtomicU64>>,
}

impl BinlogSet {
    pub fn new(data_dir: &Path, rotate_size: u64, codec: Arc<dyn BinlogCodec>) -> Self {
        Self {
            base_dir: data_dir.join("replica"),
            rotate_size,
            codec,
            writers: DashMap::new(),
            durables: DashMap::new(),
        }
    }

    /// `<data_dir>/replica/<group_id>/`
    pub fn group_dir(&self, group_id: u32) -> PathBuf {
        self.base_dir.join(group_id.to_string())
    }

    /// Opens (or creates) the group's binlog and remembers its writer.
    /// Returns the version of the last record already on disk.
    pub async fn open_group(&self, group_id: u32) -> Result<u64, SliceStoreError> {
        let writer = BinlogWriter::open(
            self.group_dir(group_id),
            self.rotate_size,
            self.codec.clone(),
        )
        .await?;
        let last = writer.last_version();
        self.durables.insert(group_id, writer.durable_handle());
        self.writers
            .insert(group_id, Arc::new(Mutex::new(writer)));
        Ok(last)
    }

    fn writer(&self, group_id: u32) -> Result<Arc<Mutex<BinlogWriter>>, SliceStoreError> {
        self.writers
            .get(&group_id)
            .map(|w| w.clone())
            .ok_or_else(|| SliceStoreError::NotFound(format!("no binlog for group {group_id}")))
    }

    /// Appends a record to the group's log.
    pub async fn append(&self, group_id: u32, record: &BinlogRecord) -> Result<(), SliceStoreError> {
        let writer = self.writer(group_id)?;
        let mut writer = writer.lock().await;
        writer.append(record).await
    }

    /// Assigns the next data version and appends in one critical section,
    /// so workers on different blocks of the same group cannot interleave
    /// their versions out of order. `committed` runs under the same lock,
    /// which is what keeps the replication fan-out version-ordered too.
    pub async fn append_assigned<B, C>(
        &self,
        group_id: u32,
        build: B,
        committed: C,
    ) -> Result<BinlogRecord, SliceStoreError>
    where
        B: FnOnce(u64) -> BinlogRecord,
        C: FnOnce(&BinlogRecord),
    {
        let writer = self.writer(group_id)?;
        let mut writer = writer.lock().await;
        let record = build(writer.last_version() + 1);
        writer.append(&record).await?;
        committed(&record);
        Ok(record)
    }

    /// The last flushed data version of the group, `0` for an unknown group.
    pub fn durable_version(&self, group_id: u32) -> u64 {
        self.durables
            .get(&group_id)
            .map(|d| d.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// A reader positioned at `start_version` (see `BinlogReader::open`).
    pub async fn reader(
        &self,
        group_id: u32,
        start_version: u64,
    ) -> Result<BinlogReader, SliceStoreError> {
        BinlogReader::open(self.group_dir(group_id), self.codec.clone(), start_version).await
    }

    /// Compares a peer's trailing records against the local log.
    pub async fn check_consistency(
        &self,
        group_id: u32,
        peer_buffer: &str,
    ) -> Result<Option<u64>, SliceStoreError> {
        consistency::check_consistency(&self.group_dir(group_id), self.codec.clone(), peer_buffer)
            .await
    }

    /// The trailing `count` record lines of the group's log.
    pub async fn last_lines(
        &self,
        group_id: u32,
        count: usize,
    ) -> Result<Vec<String>, SliceStoreError> {
        consistency::last_lines(&self.group_dir(group_id), count).await
    }

    /// Flushes and fsyncs every group's log; called on shutdown.
    pub async fn close_all(&self) {
        for entry in self.writers.iter() {
            let mut writer = entry.value().lock().await;
            if let Err(e) = writer.close().await {
                tracing::error!("closing binlog for group {} failed: {}", entry.key(), e);
            }
        }
    }
}
