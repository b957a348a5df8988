// src/core/engine/trunk.rs

//! The trunk backing store: the contract the slice engine writes through,
//! and the default file-backed implementation.
//!
//! A trunk is an on-disk extent file. The allocator hands out `TrunkLoc`s
//! bump-style within the current trunk and rolls over to a fresh trunk when
//! it fills. Freed bytes are only accounted here; the reclaimer removes a
//! trunk file once every byte it ever held has been freed.

use crate::core::SliceStoreError;
use crate::core::slice_index::TrunkLoc;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default capacity of a single trunk file.
const DEFAULT_TRUNK_SIZE: u64 = 256 * 1024 * 1024; // 256MB

/// The contract between the slice engine and trunk storage. `read` of a
/// range the trunk never stored reports `NotFound`, which the engine treats
/// as zero-fill.
#[async_trait]
pub trait TrunkStore: Send + Sync {
    /// Reserves `len` bytes of trunk space and returns their location.
    async fn allocate(&self, len: u32) -> Result<TrunkLoc, SliceStoreError>;

    /// Persists `data` at `loc`. Returns the number of bytes written, which
    /// may be short of `data.len()` on a constrained store.
    async fn write(&self, loc: &TrunkLoc, data: &[u8]) -> Result<u32, SliceStoreError>;

    /// Reads `len` bytes starting `skip` bytes into `loc`.
    async fn read(&self, loc: &TrunkLoc, skip: u32, len: u32) -> Result<Vec<u8>, SliceStoreError>;

    /// Reports `len` bytes at `loc` as no longer referenced.
    async fn free(&self, loc: &TrunkLoc, len: u32) -> Result<(), SliceStoreError>;
}

/// Per-trunk accounting used to decide when a trunk file is reclaimable.
#[derive(Debug, Default)]
struct TrunkUsage {
    allocated: AtomicU64,
    freed: AtomicU64,
}

/// Allocation cursor: all new space comes from the tail of the current trunk.
#[derive(Debug)]
struct AllocCursor {
    trunk_id: u64,
    offset: u64,
}

/// The default `TrunkStore`: one file per trunk under `<data_dir>/trunks/`.
#[derive(Debug)]
pub struct TrunkFileStore {
    dir: PathBuf,
    trunk_size: u64,
    cursor: Mutex<AllocCursor>,
    files: DashMap<u64, Arc<Mutex<File>>>,
    usage: DashMap<u64, TrunkUsage>,
}

impl TrunkFileStore {
    pub async fn open(data_dir: &Path) -> Result<Self, SliceStoreError> {
        let dir = data_dir.join("trunks");
        tokio::fs::create_dir_all(&dir).await?;

        // Resume allocation after the highest trunk already on disk.
        let mut next_id = 1u64;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("trunk."))
                .and_then(|id| id.parse::<u64>().ok())
            {
                next_id = next_id.max(id + 1);
            }
        }

        Ok(Self {
            dir,
            trunk_size: DEFAULT_TRUNK_SIZE,
            cursor: Mutex::new(AllocCursor {
                trunk_id: next_id,
                offset: 0,
            }),
            files: DashMap::new(),
            usage: DashMap::new(),
        })
    }

    fn trunk_path(&self, trunk_id: u64) -> PathBuf {
        self.dir.join(format!("trunk.{trunk_id}"))
    }

    async fn file(&self, trunk_id: u64, create: bool) -> Result<Arc<Mutex<File>>, SliceStoreError> {
        if let Some(file) = self.files.get(&trunk_id) {
            return Ok(file.clone());
        }

        let path = self.trunk_path(trunk_id);
        let open = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .await;
        let file = match open {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SliceStoreError::NotFound(format!(
                    "trunk {trunk_id} does not exist"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let file = Arc::new(Mutex::new(file));
        self.files.insert(trunk_id, file.clone());
        Ok(file)
    }

    /// Trunk ids whose every allocated byte has been freed. The current
    /// allocation trunk is never reported.
    pub async fn reclaimable(&self) -> Vec<u64> {
        let current = self.cursor.lock().await.trunk_id;
        self.usage
            .iter()
            .filter(|entry| {
                let allocated = entry.value().allocated.load(Ordering::Acquire);
                let freed = entry.value().freed.load(Ordering::Acquire);
                *entry.key() != current && allocated > 0 && freed >= allocated
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Deletes a fully freed trunk file and forgets its accounting.
    pub async fn remove_trunk(&self, trunk_id: u64) -> Result<(), SliceStoreError> {
        self.files.remove(&trunk_id);
        self.usage.remove(&trunk_id);
        match tokio::fs::remove_file(self.trunk_path(trunk_id)).await {
            Ok(()) => {
                info!("reclaimed trunk {}", trunk_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TrunkStore for TrunkFileStore {
    async fn allocate(&self, len: u32) -> Result<TrunkLoc, SliceStoreError> {
        if len as u64 > self.trunk_size {
            return Err(SliceStoreError::Overflow(format!(
                "allocation of {len} bytes exceeds the trunk size"
            )));
        }

        let mut cursor = self.cursor.lock().await;
        if cursor.offset + len as u64 > self.trunk_size {
            cursor.trunk_id += 1;
            cursor.offset = 0;
            debug!("trunk rolled over to {}", cursor.trunk_id);
        }
        let loc = TrunkLoc {
            trunk_id: cursor.trunk_id,
            inner_offset: cursor.offset,
        };
        cursor.offset += len as u64;

        self.usage
            .entry(loc.trunk_id)
            .or_default()
            .allocated
            .fetch_add(len as u64, Ordering::AcqRel);
        Ok(loc)
    }

    async fn write(&self, loc: &TrunkLoc, data: &[u8]) -> Result<u32, SliceStoreError> {
        let file = self.file(loc.trunk_id, true).await?;
        let mut file = file.lock().await;
        file.seek(SeekFrom::Start(loc.inner_offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u32)
    }

    async fn read(&self, loc: &TrunkLoc, skip: u32, len: u32) -> Result<Vec<u8>, SliceStoreError> {
        let file = self.file(loc.trunk_id, false).await?;
        let mut file = file.lock().await;
        file.seek(SeekFrom::Start(loc.inner_offset + skip as u64))
            .await?;

        let mut buf = vec![0u8; len as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                // Reading past what was ever written: the caller zero-fills.
                return Err(SliceStoreError::NotFound(format!(
                    "trunk {} has no data at offset {}",
                    loc.trunk_id,
                    loc.inner_offset + skip as u64 + filled as u64
                )));
            }
            filled += n;
        }
        Ok(buf)
    }

    async fn free(&self, loc: &TrunkLoc, len: u32) -> Result<(), SliceStoreError> {
        self.usage
            .entry(loc.trunk_id)
            .or_default()
            .freed
            .fetch_add(len as u64, Ordering::AcqRel);
        Ok(())
    }
}
