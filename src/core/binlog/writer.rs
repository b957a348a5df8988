// src/core/binlog/writer.rs

//! The per-group binlog writer.
//!
//! Records are appended in strictly monotonic `data_version` order, one line
//! per record. Files rotate by size; a small side index records the tail
//! position so restart and readers find it in O(1). The durable version is
//! only advanced after the line has been flushed.

use super::codec::BinlogCodec;
use super::record::BinlogRecord;
use crate::core::SliceStoreError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

/// Appends between index-file refreshes. The index is also rewritten on
/// every rotation and on close, so a stale index only costs a short forward
/// scan at recovery.
const INDEX_REFRESH_INTERVAL: u64 = 64;

pub(super) fn binlog_file_name(file_index: u32) -> String {
    format!("binlog.{file_index:06}")
}

pub(super) const INDEX_FILE_NAME: &str = "binlog.index";

/// The persisted tail position: `last_version file_index file_offset`.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct TailIndex {
    pub last_version: u64,
    pub file_index: u32,
    pub file_offset: u64,
}

pub(super) async fn read_tail_index(dir: &Path) -> Option<TailIndex> {
    let text = tokio::fs::read_to_string(dir.join(INDEX_FILE_NAME))
        .await
        .ok()?;
    let mut fields = text.split_ascii_whitespace();
    Some(TailIndex {
        last_version: fields.next()?.parse().ok()?,
        file_index: fields.next()?.parse().ok()?,
        file_offset: fields.next()?.parse().ok()?,
    })
}

/// Lists the binlog file indexes present in `dir`, sorted ascending.
pub(super) async fn list_file_indexes(dir: &Path) -> Result<Vec<u32>, SliceStoreError> {
    let mut indexes = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(index) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix("binlog."))
            .and_then(|suffix| suffix.parse::<u32>().ok())
        {
            indexes.push(index);
        }
    }
    indexes.sort_unstable();
    Ok(indexes)
}

/// Writes one data group's binlog.
pub struct BinlogWriter {
    dir: PathBuf,
    codec: Arc<dyn BinlogCodec>,
    writer: BufWriter<File>,
    file_index: u32,
    file_offset: u64,
    rotate_size: u64,
    last_version: u64,
    durable_version: Arc<AtomicU64>,
    appends_since_index: u64,
}

impl BinlogWriter {
    /// Opens (or creates) the group's binlog directory and positions the
    /// writer at the tail. The side index is used as a hint; the tail file
    /// is always scanned from the hinted offset so a crash between append
    /// and index refresh cannot lose the real last version.
    pub async fn open(
        dir: PathBuf,
        rotate_size: u64,
        codec: Arc<dyn BinlogCodec>,
    ) -> Result<Self, SliceStoreError> {
        tokio::fs::create_dir_all(&dir).await?;

        let indexes = list_file_indexes(&dir).await?;
        let file_index = indexes.last().copied().unwrap_or(1);

        let hint = read_tail_index(&dir).await.unwrap_or_default();
        let path = dir.join(binlog_file_name(file_index));
        let file_len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        // A hint past the file's end means the index outlived a truncated
        // file; fall back to a full scan.
        let (scan_from, mut last_version) =
            if hint.file_index == file_index && hint.file_offset <= file_len {
                (hint.file_offset, hint.last_version)
            } else {
                (0, 0)
            };

        let mut file_offset = scan_from;
        match File::open(&path).await {
            Ok(file) => {
                let mut reader = BufReader::new(file);
                let mut skipped = vec![0u8; scan_from as usize];
                tokio::io::AsyncReadExt::read_exact(&mut reader, &mut skipped).await?;
                let mut line = String::new();
                loop {
                    line.clear();
                    let n = reader.read_line(&mut line).await?;
                    if n == 0 {
                        break;
                    }
                    let record = codec.decode(line.trim_end())?;
                    last_version = record.data_version;
                    file_offset += n as u64;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // When the tail file is fresh and the index pointed at an older
        // file, the previous file's last record carries the version.
        if last_version == 0 && file_offset == 0 && indexes.len() > 1 {
            let prev = indexes[indexes.len() - 2];
            last_version = last_version_in_file(&dir.join(binlog_file_name(prev)), &*codec).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(
            "binlog opened at {}, file {}, offset {}, last version {}",
            dir.display(),
            file_index,
            file_offset,
            last_version
        );

        let writer = Self {
            dir,
            codec,
            writer: BufWriter::new(file),
            file_index,
            file_offset,
            rotate_size,
            last_version,
            durable_version: Arc::new(AtomicU64::new(last_version)),
            appends_since_index: 0,
        };
        writer.write_tail_index().await?;
        Ok(writer)
    }

    /// The version of the last record flushed to the OS.
    pub fn durable_version(&self) -> u64 {
        self.durable_version.load(Ordering::Acquire)
    }

    /// A handle other components can poll without holding the writer lock.
    pub fn durable_handle(&self) -> Arc<AtomicU64> {
        self.durable_version.clone()
    }

    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    /// Appends one record. The record's version must be exactly one past
    /// the current tail; the binlog never records gaps.
    pub async fn append(&mut self, record: &BinlogRecord) -> Result<(), SliceStoreError> {
        let expected = self.last_version + 1;
        if record.data_version != expected {
            return Err(SliceStoreError::Invalid(format!(
                "binlog version {} out of order, expected {}",
                record.data_version, expected
            )));
        }

        let mut line = Vec::with_capacity(96);
        self.codec.encode(record, &mut line);
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;

        self.file_offset += line.len() as u64;
        self.last_version = record.data_version;
        self.durable_version
            .store(record.data_version, Ordering::Release);

        self.appends_since_index += 1;
        if self.file_offset >= self.rotate_size {
            self.rotate().await?;
        } else if self.appends_since_index >= INDEX_REFRESH_INTERVAL {
            self.write_tail_index().await?;
            self.appends_since_index = 0;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> Result<(), SliceStoreError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;

        self.file_index += 1;
        self.file_offset = 0;
        let path = self.dir.join(binlog_file_name(self.file_index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        self.writer = BufWriter::new(file);
        self.write_tail_index().await?;
        self.appends_since_index = 0;
        debug!("binlog rotated to {}", path.display());
        Ok(())
    }

    /// Flushes, fsyncs and records the tail position.
    pub async fn close(&mut self) -> Result<(), SliceStoreError> {
        self.writer.flush().await?;
        if let Err(e) = self.writer.get_ref().sync_all().await {
            warn!("binlog fsync on close failed: {}", e);
        }
        self.write_tail_index().await
    }

    async fn write_tail_index(&self) -> Result<(), SliceStoreError> {
        let content = format!(
            "{} {} {}\n",
            self.last_version, self.file_index, self.file_offset
        );
        let tmp = self.dir.join(format!("{INDEX_FILE_NAME}.tmp"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, self.dir.join(INDEX_FILE_NAME)).await?;
        Ok(())
    }
}

/// Reads the last record's version in a complete binlog file.
async fn last_version_in_file(
    path: &Path,
    codec: &dyn BinlogCodec,
) -> Result<u64, SliceStoreError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut last = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        last = codec.decode(line.trim_end())?.data_version;
    }
    Ok(last)
}
