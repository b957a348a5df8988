// src/core/binlog/reader.rs

//! The positioned binlog reader: a lazy, finite, restartable sequence of
//! records starting at a requested data version.

use super::codec::BinlogCodec;
use super::record::BinlogRecord;
use super::writer::{binlog_file_name, list_file_indexes};
use crate::core::SliceStoreError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Reads a group's binlog from a chosen version to the (moving) tail.
pub struct BinlogReader {
    dir: PathBuf,
    codec: Arc<dyn BinlogCodec>,
    current_index: u32,
    reader: Option<BufReader<File>>,
    start_version: u64,
    line: String,
}

impl BinlogReader {
    /// Positions a reader at the earliest record with
    /// `data_version >= start_version`. `start_version == 0` starts from the
    /// beginning of whatever is retained. Fails with `DataVersionTooOld`
    /// when the requested version predates the oldest retained record.
    pub async fn open(
        dir: PathBuf,
        codec: Arc<dyn BinlogCodec>,
        start_version: u64,
    ) -> Result<Self, SliceStoreError> {
        let indexes = list_file_indexes(&dir).await.unwrap_or_default();

        let mut chosen = indexes.first().copied().unwrap_or(1);
        let mut oldest_first = 0u64;
        for (i, file_index) in indexes.iter().enumerate() {
            let first =
                first_version_in_file(&dir.join(binlog_file_name(*file_index)), &*codec).await?;
            if i == 0 {
                oldest_first = first;
            }
            if first != 0 && first <= start_version.max(1) {
                chosen = *file_index;
            }
        }

        if oldest_first > start_version.max(1) {
            return Err(SliceStoreError::DataVersionTooOld {
                requested: start_version,
                oldest: oldest_first,
            });
        }

        Ok(Self {
            dir,
            codec,
            current_index: chosen,
            reader: None,
            start_version,
            line: String::new(),
        })
    }

    /// Yields the next record, or `None` at the current tail. Calling again
    /// later resumes where the log left off, so a tailer can poll this.
    pub async fn next_record(&mut self) -> Result<Option<BinlogRecord>, SliceStoreError> {
        loop {
            if self.reader.is_none() {
                let path = self.dir.join(binlog_file_name(self.current_index));
                match File::open(&path).await {
                    Ok(file) => self.reader = Some(BufReader::new(file)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            }

            let reader = self.reader.as_mut().expect("reader just ensured");
            self.line.clear();
            let n = reader.read_line(&mut self.line).await?;
            if n == 0 {
                // End of this file. Only advance once the writer has
                // rotated past it; otherwise report the tail and let the
                // caller retry.
                let next = self.dir.join(binlog_file_name(self.current_index + 1));
                if tokio::fs::try_exists(&next).await.unwrap_or(false) {
                    self.current_index += 1;
                    self.reader = None;
                    continue;
                }
                return Ok(None);
            }

            let record = self.codec.decode(self.line.trim_end())?;
            if record.data_version < self.start_version {
                continue;
            }
            return Ok(Some(record));
        }
    }
}

/// Reads the first record's version in a binlog file; `0` for an empty file.
async fn first_version_in_file(
    path: &std::path::Path,
    codec: &dyn BinlogCodec,
) -> Result<u64, SliceStoreError> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(0);
    }
    Ok(codec.decode(line.trim_end())?.data_version)
}
