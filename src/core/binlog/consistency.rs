// src/core/binlog/consistency.rs

//! Binlog consistency checking and tail extraction, used by the leader
//! re-sync exchange: a peer sends its last records as text, and we report
//! the first data version whose mutation differs from our own log.

use super::codec::BinlogCodec;
use super::reader::BinlogReader;
use super::record::BinlogRecord;
use super::writer::{binlog_file_name, list_file_indexes};
use crate::core::SliceStoreError;
use std::path::Path;
use std::sync::Arc;

/// Parses a peer's record lines and walks the local log in parallel.
/// Returns the first unmatched data version, or `None` when every peer
/// record matches a local record. A version the local log does not contain
/// at all counts as unmatched.
pub async fn check_consistency(
    dir: &Path,
    codec: Arc<dyn BinlogCodec>,
    peer_buffer: &str,
) -> Result<Option<u64>, SliceStoreError> {
    let mut peer_records = Vec::new();
    for line in peer_buffer.lines() {
        if line.trim().is_empty() {
            continue;
        }
        peer_records.push(codec.decode(line)?);
    }
    let Some(first) = peer_records.first() else {
        return Ok(None);
    };

    let mut reader =
        match BinlogReader::open(dir.to_path_buf(), codec, first.data_version).await {
            Ok(reader) => reader,
            // Our retention no longer covers the peer's window; everything
            // it sent is unverifiable.
            Err(SliceStoreError::DataVersionTooOld { .. }) => {
                return Ok(Some(first.data_version));
            }
            Err(e) => return Err(e),
        };

    let mut local: Option<BinlogRecord> = reader.next_record().await?;
    for peer in &peer_records {
        // Advance the local cursor to the peer's version.
        while let Some(rec) = &local {
            if rec.data_version >= peer.data_version {
                break;
            }
            local = reader.next_record().await?;
        }

        match &local {
            Some(rec) if rec.same_mutation(peer) => {}
            _ => return Ok(Some(peer.data_version)),
        }
    }

    Ok(None)
}

/// Returns up to `count` trailing record lines of the group's binlog,
/// newest last, spanning the file boundary if the tail file is short.
pub async fn last_lines(
    dir: &Path,
    count: usize,
) -> Result<Vec<String>, SliceStoreError> {
    let indexes = list_file_indexes(dir).await?;
    let mut collected: Vec<String> = Vec::new();

    for file_index in indexes.iter().rev() {
        let path = dir.join(binlog_file_name(*file_index));
        let content = tokio::fs::read_to_string(&path).await?;
        let mut lines: Vec<String> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();

        lines.extend(collected);
        collected = lines;
        if collected.len() >= count {
            let skip = collected.len() - count;
            collected.drain(..skip);
            break;
        }
    }

    Ok(collected)
}
