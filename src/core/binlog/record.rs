// src/core/binlog/record.rs

//! The replica binlog record: one line per committed mutation, tagged with
//! the group's monotonic data version.

use crate::core::SliceStoreError;
use crate::core::slice_index::{BlockKey, SliceRange};
use std::time::{SystemTime, UNIX_EPOCH};

/// The mutation kind a binlog record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogOpType {
    WriteSlice,
    AllocSlice,
    DelSlice,
    DelBlock,
    /// Version padding; carries a block key but no mutation.
    NoOp,
}

impl BinlogOpType {
    pub fn as_code(&self) -> u8 {
        match self {
            BinlogOpType::WriteSlice => 1,
            BinlogOpType::AllocSlice => 2,
            BinlogOpType::DelSlice => 3,
            BinlogOpType::DelBlock => 4,
            BinlogOpType::NoOp => 5,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, SliceStoreError> {
        match code {
            1 => Ok(BinlogOpType::WriteSlice),
            2 => Ok(BinlogOpType::AllocSlice),
            3 => Ok(BinlogOpType::DelSlice),
            4 => Ok(BinlogOpType::DelBlock),
            5 => Ok(BinlogOpType::NoOp),
            other => Err(SliceStoreError::Corrupt(format!(
                "unknown binlog op type {other}"
            ))),
        }
    }

    /// Whether records of this kind carry a slice range after the block key.
    pub fn has_slice(&self) -> bool {
        matches!(
            self,
            BinlogOpType::WriteSlice | BinlogOpType::AllocSlice | BinlogOpType::DelSlice
        )
    }
}

/// Where the mutation entered this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// Accepted from a client RPC on the master.
    Rpc,
    /// Replayed from the master onto a slave.
    Replay,
    /// Reconstructed during data rebuild.
    Rebuild,
}

impl RecordSource {
    pub fn as_code(&self) -> u8 {
        match self {
            RecordSource::Rpc => 1,
            RecordSource::Replay => 2,
            RecordSource::Rebuild => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, SliceStoreError> {
        match code {
            1 => Ok(RecordSource::Rpc),
            2 => Ok(RecordSource::Replay),
            3 => Ok(RecordSource::Rebuild),
            other => Err(SliceStoreError::Corrupt(format!(
                "unknown binlog source {other}"
            ))),
        }
    }
}

/// One binlog record. Records appear in strictly increasing `data_version`
/// order within a group's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinlogRecord {
    pub timestamp: i64,
    pub data_version: u64,
    pub source: RecordSource,
    pub op_type: BinlogOpType,
    pub block: BlockKey,
    /// Present for slice-level operations, absent for `DelBlock`/`NoOp`.
    pub slice: Option<SliceRange>,
}

impl BinlogRecord {
    /// A record for a slice-level mutation, stamped with the current time.
    pub fn slice_op(
        op_type: BinlogOpType,
        source: RecordSource,
        data_version: u64,
        block: BlockKey,
        slice: SliceRange,
    ) -> Self {
        Self {
            timestamp: unix_now(),
            data_version,
            source,
            op_type,
            block,
            slice: Some(slice),
        }
    }

    /// A record for a block-level operation.
    pub fn block_op(
        op_type: BinlogOpType,
        source: RecordSource,
        data_version: u64,
        block: BlockKey,
    ) -> Self {
        Self {
            timestamp: unix_now(),
            data_version,
            source,
            op_type,
            block,
            slice: None,
        }
    }

    /// True when two records describe the same mutation, ignoring timestamp
    /// and source. This is the comparison the consistency check uses.
    pub fn same_mutation(&self, other: &BinlogRecord) -> bool {
        self.data_version == other.data_version
            && self.op_type == other.op_type
            && self.block == other.block
            && self.slice == other.slice
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
