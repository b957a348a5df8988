// src/core/slice_index/mod.rs

//! The in-memory block/slice index: keys, records, and the sharded map
//! from block keys to their sorted, non-overlapping slice sets.

mod index;

pub use index::{SliceIndex, UpsertOutcome, is_coherent};

use std::fmt;

/// Identifies a block: the unit of placement. `offset` is always a multiple
/// of the cluster-wide block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub oid: i64,
    pub offset: i64,
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid {} block offset {}", self.oid, self.offset)
    }
}

/// A contiguous byte range within a block: the unit of I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub offset: u32,
    pub length: u32,
}

impl SliceRange {
    pub fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }

    /// The intersection with `other`, if any bytes are shared.
    pub fn intersect(&self, other: &SliceRange) -> Option<SliceRange> {
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        (start < end).then(|| SliceRange::new(start, end - start))
    }
}

/// A block key plus a slice range within that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceKey {
    pub block: BlockKey,
    pub slice: SliceRange,
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, slice offset {} length {}",
            self.block, self.slice.offset, self.slice.length
        )
    }
}

/// How the slice came to exist: a real write carrying data, or a space
/// reservation from `fallocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceKind {
    Write,
    Alloc,
}

/// An opaque location in the trunk backing store. The trunk allocator owns
/// the meaning of both fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrunkLoc {
    pub trunk_id: u64,
    pub inner_offset: u64,
}

impl TrunkLoc {
    /// The location `n` bytes into this one.
    pub fn advanced(&self, n: u32) -> TrunkLoc {
        TrunkLoc {
            trunk_id: self.trunk_id,
            inner_offset: self.inner_offset + n as u64,
        }
    }
}

/// One entry in the per-block slice set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRecord {
    pub range: SliceRange,
    pub kind: SliceKind,
    pub loc: TrunkLoc,
}

/// A freed trunk extent, emitted whenever index bytes stop referencing
/// trunk storage. Consumed by the trunk reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceDelta {
    pub loc: TrunkLoc,
    pub freed_bytes: u32,
}
