// src/core/engine/mod.rs

//! The slice operation engine: executes read/write/allocate/delete against
//! the slice index and the trunk backing store.
//!
//! The engine assumes it runs on a data worker and therefore has exclusive
//! mutation access to the block it touches; the index's own locks only cover
//! concurrent readers.

pub mod trunk;

pub use trunk::{TrunkFileStore, TrunkStore};

use crate::core::SliceStoreError;
use crate::core::slice_index::{SliceIndex, SliceKey, SliceKind, SliceRecord};
use bytes::Bytes;
use std::sync::Arc;

/// The outcome of a mutating slice operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateResult {
    /// Bytes actually written or removed.
    pub done_bytes: u32,
    /// Signed change in occupied space. Negative for deletes, zero for an
    /// allocate over an already covered range.
    pub inc_alloc: i64,
}

/// Executes slice operations against a shared index and trunk store.
pub struct SliceEngine {
    index: Arc<SliceIndex>,
    trunk: Arc<dyn TrunkStore>,
    block_size: u32,
}

impl SliceEngine {
    pub fn new(index: Arc<SliceIndex>, trunk: Arc<dyn TrunkStore>, block_size: u32) -> Self {
        Self {
            index,
            trunk,
            block_size,
        }
    }

    pub fn index(&self) -> &Arc<SliceIndex> {
        &self.index
    }

    /// Validates that the slice lies within a single block.
    fn check_slice(&self, key: &SliceKey) -> Result<(), SliceStoreError> {
        if key.slice.length == 0 {
            return Err(SliceStoreError::Invalid("slice length cannot be 0".into()));
        }
        if key.slice.offset.checked_add(key.slice.length).is_none()
            || key.slice.end() > self.block_size
        {
            return Err(SliceStoreError::Invalid(format!(
                "slice offset {} + length {} exceeds the block size {}",
                key.slice.offset, key.slice.length, self.block_size
            )));
        }
        Ok(())
    }

    /// Persists `payload` as a slice: allocates trunk space, writes the
    /// bytes, then publishes the record in the index. A short trunk write
    /// yields a correspondingly shorter record and `done_bytes`.
    pub async fn write_slice(
        &self,
        key: &SliceKey,
        payload: &Bytes,
    ) -> Result<UpdateResult, SliceStoreError> {
        self.check_slice(key)?;
        if payload.len() != key.slice.length as usize {
            return Err(SliceStoreError::Invalid(format!(
                "payload length {} != slice length {}",
                payload.len(),
                key.slice.length
            )));
        }

        let loc = self.trunk.allocate(key.slice.length).await?;
        let written = self.trunk.write(&loc, payload).await?;
        if written == 0 {
            return Err(SliceStoreError::Io(Arc::new(std::io::Error::other(
                "trunk store accepted no bytes",
            ))));
        }

        let mut range = key.slice;
        range.length = written;
        let outcome = self.index.upsert(
            &key.block,
            SliceRecord {
                range,
                kind: SliceKind::Write,
                loc,
            },
        );

        Ok(UpdateResult {
            done_bytes: written,
            inc_alloc: outcome.inc_alloc,
        })
    }

    /// Reserves trunk space for the slice without a payload (`fallocate`).
    pub async fn allocate_slice(&self, key: &SliceKey) -> Result<UpdateResult, SliceStoreError> {
        self.check_slice(key)?;

        let loc = self.trunk.allocate(key.slice.length).await?;
        let outcome = self.index.upsert(
            &key.block,
            SliceRecord {
                range: key.slice,
                kind: SliceKind::Alloc,
                loc,
            },
        );

        Ok(UpdateResult {
            done_bytes: key.slice.length,
            inc_alloc: outcome.inc_alloc,
        })
    }

    /// Removes all slice content overlapping the key's range.
    pub fn delete_slices(&self, key: &SliceKey) -> Result<UpdateResult, SliceStoreError> {
        self.check_slice(key)?;

        let removed = self.index.delete_range(&key.block, &key.slice);
        if removed == 0 {
            return Err(SliceStoreError::NotFound(format!(
                "no slices within {key}"
            )));
        }
        Ok(UpdateResult {
            done_bytes: removed as u32,
            inc_alloc: -(removed as i64),
        })
    }

    /// Drops the whole block.
    pub fn delete_block(&self, key: &SliceKey) -> Result<UpdateResult, SliceStoreError> {
        let removed = self.index.delete_block(&key.block);
        if removed == 0 {
            return Err(SliceStoreError::NotFound(format!(
                "block not found, {}",
                key.block
            )));
        }
        Ok(UpdateResult {
            done_bytes: removed as u32,
            inc_alloc: -(removed as i64),
        })
    }

    /// Reads the requested range. The result covers the request up to the
    /// end of the last slice record intersecting it (a short read past
    /// that); interior holes and `Alloc` reservations read as zeros, as does
    /// a trunk extent the store reports missing.
    pub async fn read_slice(&self, key: &SliceKey) -> Result<Bytes, SliceStoreError> {
        self.check_slice(key)?;

        let records = self.index.get_slices(&key.block, &key.slice);
        let Some(last) = records.last() else {
            return Ok(Bytes::new());
        };

        let read_end = key.slice.end().min(last.range.end()).max(key.slice.offset);
        let mut buf = vec![0u8; (read_end - key.slice.offset) as usize];

        for rec in &records {
            if rec.kind != SliceKind::Write {
                continue;
            }
            let Some(inter) = rec.range.intersect(&key.slice) else {
                continue;
            };
            let skip = inter.offset - rec.range.offset;
            match self.trunk.read(&rec.loc, skip, inter.length).await {
                Ok(data) => {
                    let at = (inter.offset - key.slice.offset) as usize;
                    buf[at..at + data.len()].copy_from_slice(&data);
                }
                // A known slice the trunk cannot produce reads as zeros.
                Err(SliceStoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(Bytes::from(buf))
    }
}
