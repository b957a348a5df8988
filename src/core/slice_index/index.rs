// src/core/slice_index/index.rs

//! The sharded in-memory index from block keys to sorted slice sets.
//!
//! All mutations touching one block are serialized by the data-worker pool,
//! so the per-bucket locks here only arbitrate between blocks that share a
//! bucket and between mutators and readers on other tasks.

use super::{BlockKey, SliceKind, SliceRange, SliceRecord, SpaceDelta};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Number of independently locked buckets the block map is split across.
const SLICE_INDEX_BUCKETS: usize = 64;

/// The sorted slice set of a single block, keyed by slice offset.
/// Invariant: no two records share a byte.
type BlockSlices = BTreeMap<u32, SliceRecord>;

/// The result of an `upsert`: how many bytes of newly occupied space the
/// operation added. Zero when the range was already fully covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inc_alloc: i64,
}

/// The sharded block → slice-set map.
#[derive(Debug)]
pub struct SliceIndex {
    buckets: Vec<RwLock<HashMap<BlockKey, BlockSlices>>>,
    /// Freed trunk extents flow to the reclaimer through this channel.
    space_tx: mpsc::UnboundedSender<SpaceDelta>,
    block_count: AtomicUsize,
}

impl SliceIndex {
    pub fn new(space_tx: mpsc::UnboundedSender<SpaceDelta>) -> Self {
        Self {
            buckets: (0..SLICE_INDEX_BUCKETS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            space_tx,
            block_count: AtomicUsize::new(0),
        }
    }

    fn bucket(&self, block: &BlockKey) -> &RwLock<HashMap<BlockKey, BlockSlices>> {
        let mut hash = block.oid as u64;
        hash = hash.wrapping_mul(31).wrapping_add(block.offset as u64);
        &self.buckets[(hash % SLICE_INDEX_BUCKETS as u64) as usize]
    }

    /// Returns copies of all records intersecting `range`, in offset order,
    /// with their metadata unchanged (no clipping). Slice *data* is never
    /// copied here; records only point into the trunk store.
    pub fn get_slices(&self, block: &BlockKey, range: &SliceRange) -> Vec<SliceRecord> {
        let bucket = self.bucket(block).read();
        let Some(slices) = bucket.get(block) else {
            return Vec::new();
        };
        slices
            .range(..range.end())
            .map(|(_, rec)| *rec)
            .filter(|rec| rec.range.end() > range.offset)
            .collect()
    }

    /// Inserts `record`, splitting or trimming any existing record whose
    /// range overlaps. The new record wins for the overlap extent; existing
    /// bytes outside the overlap survive as trimmed records. Freed trunk
    /// extents are emitted to the reclaimer.
    pub fn upsert(&self, block: &BlockKey, record: SliceRecord) -> UpsertOutcome {
        let mut bucket = self.bucket(block).write();
        let slices = bucket.entry(*block).or_insert_with(|| {
            self.block_count.fetch_add(1, Ordering::Relaxed);
            BTreeMap::new()
        });

        let overlapped = Self::carve_range(slices, &record.range, &self.space_tx);
        slices.insert(record.range.offset, record);

        UpsertOutcome {
            inc_alloc: record.range.length as i64 - overlapped as i64,
        }
    }

    /// Removes all slice content overlapping `range`, splitting surviving
    /// parts. Returns the number of bytes actually removed.
    pub fn delete_range(&self, block: &BlockKey, range: &SliceRange) -> u64 {
        let mut bucket = self.bucket(block).write();
        let Some(slices) = bucket.get_mut(block) else {
            return 0;
        };

        let removed = Self::carve_range(slices, range, &self.space_tx);
        if slices.is_empty() {
            bucket.remove(block);
            self.block_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed as u64
    }

    /// Drops the whole block entry. Returns the number of bytes it held.
    pub fn delete_block(&self, block: &BlockKey) -> u64 {
        let mut bucket = self.bucket(block).write();
        let Some(slices) = bucket.remove(block) else {
            return 0;
        };
        self.block_count.fetch_sub(1, Ordering::Relaxed);

        let mut freed = 0u64;
        for rec in slices.values() {
            freed += rec.range.length as u64;
            let _ = self.space_tx.send(SpaceDelta {
                loc: rec.loc,
                freed_bytes: rec.range.length,
            });
        }
        freed
    }

    /// The number of blocks currently present.
    pub fn block_count(&self) -> usize {
        self.block_count.load(Ordering::Relaxed)
    }

    /// Cuts `range` out of the slice set: overlapping records are removed
    /// and their surviving left/right parts reinserted with adjusted trunk
    /// locations. Returns the total number of bytes cut, and reports each
    /// freed extent to the reclaimer.
    fn carve_range(
        slices: &mut BlockSlices,
        range: &SliceRange,
        space_tx: &mpsc::UnboundedSender<SpaceDelta>,
    ) -> u32 {
        let candidates: Vec<u32> = slices
            .range(..range.end())
            .filter(|(_, rec)| rec.range.end() > range.offset)
            .map(|(off, _)| *off)
            .collect();

        let mut cut = 0u32;
        for offset in candidates {
            let existing = slices.remove(&offset).expect("candidate offset present");
            let inter = existing
                .range
                .intersect(range)
                .expect("candidate must overlap");
            cut += inter.length;

            if existing.range.offset < range.offset {
                // Left part survives, trunk location unchanged.
                slices.insert(
                    existing.range.offset,
                    SliceRecord {
                        range: SliceRange::new(
                            existing.range.offset,
                            range.offset - existing.range.offset,
                        ),
                        kind: existing.kind,
                        loc: existing.loc,
                    },
                );
            }
            if existing.range.end() > range.end() {
                // Right part survives, trunk location advanced past the cut.
                let skip = range.end() - existing.range.offset;
                slices.insert(
                    range.end(),
                    SliceRecord {
                        range: SliceRange::new(range.end(), existing.range.end() - range.end()),
                        kind: existing.kind,
                        loc: existing.loc.advanced(skip),
                    },
                );
            }

            let freed_from = inter.offset - existing.range.offset;
            let _ = space_tx.send(SpaceDelta {
                loc: existing.loc.advanced(freed_from),
                freed_bytes: inter.length,
            });
        }
        cut
    }
}

/// Handy in tests: true when the records are sorted by offset and pairwise
/// non-overlapping.
pub fn is_coherent(records: &[SliceRecord]) -> bool {
    records
        .windows(2)
        .all(|w| w[0].range.end() <= w[1].range.offset)
}

#[cfg(test)]
mod tests {
    use super::super::TrunkLoc;
    use super::*;

    fn index() -> (SliceIndex, mpsc::UnboundedReceiver<SpaceDelta>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SliceIndex::new(tx), rx)
    }

    fn rec(offset: u32, length: u32, trunk_id: u64) -> SliceRecord {
        SliceRecord {
            range: SliceRange::new(offset, length),
            kind: SliceKind::Write,
            loc: TrunkLoc {
                trunk_id,
                inner_offset: 0,
            },
        }
    }

    const BLOCK: BlockKey = BlockKey { oid: 1, offset: 0 };

    #[test]
    fn overlapping_write_splits_the_older_record() {
        let (index, _rx) = index();
        index.upsert(&BLOCK, rec(0, 100, 1));
        let outcome = index.upsert(&BLOCK, rec(50, 100, 2));
        assert_eq!(outcome.inc_alloc, 50);

        let slices = index.get_slices(&BLOCK, &SliceRange::new(0, 200));
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].range, SliceRange::new(0, 50));
        assert_eq!(slices[0].loc.trunk_id, 1);
        assert_eq!(slices[1].range, SliceRange::new(50, 100));
        assert_eq!(slices[1].loc.trunk_id, 2);
        assert!(is_coherent(&slices));
    }

    #[test]
    fn covered_write_replaces_and_frees() {
        let (index, mut rx) = index();
        index.upsert(&BLOCK, rec(10, 20, 1));
        let outcome = index.upsert(&BLOCK, rec(0, 100, 2));
        assert_eq!(outcome.inc_alloc, 80);

        let slices = index.get_slices(&BLOCK, &SliceRange::new(0, 100));
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].loc.trunk_id, 2);

        let delta = rx.try_recv().unwrap();
        assert_eq!(delta.freed_bytes, 20);
        assert_eq!(delta.loc.trunk_id, 1);
    }

    #[test]
    fn interior_write_splits_into_three() {
        let (index, _rx) = index();
        index.upsert(&BLOCK, rec(0, 1000, 1));
        index.upsert(&BLOCK, rec(200, 400, 2));

        let slices = index.get_slices(&BLOCK, &SliceRange::new(0, 1000));
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].range, SliceRange::new(0, 200));
        assert_eq!(slices[1].range, SliceRange::new(200, 400));
        assert_eq!(slices[2].range, SliceRange::new(600, 400));
        // The surviving tail must point 600 bytes into the original extent.
        assert_eq!(slices[2].loc.inner_offset, 600);
        assert!(is_coherent(&slices));
    }

    #[test]
    fn delete_range_carves_a_hole() {
        let (index, _rx) = index();
        index.upsert(&BLOCK, rec(0, 1000, 1));
        let removed = index.delete_range(&BLOCK, &SliceRange::new(200, 400));
        assert_eq!(removed, 400);

        let slices = index.get_slices(&BLOCK, &SliceRange::new(0, 1000));
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].range, SliceRange::new(0, 200));
        assert_eq!(slices[1].range, SliceRange::new(600, 400));
    }

    #[test]
    fn block_disappears_with_its_last_slice() {
        let (index, _rx) = index();
        index.upsert(&BLOCK, rec(0, 100, 1));
        assert_eq!(index.block_count(), 1);
        index.delete_range(&BLOCK, &SliceRange::new(0, 100));
        assert_eq!(index.block_count(), 0);
        assert!(index.get_slices(&BLOCK, &SliceRange::new(0, 100)).is_empty());
    }

    #[test]
    fn realloc_over_allocated_range_adds_nothing() {
        let (index, _rx) = index();
        let alloc = SliceRecord {
            kind: SliceKind::Alloc,
            ..rec(0, 4096, 1)
        };
        assert_eq!(index.upsert(&BLOCK, alloc).inc_alloc, 4096);
        let again = SliceRecord {
            kind: SliceKind::Alloc,
            ..rec(0, 4096, 2)
        };
        assert_eq!(index.upsert(&BLOCK, again).inc_alloc, 0);
    }

    #[test]
    fn get_slices_ignores_disjoint_records() {
        let (index, _rx) = index();
        index.upsert(&BLOCK, rec(0, 100, 1));
        index.upsert(&BLOCK, rec(500, 100, 2));
        let slices = index.get_slices(&BLOCK, &SliceRange::new(100, 400));
        assert!(slices.is_empty());
    }
}
