// tests/property_test.rs

//! Property-based tests for the slice index: after any operation sequence
//! the per-block slice set stays sorted and non-overlapping, and every
//! byte is owned by the latest write that covered it.

use proptest::prelude::*;
use slicestore::core::slice_index::{
    BlockKey, SliceIndex, SliceKind, SliceRange, SliceRecord, TrunkLoc, is_coherent,
};
use std::collections::HashMap;
use tokio::sync::mpsc;

const BLOCK: BlockKey = BlockKey { oid: 9, offset: 0 };
const SPACE: u32 = 4096;

#[derive(Debug, Clone)]
enum Op {
    Upsert { offset: u32, length: u32 },
    DeleteRange { offset: u32, length: u32 },
    DeleteBlock,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => (0..SPACE, 1..512u32).prop_map(|(offset, length)| Op::Upsert {
            offset,
            length: length.min(SPACE - offset).max(1),
        }),
        3 => (0..SPACE, 1..1024u32).prop_map(|(offset, length)| Op::DeleteRange {
            offset,
            length: length.min(SPACE - offset).max(1),
        }),
        1 => Just(Op::DeleteBlock),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn slice_sets_stay_coherent(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let (space_tx, _space_rx) = mpsc::unbounded_channel();
        let index = SliceIndex::new(space_tx);

        // Model: byte -> id of the op that owns it. Each upsert gets a
        // unique trunk id so ownership is checkable through `TrunkLoc`.
        let mut model: HashMap<u32, u64> = HashMap::new();

        for (op_id, op) in ops.iter().enumerate() {
            let op_id = op_id as u64 + 1;
            match *op {
                Op::Upsert { offset, length } => {
                    index.upsert(&BLOCK, SliceRecord {
                        range: SliceRange::new(offset, length),
                        kind: SliceKind::Write,
                        loc: TrunkLoc { trunk_id: op_id, inner_offset: offset as u64 },
                    });
                    for byte in offset..offset + length {
                        model.insert(byte, op_id);
                    }
                }
                Op::DeleteRange { offset, length } => {
                    index.delete_range(&BLOCK, &SliceRange::new(offset, length));
                    for byte in offset..offset + length {
                        model.remove(&byte);
                    }
                }
                Op::DeleteBlock => {
                    index.delete_block(&BLOCK);
                    model.clear();
                }
            }

            let records = index.get_slices(&BLOCK, &SliceRange::new(0, SPACE));
            prop_assert!(is_coherent(&records), "overlap after op {op_id}: {records:?}");

            // Coverage and ownership must match the model byte-for-byte.
            let mut covered: HashMap<u32, u64> = HashMap::new();
            for rec in &records {
                for byte in rec.range.offset..rec.range.end() {
                    let prev = covered.insert(byte, rec.loc.trunk_id);
                    prop_assert!(prev.is_none(), "byte {byte} covered twice");
                }
            }
            prop_assert_eq!(&covered, &model, "after op {}", op_id);

            // Trunk locations must still point at the bytes originally
            // written: `inner_offset` was seeded with the slice offset, so
            // the trim arithmetic must keep them in step.
            for rec in &records {
                prop_assert_eq!(
                    rec.loc.inner_offset,
                    rec.range.offset as u64,
                    "trunk location drifted for {:?}",
                    rec
                );
            }
        }

        // Final state: an empty model means the block entry is gone too.
        if model.is_empty() {
            prop_assert_eq!(index.block_count(), 0);
        }
    }
}
