// tests/slice_engine_test.rs

//! Engine-level scenarios: overlap splitting, hole semantics, deletes, and
//! read-after-write against a real file-backed trunk store.

use bytes::Bytes;
use slicestore::core::engine::{SliceEngine, TrunkFileStore};
use slicestore::core::slice_index::{BlockKey, SliceIndex, SliceKey, SliceRange, is_coherent};
use std::sync::Arc;
use tokio::sync::mpsc;

const BLOCK_SIZE: u32 = 4 * 1024 * 1024;

async fn engine() -> (SliceEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let (space_tx, _space_rx) = mpsc::unbounded_channel();
    let index = Arc::new(SliceIndex::new(space_tx));
    let trunk = Arc::new(TrunkFileStore::open(dir.path()).await.unwrap());
    (SliceEngine::new(index, trunk, BLOCK_SIZE), dir)
}

fn key(oid: i64, offset: u32, length: u32) -> SliceKey {
    SliceKey {
        block: BlockKey { oid, offset: 0 },
        slice: SliceRange { offset, length },
    }
}

#[tokio::test]
async fn overlapping_writes_split_and_read_back() {
    let (engine, _dir) = engine().await;

    let first = engine
        .write_slice(&key(1, 0, 100), &Bytes::from(vec![b'A'; 100]))
        .await
        .unwrap();
    assert_eq!(first.done_bytes, 100);
    assert_eq!(first.inc_alloc, 100);

    let second = engine
        .write_slice(&key(1, 50, 100), &Bytes::from(vec![b'B'; 100]))
        .await
        .unwrap();
    assert_eq!(second.done_bytes, 100);
    assert_eq!(second.inc_alloc, 50);

    // The read stops at the end of the last record (a short read).
    let data = engine.read_slice(&key(1, 0, 200)).await.unwrap();
    assert_eq!(data.len(), 150);
    assert_eq!(&data[..50], &vec![b'A'; 50][..]);
    assert_eq!(&data[50..150], &vec![b'B'; 100][..]);

    let slices = engine
        .index()
        .get_slices(&BlockKey { oid: 1, offset: 0 }, &SliceRange::new(0, 200));
    assert_eq!(slices.len(), 2);
    assert_eq!(slices[0].range, SliceRange::new(0, 50));
    assert_eq!(slices[1].range, SliceRange::new(50, 100));
    assert!(is_coherent(&slices));
}

#[tokio::test]
async fn allocate_reads_as_zeros() {
    let (engine, _dir) = engine().await;

    let result = engine.allocate_slice(&key(2, 0, 4096)).await.unwrap();
    assert_eq!(result.done_bytes, 4096);
    assert_eq!(result.inc_alloc, 4096);

    let data = engine.read_slice(&key(2, 0, 4096)).await.unwrap();
    assert_eq!(data.len(), 4096);
    assert!(data.iter().all(|&b| b == 0));

    // Allocating the same range again reserves nothing new.
    let again = engine.allocate_slice(&key(2, 0, 4096)).await.unwrap();
    assert_eq!(again.inc_alloc, 0);
}

#[tokio::test]
async fn delete_range_leaves_a_zero_hole() {
    let (engine, _dir) = engine().await;

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    engine
        .write_slice(&key(3, 0, 1000), &Bytes::from(payload.clone()))
        .await
        .unwrap();

    let deleted = engine.delete_slices(&key(3, 200, 400)).unwrap();
    assert_eq!(deleted.done_bytes, 400);
    assert_eq!(deleted.inc_alloc, -400);

    let data = engine.read_slice(&key(3, 0, 1000)).await.unwrap();
    assert_eq!(data.len(), 1000);
    assert_eq!(&data[..200], &payload[..200]);
    assert!(data[200..600].iter().all(|&b| b == 0));
    assert_eq!(&data[600..], &payload[600..]);
}

#[tokio::test]
async fn read_after_write_is_exact() {
    let (engine, _dir) = engine().await;

    let payload: Vec<u8> = (0..8192u32).map(|i| (i * 7 % 256) as u8).collect();
    engine
        .write_slice(&key(4, 128, 8192), &Bytes::from(payload.clone()))
        .await
        .unwrap();

    let data = engine.read_slice(&key(4, 128, 8192)).await.unwrap();
    assert_eq!(&data[..], &payload[..]);
}

#[tokio::test]
async fn unwritten_range_reads_short() {
    let (engine, _dir) = engine().await;
    let data = engine.read_slice(&key(5, 0, 4096)).await.unwrap();
    assert!(data.is_empty());
}

#[tokio::test]
async fn delete_block_frees_everything() {
    let (engine, _dir) = engine().await;

    engine
        .write_slice(&key(6, 0, 100), &Bytes::from(vec![1u8; 100]))
        .await
        .unwrap();
    engine
        .write_slice(&key(6, 500, 100), &Bytes::from(vec![2u8; 100]))
        .await
        .unwrap();

    let freed = engine.delete_block(&key(6, 0, 0)).unwrap();
    assert_eq!(freed.done_bytes, 200);
    assert_eq!(freed.inc_alloc, -200);

    assert!(engine.read_slice(&key(6, 0, 1000)).await.unwrap().is_empty());
    // A second delete has nothing to remove.
    assert!(engine.delete_block(&key(6, 0, 0)).is_err());
}

#[tokio::test]
async fn rejects_slices_crossing_the_block_boundary() {
    let (engine, _dir) = engine().await;
    let bad = key(7, BLOCK_SIZE - 10, 20);
    assert!(
        engine
            .write_slice(&bad, &Bytes::from(vec![0u8; 20]))
            .await
            .is_err()
    );
    assert!(engine.allocate_slice(&bad).await.is_err());
}
