// tests/binlog_test.rs

//! Binlog writer/reader behavior: monotonic versions, rotation, tail
//! recovery after reopen, positioned reads, retention errors, and the
//! consistency check.

use slicestore::core::SliceStoreError;
use slicestore::core::binlog::{
    BinlogOpType, BinlogRecord, BinlogReader, BinlogSet, BinlogWriter, RecordSource,
    TextBinlogCodec,
};
use slicestore::core::slice_index::{BlockKey, SliceRange};
use std::path::Path;
use std::sync::Arc;

fn record(data_version: u64) -> BinlogRecord {
    BinlogRecord::slice_op(
        BinlogOpType::WriteSlice,
        RecordSource::Rpc,
        data_version,
        BlockKey {
            oid: data_version as i64,
            offset: 0,
        },
        SliceRange::new(0, 64),
    )
}

async fn open_writer(dir: &Path, rotate_size: u64) -> BinlogWriter {
    BinlogWriter::open(dir.to_path_buf(), rotate_size, Arc::new(TextBinlogCodec))
        .await
        .unwrap()
}

#[tokio::test]
async fn versions_are_strictly_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = open_writer(dir.path(), 1 << 20).await;

    writer.append(&record(1)).await.unwrap();
    writer.append(&record(2)).await.unwrap();
    assert_eq!(writer.durable_version(), 2);

    // A gap and a replay are both rejected.
    assert!(writer.append(&record(4)).await.is_err());
    assert!(writer.append(&record(2)).await.is_err());
    assert_eq!(writer.last_version(), 2);
}

#[tokio::test]
async fn reader_yields_everything_in_order() {
    let dir = tempfile::tempdir().unwrap();
    // A tiny rotate size so the log spans several files.
    let mut writer = open_writer(dir.path(), 512).await;
    for v in 1..=100 {
        writer.append(&record(v)).await.unwrap();
    }
    writer.close().await.unwrap();

    let mut reader = BinlogReader::open(dir.path().to_path_buf(), Arc::new(TextBinlogCodec), 0)
        .await
        .unwrap();
    let mut expected = 1u64;
    while let Some(rec) = reader.next_record().await.unwrap() {
        assert_eq!(rec.data_version, expected, "gap or reorder in the log");
        expected += 1;
    }
    assert_eq!(expected, 101);
}

#[tokio::test]
async fn reader_positions_at_requested_version() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = open_writer(dir.path(), 512).await;
    for v in 1..=100 {
        writer.append(&record(v)).await.unwrap();
    }
    writer.close().await.unwrap();

    let mut reader = BinlogReader::open(dir.path().to_path_buf(), Arc::new(TextBinlogCodec), 40)
        .await
        .unwrap();
    let first = reader.next_record().await.unwrap().unwrap();
    assert_eq!(first.data_version, 40);
}

#[tokio::test]
async fn pruned_history_reports_too_old() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = open_writer(dir.path(), 512).await;
    for v in 1..=100 {
        writer.append(&record(v)).await.unwrap();
    }
    writer.close().await.unwrap();

    // Simulate retention dropping the oldest file.
    std::fs::remove_file(dir.path().join("binlog.000001")).unwrap();

    let result = BinlogReader::open(dir.path().to_path_buf(), Arc::new(TextBinlogCodec), 1).await;
    assert!(matches!(
        result,
        Err(SliceStoreError::DataVersionTooOld { .. })
    ));
}

#[tokio::test]
async fn reopen_recovers_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut writer = open_writer(dir.path(), 1 << 20).await;
        for v in 1..=37 {
            writer.append(&record(v)).await.unwrap();
        }
        // No close: simulate a crash after the last flush.
    }

    let mut writer = open_writer(dir.path(), 1 << 20).await;
    assert_eq!(writer.last_version(), 37);
    writer.append(&record(38)).await.unwrap();
    assert_eq!(writer.durable_version(), 38);
}

#[tokio::test]
async fn binlog_set_tracks_groups_independently() {
    let dir = tempfile::tempdir().unwrap();
    let set = BinlogSet::new(dir.path(), 1 << 20, Arc::new(TextBinlogCodec));
    set.open_group(1).await.unwrap();
    set.open_group(2).await.unwrap();

    set.append(1, &record(1)).await.unwrap();
    set.append(1, &record(2)).await.unwrap();
    set.append(2, &record(1)).await.unwrap();

    assert_eq!(set.durable_version(1), 2);
    assert_eq!(set.durable_version(2), 1);
    assert_eq!(set.durable_version(9), 0);
}

#[tokio::test]
async fn consistency_check_finds_the_first_divergence() {
    let dir = tempfile::tempdir().unwrap();
    let set = BinlogSet::new(dir.path(), 1 << 20, Arc::new(TextBinlogCodec));
    set.open_group(1).await.unwrap();
    for v in 1..=20 {
        set.append(1, &record(v)).await.unwrap();
    }

    // A matching peer window reports no divergence.
    let lines = set.last_lines(1, 5).await.unwrap();
    assert_eq!(lines.len(), 5);
    let peer = lines.join("\n");
    assert_eq!(set.check_consistency(1, &peer).await.unwrap(), None);

    // Tamper with one record: same version, different block key.
    let mut tampered: Vec<String> = lines.clone();
    tampered[2] = tampered[2].replace(" 18 0 ", " 999 0 ");
    let first_bad = set
        .check_consistency(1, &tampered.join("\n"))
        .await
        .unwrap();
    assert_eq!(first_bad, Some(18));
}

#[tokio::test]
async fn last_lines_spans_file_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let set = BinlogSet::new(dir.path(), 256, Arc::new(TextBinlogCodec));
    set.open_group(1).await.unwrap();
    for v in 1..=50 {
        set.append(1, &record(v)).await.unwrap();
    }

    let lines = set.last_lines(1, 10).await.unwrap();
    assert_eq!(lines.len(), 10);
    let codec = TextBinlogCodec;
    use slicestore::core::binlog::BinlogCodec;
    let versions: Vec<u64> = lines
        .iter()
        .map(|l| codec.decode(l).unwrap().data_version)
        .collect();
    assert_eq!(versions, (41..=50).collect::<Vec<u64>>());
}
