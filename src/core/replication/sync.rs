// src/core/replication/sync.rs

//! Catch-up streaming support: turning binlog records back into replica
//! RPC bodies a slave can apply.
//!
//! The binlog records metadata only, so for a write the current slice
//! content is read back from the engine. Replay order makes this safe: a
//! slice later overwritten or deleted replays with whatever bytes survive
//! today, and the later records fix the slave up exactly as they fixed up
//! the master.

use crate::core::SliceStoreError;
use crate::core::binlog::{BinlogOpType, BinlogRecord};
use crate::core::engine::SliceEngine;
use crate::core::protocol::commands::ReplicaRpcBody;
use crate::core::slice_index::SliceKey;
use bytes::{BufMut, Bytes, BytesMut};

/// Builds the replica RPC body for one catch-up record.
pub async fn load_replica_body(
    engine: &SliceEngine,
    record: BinlogRecord,
) -> Result<ReplicaRpcBody, SliceStoreError> {
    if record.op_type != BinlogOpType::WriteSlice {
        return Ok(ReplicaRpcBody {
            record,
            payload: Bytes::new(),
        });
    }

    let slice = record.slice.expect("write record carries a slice");
    let key = SliceKey {
        block: record.block,
        slice,
    };
    let data = match engine.read_slice(&key).await {
        Ok(data) => data,
        // The block is gone entirely; a later record deletes it again on
        // the slave, so zeros are as good as history.
        Err(SliceStoreError::NotFound(_)) => Bytes::new(),
        Err(e) => return Err(e),
    };

    // The wire format requires payload length == slice length; pad the
    // short read out with zeros.
    let payload = if data.len() == slice.length as usize {
        data
    } else {
        let mut padded = BytesMut::with_capacity(slice.length as usize);
        padded.put_slice(&data);
        padded.resize(slice.length as usize, 0);
        padded.freeze()
    };

    Ok(ReplicaRpcBody { record, payload })
}
