// src/core/protocol/commands.rs

//! The table of command ids and the request/response body layouts.
//!
//! Bodies are packed big-endian with no padding. Every parser validates the
//! body length and reports a diagnostic the front-end copies into the error
//! response, so a client always learns *why* a frame was rejected.

use crate::core::SliceStoreError;
use crate::core::binlog::{BinlogOpType, BinlogRecord, RecordSource};
use crate::core::registry::ClusterStatRow;
use crate::core::slice_index::{BlockKey, SliceKey, SliceRange};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Command ids. Responses echo the id with the response bit
/// (`frame::RESPONSE_BIT`) set.
pub mod cmd {
    // Liveness / session
    pub const ACTIVE_TEST_REQ: u16 = 0x0001;
    pub const CLIENT_JOIN_REQ: u16 = 0x0011;
    pub const SERVICE_STAT_REQ: u16 = 0x0013;

    // Cluster lookups
    pub const CLUSTER_STAT_REQ: u16 = 0x0015;
    pub const DISK_SPACE_STAT_REQ: u16 = 0x0017;
    pub const GET_MASTER_REQ: u16 = 0x0019;
    pub const GET_LEADER_REQ: u16 = 0x001b;
    pub const GET_READABLE_SERVER_REQ: u16 = 0x001d;

    // Slice data plane
    pub const SLICE_WRITE_REQ: u16 = 0x0021;
    pub const SLICE_ALLOCATE_REQ: u16 = 0x0023;
    pub const SLICE_DELETE_REQ: u16 = 0x0025;
    pub const BLOCK_DELETE_REQ: u16 = 0x0027;
    pub const SLICE_READ_REQ: u16 = 0x0029;

    // Idempotency channels
    pub const SETUP_CHANNEL_REQ: u16 = 0x0031;
    pub const CLOSE_CHANNEL_REQ: u16 = 0x0033;
    pub const REBIND_CHANNEL_REQ: u16 = 0x0035;
    pub const REPORT_REQ_RECEIPT_REQ: u16 = 0x0037;

    // Replica port
    pub const REPLICA_ACTIVE_TEST_REQ: u16 = 0x0101;
    pub const REPLICA_RPC_REQ: u16 = 0x0103;
    pub const REPLICA_ACK: u16 = 0x0105;
    pub const RESYNC_REQ: u16 = 0x0107;
    pub const CONSISTENCY_CHECK_REQ: u16 = 0x0109;
}

/// Human name for diagnostics and logs; unknown ids print in hex.
pub fn cmd_name(command: u16) -> String {
    match command {
        cmd::ACTIVE_TEST_REQ => "ACTIVE_TEST".into(),
        cmd::CLIENT_JOIN_REQ => "CLIENT_JOIN".into(),
        cmd::SERVICE_STAT_REQ => "SERVICE_STAT".into(),
        cmd::CLUSTER_STAT_REQ => "CLUSTER_STAT".into(),
        cmd::DISK_SPACE_STAT_REQ => "DISK_SPACE_STAT".into(),
        cmd::GET_MASTER_REQ => "GET_MASTER".into(),
        cmd::GET_LEADER_REQ => "GET_LEADER".into(),
        cmd::GET_READABLE_SERVER_REQ => "GET_READABLE_SERVER".into(),
        cmd::SLICE_WRITE_REQ => "SLICE_WRITE".into(),
        cmd::SLICE_ALLOCATE_REQ => "SLICE_ALLOCATE".into(),
        cmd::SLICE_DELETE_REQ => "SLICE_DELETE".into(),
        cmd::BLOCK_DELETE_REQ => "BLOCK_DELETE".into(),
        cmd::SLICE_READ_REQ => "SLICE_READ".into(),
        cmd::SETUP_CHANNEL_REQ => "SETUP_CHANNEL".into(),
        cmd::CLOSE_CHANNEL_REQ => "CLOSE_CHANNEL".into(),
        cmd::REBIND_CHANNEL_REQ => "REBIND_CHANNEL".into(),
        cmd::REPORT_REQ_RECEIPT_REQ => "REPORT_REQ_RECEIPT".into(),
        cmd::REPLICA_ACTIVE_TEST_REQ => "REPLICA_ACTIVE_TEST".into(),
        cmd::REPLICA_RPC_REQ => "REPLICA_RPC".into(),
        cmd::REPLICA_ACK => "REPLICA_ACK".into(),
        cmd::RESYNC_REQ => "RESYNC".into(),
        cmd::CONSISTENCY_CHECK_REQ => "CONSISTENCY_CHECK".into(),
        other => format!("0x{other:04x}"),
    }
}

/// Set in `CLIENT_JOIN` flags when the client wants to bind an existing
/// idempotency channel to this connection.
pub const JOIN_FLAG_IDEMPOTENCY: u32 = 0x1;

/// The block-slice key layout shared by all slice commands: 24 bytes
/// `{oid: i64, block_offset: i64, slice_offset: u32, slice_length: u32}`.
pub const BLOCK_SLICE_KEY_LEN: usize = 24;

/// The `(channel_id, req_id)` prefix user-channel sessions prepend to
/// mutating request bodies.
pub const IDEMPOTENCY_PREFIX_LEN: usize = 12;

fn expect_len(body: &Bytes, expected: usize, what: &str) -> Result<(), SliceStoreError> {
    if body.len() != expected {
        return Err(SliceStoreError::Invalid(format!(
            "{what}: body length {} != expected {expected}",
            body.len()
        )));
    }
    Ok(())
}

fn expect_min_len(body: &Bytes, minimum: usize, what: &str) -> Result<(), SliceStoreError> {
    if body.len() < minimum {
        return Err(SliceStoreError::Invalid(format!(
            "{what}: body length {} < minimum {minimum}",
            body.len()
        )));
    }
    Ok(())
}

// --- session commands ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientJoinReq {
    pub data_group_count: u32,
    pub file_block_size: u32,
    pub flags: u32,
    pub channel_id: u32,
    pub key: u32,
}

impl ClientJoinReq {
    pub const LEN: usize = 20;

    pub fn parse(body: &Bytes) -> Result<Self, SliceStoreError> {
        expect_len(body, Self::LEN, "CLIENT_JOIN")?;
        let mut buf = body.clone();
        Ok(Self {
            data_group_count: buf.get_u32(),
            file_block_size: buf.get_u32(),
            flags: buf.get_u32(),
            channel_id: buf.get_u32(),
            key: buf.get_u32(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.data_group_count);
        buf.put_u32(self.file_block_size);
        buf.put_u32(self.flags);
        buf.put_u32(self.channel_id);
        buf.put_u32(self.key);
        buf.freeze()
    }
}

pub fn encode_client_join_resp(buffer_size: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(buffer_size);
    buf.freeze()
}

pub fn parse_client_join_resp(body: &Bytes) -> Result<u32, SliceStoreError> {
    expect_len(body, 4, "CLIENT_JOIN response")?;
    Ok(body.clone().get_u32())
}

/// `SERVICE_STAT` response: `{is_leader: u8, server_id: u32, conn_current:
/// u32, conn_max: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatResp {
    pub is_leader: bool,
    pub server_id: u32,
    pub conn_current: u32,
    pub conn_max: u32,
}

impl ServiceStatResp {
    pub const LEN: usize = 13;

    pub fn parse(body: &Bytes) -> Result<Self, SliceStoreError> {
        expect_len(body, Self::LEN, "SERVICE_STAT response")?;
        let mut buf = body.clone();
        Ok(Self {
            is_leader: buf.get_u8() != 0,
            server_id: buf.get_u32(),
            conn_current: buf.get_u32(),
            conn_max: buf.get_u32(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(self.is_leader as u8);
        buf.put_u32(self.server_id);
        buf.put_u32(self.conn_current);
        buf.put_u32(self.conn_max);
        buf.freeze()
    }
}

// --- slice commands ---

/// The `(channel_id, req_id)` idempotency prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyPrefix {
    pub channel_id: u32,
    pub req_id: u64,
}

impl IdempotencyPrefix {
    /// Splits the prefix off the front of a mutating request body.
    pub fn strip(body: &Bytes) -> Result<(Self, Bytes), SliceStoreError> {
        expect_min_len(body, IDEMPOTENCY_PREFIX_LEN, "idempotency prefix")?;
        let mut buf = body.clone();
        let prefix = Self {
            channel_id: buf.get_u32(),
            req_id: buf.get_u64(),
        };
        Ok((prefix, body.slice(IDEMPOTENCY_PREFIX_LEN..)))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(IDEMPOTENCY_PREFIX_LEN);
        buf.put_u32(self.channel_id);
        buf.put_u64(self.req_id);
        buf.freeze()
    }
}

pub fn parse_block_slice_key(buf: &mut impl Buf) -> SliceKey {
    SliceKey {
        block: BlockKey {
            oid: buf.get_i64(),
            offset: buf.get_i64(),
        },
        slice: SliceRange {
            offset: buf.get_u32(),
            length: buf.get_u32(),
        },
    }
}

pub fn put_block_slice_key(buf: &mut BytesMut, key: &SliceKey) {
    buf.put_i64(key.block.oid);
    buf.put_i64(key.block.offset);
    buf.put_u32(key.slice.offset);
    buf.put_u32(key.slice.length);
}

/// Parses a slice-keyed request body. `SLICE_WRITE` carries the payload
/// after the key; everything else must be exactly the key.
pub fn parse_slice_request(
    body: &Bytes,
    with_payload: bool,
) -> Result<(SliceKey, Bytes), SliceStoreError> {
    expect_min_len(body, BLOCK_SLICE_KEY_LEN, "slice request")?;
    let mut buf = body.clone();
    let key = parse_block_slice_key(&mut buf);
    let payload = body.slice(BLOCK_SLICE_KEY_LEN..);

    if with_payload {
        if payload.len() != key.slice.length as usize {
            return Err(SliceStoreError::Invalid(format!(
                "slice write: payload length {} != slice length {}",
                payload.len(),
                key.slice.length
            )));
        }
    } else if !payload.is_empty() {
        return Err(SliceStoreError::Invalid(format!(
            "slice request: body length {} != expected {BLOCK_SLICE_KEY_LEN}",
            body.len()
        )));
    }
    Ok((key, payload))
}

pub fn encode_slice_request(key: &SliceKey, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(BLOCK_SLICE_KEY_LEN + payload.len());
    put_block_slice_key(&mut buf, key);
    buf.put_slice(payload);
    buf.freeze()
}

/// The shared mutation response: `{done_bytes: i32, inc_alloc: i32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceUpdateResp {
    pub done_bytes: i32,
    pub inc_alloc: i32,
}

impl SliceUpdateResp {
    pub const LEN: usize = 8;

    pub fn parse(body: &Bytes) -> Result<Self, SliceStoreError> {
        expect_len(body, Self::LEN, "slice update response")?;
        let mut buf = body.clone();
        Ok(Self {
            done_bytes: buf.get_i32(),
            inc_alloc: buf.get_i32(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_i32(self.done_bytes);
        buf.put_i32(self.inc_alloc);
        buf.freeze()
    }
}

// --- cluster lookups ---

pub fn parse_group_id(body: &Bytes, what: &str) -> Result<u32, SliceStoreError> {
    expect_len(body, 4, what)?;
    Ok(body.clone().get_u32())
}

pub fn encode_group_id(group_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(group_id);
    buf.freeze()
}

/// `{server_id: u32, ip: 16 bytes, port: u16}` — the reply shape of
/// `GET_MASTER`, `GET_LEADER` and `GET_READABLE_SERVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddrResp {
    pub server_id: u32,
    pub host: String,
    pub port: u16,
}

impl ServerAddrResp {
    pub const LEN: usize = 22;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.server_id);
        let mut ip = [0u8; 16];
        let raw = self.host.as_bytes();
        let n = raw.len().min(15);
        ip[..n].copy_from_slice(&raw[..n]);
        buf.put_slice(&ip);
        buf.put_u16(self.port);
        buf.freeze()
    }

    pub fn parse(body: &Bytes) -> Result<Self, SliceStoreError> {
        expect_len(body, Self::LEN, "server address response")?;
        let mut buf = body.clone();
        let server_id = buf.get_u32();
        let mut ip = [0u8; 16];
        buf.copy_to_slice(&mut ip);
        let end = ip.iter().position(|&b| b == 0).unwrap_or(16);
        let host = std::str::from_utf8(&ip[..end])?.to_string();
        Ok(Self {
            server_id,
            host,
            port: buf.get_u16(),
        })
    }
}

/// One `CLUSTER_STAT` entry:
/// `{group_id, server_id, ip, port, is_preseted, is_master, status, data_version}`.
const CLUSTER_STAT_ROW_LEN: usize = 4 + 4 + 16 + 2 + 1 + 1 + 1 + 8;

pub fn encode_cluster_stat_resp(rows: &[(ClusterStatRow, String, u16)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + rows.len() * CLUSTER_STAT_ROW_LEN);
    buf.put_u32(rows.len() as u32);
    for (row, host, port) in rows {
        buf.put_u32(row.group_id);
        buf.put_u32(row.server_id);
        let mut ip = [0u8; 16];
        let raw = host.as_bytes();
        let n = raw.len().min(15);
        ip[..n].copy_from_slice(&raw[..n]);
        buf.put_slice(&ip);
        buf.put_u16(*port);
        buf.put_u8(row.is_preseted as u8);
        buf.put_u8(row.is_master as u8);
        buf.put_u8(row.status as u8);
        buf.put_u64(row.data_version);
    }
    buf.freeze()
}

/// A parsed `CLUSTER_STAT` entry, as seen by clients and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatEntry {
    pub group_id: u32,
    pub server_id: u32,
    pub host: String,
    pub port: u16,
    pub is_preseted: bool,
    pub is_master: bool,
    pub status: u8,
    pub data_version: u64,
}

pub fn parse_cluster_stat_resp(body: &Bytes) -> Result<Vec<ClusterStatEntry>, SliceStoreError> {
    expect_min_len(body, 4, "CLUSTER_STAT response")?;
    let mut buf = body.clone();
    let count = buf.get_u32() as usize;
    expect_len(
        body,
        4 + count * CLUSTER_STAT_ROW_LEN,
        "CLUSTER_STAT response",
    )?;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let group_id = buf.get_u32();
        let server_id = buf.get_u32();
        let mut ip = [0u8; 16];
        buf.copy_to_slice(&mut ip);
        let end = ip.iter().position(|&b| b == 0).unwrap_or(16);
        let host = std::str::from_utf8(&ip[..end])?.to_string();
        entries.push(ClusterStatEntry {
            group_id,
            server_id,
            host,
            port: buf.get_u16(),
            is_preseted: buf.get_u8() != 0,
            is_master: buf.get_u8() != 0,
            status: buf.get_u8(),
            data_version: buf.get_u64(),
        });
    }
    Ok(entries)
}

pub fn encode_disk_space_resp(total: u64, used: u64, avail: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(24);
    buf.put_u64(total);
    buf.put_u64(used);
    buf.put_u64(avail);
    buf.freeze()
}

// --- channel commands ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelIdKey {
    pub channel_id: u32,
    pub key: u32,
}

impl ChannelIdKey {
    pub const LEN: usize = 8;

    pub fn parse(body: &Bytes, what: &str) -> Result<Self, SliceStoreError> {
        expect_len(body, Self::LEN, what)?;
        let mut buf = body.clone();
        Ok(Self {
            channel_id: buf.get_u32(),
            key: buf.get_u32(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.channel_id);
        buf.put_u32(self.key);
        buf.freeze()
    }
}

/// `REPORT_REQ_RECEIPT` body: `{count: u32}` then `count` request ids.
pub fn parse_report_receipt_req(body: &Bytes) -> Result<Vec<u64>, SliceStoreError> {
    expect_min_len(body, 4, "REPORT_REQ_RECEIPT")?;
    let mut buf = body.clone();
    let count = buf.get_u32() as usize;
    let calculated = 4 + count * 8;
    if body.len() != calculated {
        return Err(SliceStoreError::Invalid(format!(
            "REPORT_REQ_RECEIPT: body length {} != calculated {calculated}",
            body.len()
        )));
    }
    Ok((0..count).map(|_| buf.get_u64()).collect())
}

pub fn encode_report_receipt_req(req_ids: &[u64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + req_ids.len() * 8);
    buf.put_u32(req_ids.len() as u32);
    for id in req_ids {
        buf.put_u64(*id);
    }
    buf.freeze()
}

// --- replica port ---

/// A replicated mutation: the binlog record plus, for writes, the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRpcBody {
    pub record: BinlogRecord,
    pub payload: Bytes,
}

impl ReplicaRpcBody {
    const FIXED_LEN: usize = 8 + 8 + 1 + 1 + 16 + 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_LEN + self.payload.len());
        buf.put_u64(self.record.data_version);
        buf.put_i64(self.record.timestamp);
        buf.put_u8(self.record.source.as_code());
        buf.put_u8(self.record.op_type.as_code());
        buf.put_i64(self.record.block.oid);
        buf.put_i64(self.record.block.offset);
        let slice = self.record.slice.unwrap_or(SliceRange {
            offset: 0,
            length: 0,
        });
        buf.put_u32(slice.offset);
        buf.put_u32(slice.length);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn parse(body: &Bytes) -> Result<Self, SliceStoreError> {
        expect_min_len(body, Self::FIXED_LEN, "REPLICA_RPC")?;
        let mut buf = body.clone();
        let data_version = buf.get_u64();
        let timestamp = buf.get_i64();
        let source = RecordSource::from_code(buf.get_u8())?;
        let op_type = BinlogOpType::from_code(buf.get_u8())?;
        let block = BlockKey {
            oid: buf.get_i64(),
            offset: buf.get_i64(),
        };
        let slice_offset = buf.get_u32();
        let slice_length = buf.get_u32();
        let payload = body.slice(Self::FIXED_LEN..);

        let slice = op_type
            .has_slice()
            .then_some(SliceRange::new(slice_offset, slice_length));
        if op_type == BinlogOpType::WriteSlice && payload.len() != slice_length as usize {
            return Err(SliceStoreError::Invalid(format!(
                "REPLICA_RPC: payload length {} != slice length {slice_length}",
                payload.len()
            )));
        }

        Ok(Self {
            record: BinlogRecord {
                timestamp,
                data_version,
                source,
                op_type,
                block,
                slice,
            },
            payload,
        })
    }
}

pub fn encode_replica_ack(data_version: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(data_version);
    buf.freeze()
}

pub fn parse_replica_ack(body: &Bytes) -> Result<u64, SliceStoreError> {
    expect_len(body, 8, "REPLICA_ACK")?;
    Ok(body.clone().get_u64())
}

/// `RESYNC` request: `{group_id: u32, server_id: u32, start_version: u64}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncReq {
    pub group_id: u32,
    pub server_id: u32,
    pub start_version: u64,
}

impl ResyncReq {
    pub const LEN: usize = 16;

    pub fn parse(body: &Bytes) -> Result<Self, SliceStoreError> {
        expect_len(body, Self::LEN, "RESYNC")?;
        let mut buf = body.clone();
        Ok(Self {
            group_id: buf.get_u32(),
            server_id: buf.get_u32(),
            start_version: buf.get_u64(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.group_id);
        buf.put_u32(self.server_id);
        buf.put_u64(self.start_version);
        buf.freeze()
    }
}

/// `RESYNC` response: the master's durable data version at the handshake;
/// the slave is caught up once its own version reaches it.
pub fn encode_resync_resp(durable_version: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(durable_version);
    buf.freeze()
}

pub fn parse_resync_resp(body: &Bytes) -> Result<u64, SliceStoreError> {
    expect_len(body, 8, "RESYNC response")?;
    Ok(body.clone().get_u64())
}

/// `CONSISTENCY_CHECK` response: the first unmatched data version, `0` when
/// every peer record matched.
pub fn encode_consistency_check_resp(first_unmatched: Option<u64>) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(first_unmatched.unwrap_or(0));
    buf.freeze()
}

pub fn parse_consistency_check_resp(body: &Bytes) -> Result<Option<u64>, SliceStoreError> {
    expect_len(body, 8, "CONSISTENCY_CHECK response")?;
    let version = body.clone().get_u64();
    Ok((version != 0).then_some(version))
}

/// `CONSISTENCY_CHECK` request: `{group_id: u32}` then the peer's trailing
/// record lines as text.
pub fn encode_consistency_check_req(group_id: u32, lines: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + lines.len());
    buf.put_u32(group_id);
    buf.put_slice(lines.as_bytes());
    buf.freeze()
}

pub fn parse_consistency_check_req(body: &Bytes) -> Result<(u32, String), SliceStoreError> {
    expect_min_len(body, 4, "CONSISTENCY_CHECK")?;
    let mut buf = body.clone();
    let group_id = buf.get_u32();
    let lines = std::str::from_utf8(&body[4..])?.to_string();
    Ok((group_id, lines))
}
