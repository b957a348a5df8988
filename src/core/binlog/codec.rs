// src/core/binlog/codec.rs

//! Binlog line encoding. The textual format is retained for operator
//! friendliness (`grep` over a group's log is a supported debugging tool),
//! but everything goes through the `BinlogCodec` trait so a binary format
//! can be slotted in later without touching the writer or reader.

use super::record::{BinlogOpType, BinlogRecord, RecordSource};
use crate::core::SliceStoreError;
use crate::core::slice_index::{BlockKey, SliceRange};

/// Encodes records to single lines and back.
pub trait BinlogCodec: Send + Sync {
    /// Appends the encoded record, including the trailing newline.
    fn encode(&self, record: &BinlogRecord, out: &mut Vec<u8>);

    /// Decodes one line (without the newline).
    fn decode(&self, line: &str) -> Result<BinlogRecord, SliceStoreError>;
}

/// The default space-separated decimal format:
/// `timestamp data_version source op_type oid block_offset [slice_offset slice_length]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextBinlogCodec;

impl TextBinlogCodec {
    fn push_field(out: &mut Vec<u8>, value: impl itoa::Integer) {
        let mut buf = itoa::Buffer::new();
        out.extend_from_slice(buf.format(value).as_bytes());
    }
}

impl BinlogCodec for TextBinlogCodec {
    fn encode(&self, record: &BinlogRecord, out: &mut Vec<u8>) {
        Self::push_field(out, record.timestamp);
        out.push(b' ');
        Self::push_field(out, record.data_version);
        out.push(b' ');
        Self::push_field(out, record.source.as_code());
        out.push(b' ');
        Self::push_field(out, record.op_type.as_code());
        out.push(b' ');
        Self::push_field(out, record.block.oid);
        out.push(b' ');
        Self::push_field(out, record.block.offset);
        if let Some(slice) = &record.slice {
            out.push(b' ');
            Self::push_field(out, slice.offset);
            out.push(b' ');
            Self::push_field(out, slice.length);
        }
        out.push(b'\n');
    }

    fn decode(&self, line: &str) -> Result<BinlogRecord, SliceStoreError> {
        let mut fields = line.split_ascii_whitespace();
        let mut next = |name: &str| {
            fields
                .next()
                .ok_or_else(|| SliceStoreError::Corrupt(format!("binlog line missing {name}")))
        };

        let timestamp: i64 = next("timestamp")?.parse()?;
        let data_version: u64 = next("data_version")?.parse()?;
        let source = RecordSource::from_code(next("source")?.parse()?)?;
        let op_type = BinlogOpType::from_code(next("op_type")?.parse()?)?;
        let oid: i64 = next("oid")?.parse()?;
        let block_offset: i64 = next("block_offset")?.parse()?;

        let slice = if op_type.has_slice() {
            let offset: u32 = next("slice_offset")?.parse()?;
            let length: u32 = next("slice_length")?.parse()?;
            Some(SliceRange::new(offset, length))
        } else {
            None
        };

        if fields.next().is_some() {
            return Err(SliceStoreError::Corrupt(format!(
                "binlog line has trailing fields: {line}"
            )));
        }

        Ok(BinlogRecord {
            timestamp,
            data_version,
            source,
            op_type,
            block: BlockKey {
                oid,
                offset: block_offset,
            },
            slice,
        })
    }
}
