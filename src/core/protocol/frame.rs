// src/core/protocol/frame.rs

//! Implements the framed request/response wire format and the corresponding
//! `Encoder` and `Decoder` for network communication.
//!
//! Every frame starts with a fixed 16-byte header; all integers on the wire
//! are big-endian. Responses echo the request command with the response bit
//! set and carry the status code in the header. Non-success responses put a
//! short diagnostic message in the body.

use crate::core::SliceStoreError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The fixed size of the frame header in bytes.
pub const HEADER_LEN: usize = 16;

// Protocol-level limit to prevent denial-of-service from malformed frames.
// Slice payloads are bounded by the block size, which is far below this.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Set on the `cmd` field of every response frame.
pub const RESPONSE_BIT: u16 = 0x8000;

/// The fixed header prefixing every frame:
/// `{cmd: u16, status: u16, body_len: u32, flags: u32, reserved: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub cmd: u16,
    pub status: u16,
    pub body_len: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl FrameHeader {
    /// A request header with no status and no flags.
    pub fn request(cmd: u16, body_len: u32) -> Self {
        Self {
            cmd,
            status: 0,
            body_len,
            flags: 0,
            reserved: 0,
        }
    }

    /// A response header echoing `req_cmd` with the response bit set.
    pub fn response(req_cmd: u16, status: u16, body_len: u32) -> Self {
        Self {
            cmd: req_cmd | RESPONSE_BIT,
            status,
            body_len,
            flags: 0,
            reserved: 0,
        }
    }

    pub fn is_response(&self) -> bool {
        self.cmd & RESPONSE_BIT != 0
    }

    /// The request command this frame carries or responds to.
    pub fn base_cmd(&self) -> u16 {
        self.cmd & !RESPONSE_BIT
    }
}

/// A single decoded frame: the header plus its (possibly empty) body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn request(cmd: u16, body: Bytes) -> Self {
        Self {
            header: FrameHeader::request(cmd, body.len() as u32),
            body,
        }
    }

    pub fn response(req_cmd: u16, status: u16, body: Bytes) -> Self {
        Self {
            header: FrameHeader::response(req_cmd, status, body.len() as u32),
            body,
        }
    }

    /// Builds an error response whose body is the diagnostic message.
    pub fn error_response(req_cmd: u16, err: &SliceStoreError) -> Self {
        Self::response(req_cmd, err.status_code(), Bytes::from(err.to_string()))
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `Frame`s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = SliceStoreError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        debug_assert_eq!(item.header.body_len as usize, item.body.len());
        dst.reserve(HEADER_LEN + item.body.len());
        dst.put_u16(item.header.cmd);
        dst.put_u16(item.header.status);
        dst.put_u32(item.body.len() as u32);
        dst.put_u32(item.header.flags);
        dst.put_u32(item.header.reserved);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SliceStoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(SliceStoreError::Overflow(format!(
                "frame body length {body_len} exceeds the {MAX_BODY_LEN} byte limit"
            )));
        }
        if src.len() < HEADER_LEN + body_len {
            // Reserve so the next read can complete the frame in one pass.
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        let cmd = src.get_u16();
        let status = src.get_u16();
        let body_len = src.get_u32();
        let flags = src.get_u32();
        let reserved = src.get_u32();
        let body = src.split_to(body_len as usize).freeze();

        Ok(Some(Frame {
            header: FrameHeader {
                cmd,
                status,
                body_len,
                flags,
                reserved,
            },
            body,
        }))
    }
}
