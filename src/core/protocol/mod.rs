// src/core/protocol/mod.rs

pub mod commands;
pub mod frame;

pub use commands::cmd;
pub use frame::{Frame, FrameCodec, FrameHeader, HEADER_LEN};
