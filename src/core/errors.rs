// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum SliceStoreError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Permission denied")]
    Permission,

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Request exceeds buffer: {0}")]
    Overflow(String),

    #[error("No server: {0}")]
    NoServer(String),

    #[error("Channel invalid: {0}")]
    ChannelInvalid(String),

    #[error("Data version {requested} too old, oldest retained is {oldest}")]
    DataVersionTooOld { requested: u64, oldest: u64 },

    #[error("Request still in flight, try again")]
    Again,

    #[error("Corrupt persisted state: {0}")]
    Corrupt(String),

    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Wire status codes carried in the response frame header. `0` is success;
/// everything else maps one-to-one onto an error kind so clients can drive
/// their retry policy from the header alone.
pub mod status {
    pub const OK: u16 = 0;
    pub const INVALID: u16 = 1;
    pub const NOT_FOUND: u16 = 2;
    pub const EXISTS: u16 = 3;
    pub const PERMISSION: u16 = 4;
    pub const BUSY: u16 = 5;
    pub const OVERFLOW: u16 = 6;
    pub const NO_SERVER: u16 = 7;
    pub const CHANNEL_INVALID: u16 = 8;
    pub const DATA_VERSION_TOO_OLD: u16 = 9;
    pub const AGAIN: u16 = 10;
    pub const CORRUPT: u16 = 11;
    pub const IO: u16 = 12;
    pub const SHUTTING_DOWN: u16 = 13;
}

impl SliceStoreError {
    /// Maps the error onto its wire status code.
    pub fn status_code(&self) -> u16 {
        match self {
            SliceStoreError::Io(_) => status::IO,
            SliceStoreError::Invalid(_) => status::INVALID,
            SliceStoreError::NotFound(_) => status::NOT_FOUND,
            SliceStoreError::Exists(_) => status::EXISTS,
            SliceStoreError::Permission => status::PERMISSION,
            SliceStoreError::Busy(_) => status::BUSY,
            SliceStoreError::Overflow(_) => status::OVERFLOW,
            SliceStoreError::NoServer(_) => status::NO_SERVER,
            SliceStoreError::ChannelInvalid(_) => status::CHANNEL_INVALID,
            SliceStoreError::DataVersionTooOld { .. } => status::DATA_VERSION_TOO_OLD,
            SliceStoreError::Again => status::AGAIN,
            SliceStoreError::Corrupt(_) => status::CORRUPT,
            SliceStoreError::ShuttingDown => status::SHUTTING_DOWN,
        }
    }

    /// True for errors the client library is expected to retry with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SliceStoreError::Busy(_)
                | SliceStoreError::NoServer(_)
                | SliceStoreError::ChannelInvalid(_)
                | SliceStoreError::Again
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for SliceStoreError {
    fn clone(&self) -> Self {
        match self {
            SliceStoreError::Io(e) => SliceStoreError::Io(Arc::clone(e)),
            SliceStoreError::Invalid(s) => SliceStoreError::Invalid(s.clone()),
            SliceStoreError::NotFound(s) => SliceStoreError::NotFound(s.clone()),
            SliceStoreError::Exists(s) => SliceStoreError::Exists(s.clone()),
            SliceStoreError::Permission => SliceStoreError::Permission,
            SliceStoreError::Busy(s) => SliceStoreError::Busy(s.clone()),
            SliceStoreError::Overflow(s) => SliceStoreError::Overflow(s.clone()),
            SliceStoreError::NoServer(s) => SliceStoreError::NoServer(s.clone()),
            SliceStoreError::ChannelInvalid(s) => SliceStoreError::ChannelInvalid(s.clone()),
            SliceStoreError::DataVersionTooOld { requested, oldest } => {
                SliceStoreError::DataVersionTooOld {
                    requested: *requested,
                    oldest: *oldest,
                }
            }
            SliceStoreError::Again => SliceStoreError::Again,
            SliceStoreError::Corrupt(s) => SliceStoreError::Corrupt(s.clone()),
            SliceStoreError::ShuttingDown => SliceStoreError::ShuttingDown,
        }
    }
}

impl PartialEq for SliceStoreError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SliceStoreError::Io(e1), SliceStoreError::Io(e2)) => e1.to_string() == e2.to_string(),
            (SliceStoreError::Invalid(s1), SliceStoreError::Invalid(s2)) => s1 == s2,
            (SliceStoreError::NotFound(s1), SliceStoreError::NotFound(s2)) => s1 == s2,
            (SliceStoreError::Exists(s1), SliceStoreError::Exists(s2)) => s1 == s2,
            (SliceStoreError::Busy(s1), SliceStoreError::Busy(s2)) => s1 == s2,
            (SliceStoreError::Overflow(s1), SliceStoreError::Overflow(s2)) => s1 == s2,
            (SliceStoreError::NoServer(s1), SliceStoreError::NoServer(s2)) => s1 == s2,
            (SliceStoreError::ChannelInvalid(s1), SliceStoreError::ChannelInvalid(s2)) => s1 == s2,
            (
                SliceStoreError::DataVersionTooOld {
                    requested: r1,
                    oldest: o1,
                },
                SliceStoreError::DataVersionTooOld {
                    requested: r2,
                    oldest: o2,
                },
            ) => r1 == r2 && o1 == o2,
            (SliceStoreError::Corrupt(s1), SliceStoreError::Corrupt(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for SliceStoreError {
    fn from(e: std::io::Error) -> Self {
        SliceStoreError::Io(Arc::new(e))
    }
}

impl From<ParseIntError> for SliceStoreError {
    fn from(e: ParseIntError) -> Self {
        SliceStoreError::Corrupt(format!("invalid integer field: {e}"))
    }
}

impl From<std::str::Utf8Error> for SliceStoreError {
    fn from(e: std::str::Utf8Error) -> Self {
        SliceStoreError::Corrupt(format!("invalid utf-8: {e}"))
    }
}
