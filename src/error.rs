// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the layered block store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Header/trailer magic, flag or layout checks failed
    InvalidFormat(&'static str),

    /// UUID linkage between consecutive layers broke
    ///
    /// Carries the (top-first) position of the layer whose UUID did not
    /// match its upper neighbour's parent UUID.
    ParentChainMismatch(usize),

    /// More than [`MAX_STACK_LAYERS`](crate::MAX_STACK_LAYERS) layers submitted
    TooManyLayers(usize),

    /// A user I/O was not sector-aligned (offset, length)
    Misaligned(u64, u64),

    /// The underlying file returned fewer bytes than required (expected, got)
    ShortRead(usize, usize),

    /// The underlying file accepted fewer bytes than required (expected, got)
    ShortWrite(usize, usize),

    /// Decompression failed
    Decompress,

    /// Block checksum did not match its stored value (expected, got)
    ChecksumMismatch(u32, u32),

    /// User tag exceeded the 256-byte field
    TagTooLong(usize),

    /// A write/seal/commit was requested on a read-only file
    NotWritable,

    /// The layer already carries a sealed trailer
    AlreadySealed,

    /// A deadline expired while the operation was suspended on I/O
    Timeout,

    /// The operation is not supported in the current configuration
    Unsupported(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LsmtError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
