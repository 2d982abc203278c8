// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    Error, Result,
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Block compression algorithm of a compressed layer file.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Algorithm {
    /// LZ4 block compression.
    ///
    /// Fast enough to decompress on the read path without dominating it.
    #[default]
    Lz4,
}

impl Algorithm {
    /// Compresses one block.
    pub(crate) fn compress(self, src: &[u8]) -> Vec<u8> {
        match self {
            Self::Lz4 => lz4_flex::compress(src),
        }
    }

    /// Decompresses one block into `dst`, returning the decompressed size.
    pub(crate) fn decompress(self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        match self {
            Self::Lz4 => lz4_flex::decompress_into(src, dst).map_err(|e| {
                log::error!("lz4 block decompression failed: {e}");
                Error::Decompress
            }),
        }
    }
}

impl Encode for Algorithm {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        match self {
            // tag 0 stays reserved for the legacy LZO slot
            Self::Lz4 => writer.write_u8(1)?,
        }
        Ok(())
    }
}

impl Decode for Algorithm {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        match tag {
            1 => Ok(Self::Lz4),
            tag => Err(DecodeError::InvalidTag(("Algorithm", tag))),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Lz4 => "lz4",
            }
        )
    }
}
