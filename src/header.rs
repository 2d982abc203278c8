// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    fs::{read_exact_at, write_all_at, RandomAccessFile},
    Error, Result,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use uuid::Uuid;

/// 8-byte magic preamble of every framing block.
pub const MAGIC0: [u8; 8] = *b"LSMT\0\x01\x02\0";

/// 16-byte magic UUID following the preamble.
pub const MAGIC1: [u8; 16] = [
    0x65, 0x7e, 0x63, 0xd2, 0x94, 0x44, 0x08, 0x4c, 0xa2, 0xd2, 0xc8, 0xec, 0x4f, 0xcf, 0xae,
    0x8a,
];

const FLAG_HEADER: u32 = 1 << 0;
const FLAG_DATA_FILE: u32 = 1 << 1;
const FLAG_SEALED: u32 = 1 << 2;

const UUID_TEXT_LEN: usize = 37;
const ENCODED_FIELDS_LEN: u32 = 390;

const VERSION: u8 = 1;
const SUB_VERSION: u8 = 1;

/// The 4 KiB framing block heading (and, for sealed data files, trailing)
/// every layer file.
///
/// A header block carries the `HEADER` flag; the trailer of a sealed file
/// repeats the header fields and adds the index location. Bits beyond the
/// three defined flags are reserved and stay zero.
#[derive(Clone, Debug)]
pub struct HeaderTrailer {
    flags: u32,

    /// Byte offset of the index region.
    pub index_offset: u64,
    /// Number of (real) mapping records in the index region.
    pub index_size: u64,
    /// Virtual device size in bytes.
    pub virtual_size: u64,

    uuid: Option<Uuid>,
    parent_uuid: Option<Uuid>,

    /// Format version.
    pub version: u8,
    /// Format sub-version.
    pub sub_version: u8,

    user_tag: [u8; Self::TAG_SIZE],
}

impl HeaderTrailer {
    /// Size of the framing block in bytes.
    pub const SPACE: usize = 4096;

    /// Size of the user tag field in bytes.
    pub const TAG_SIZE: usize = 256;

    /// Creates a header-flagged block with zeroed index fields.
    #[must_use]
    pub fn new(uuid: Uuid, parent_uuid: Option<Uuid>) -> Self {
        Self {
            flags: FLAG_HEADER,
            index_offset: 0,
            index_size: 0,
            virtual_size: 0,
            uuid: Some(uuid),
            parent_uuid,
            version: VERSION,
            sub_version: SUB_VERSION,
            user_tag: [0; Self::TAG_SIZE],
        }
    }

    /// Whether the block is flagged as a header.
    #[must_use]
    pub fn is_header(&self) -> bool {
        self.flags & FLAG_HEADER != 0
    }

    /// Whether the block is flagged as a trailer.
    #[must_use]
    pub fn is_trailer(&self) -> bool {
        !self.is_header()
    }

    /// Whether the block belongs to a data file.
    #[must_use]
    pub fn is_data_file(&self) -> bool {
        self.flags & FLAG_DATA_FILE != 0
    }

    /// Whether the block belongs to an index file.
    #[must_use]
    pub fn is_index_file(&self) -> bool {
        !self.is_data_file()
    }

    /// Whether the owning layer is sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    /// Marks the block as a header.
    pub fn set_header(&mut self) {
        self.flags |= FLAG_HEADER;
    }

    /// Marks the block as a trailer.
    pub fn set_trailer(&mut self) {
        self.flags &= !FLAG_HEADER;
    }

    /// Marks the block as belonging to a data file.
    pub fn set_data_file(&mut self) {
        self.flags |= FLAG_DATA_FILE;
    }

    /// Marks the block as belonging to an index file.
    pub fn set_index_file(&mut self) {
        self.flags &= !FLAG_DATA_FILE;
    }

    /// Marks the owning layer as sealed.
    pub fn set_sealed(&mut self) {
        self.flags |= FLAG_SEALED;
    }

    /// Marks the owning layer as unsealed.
    pub fn clear_sealed(&mut self) {
        self.flags &= !FLAG_SEALED;
    }

    /// The layer's UUID, if the stored text was valid.
    #[must_use]
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    /// The parent layer's UUID, if any.
    #[must_use]
    pub fn parent_uuid(&self) -> Option<Uuid> {
        self.parent_uuid
    }

    /// Sets the layer UUID.
    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = Some(uuid);
    }

    /// Sets the parent layer UUID.
    pub fn set_parent_uuid(&mut self, parent: Option<Uuid>) {
        self.parent_uuid = parent;
    }

    /// The user tag with trailing zero padding stripped.
    #[must_use]
    pub fn user_tag(&self) -> &[u8] {
        let end = self
            .user_tag
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |p| p + 1);
        &self.user_tag[..end]
    }

    /// Stores a user tag; anything longer than the field is rejected, and
    /// shorter payloads are zero-padded.
    pub fn set_user_tag(&mut self, tag: &[u8]) -> Result<()> {
        if tag.len() > Self::TAG_SIZE {
            log::error!("user tag too long ({} > {})", tag.len(), Self::TAG_SIZE);
            return Err(Error::TagTooLong(tag.len()));
        }
        self.user_tag = [0; Self::TAG_SIZE];
        self.user_tag[..tag.len()].copy_from_slice(tag);
        Ok(())
    }

    /// Verifies the flag matrix of a block read from a known position.
    pub(crate) fn expect(
        &self,
        header: bool,
        data_file: bool,
        sealed: Option<bool>,
    ) -> Result<()> {
        if self.is_header() != header {
            return Err(Error::InvalidFormat("header/trailer flag mismatch"));
        }
        if self.is_data_file() != data_file {
            return Err(Error::InvalidFormat("data/index file flag mismatch"));
        }
        if let Some(sealed) = sealed {
            if self.is_sealed() != sealed {
                return Err(if self.is_sealed() {
                    Error::AlreadySealed
                } else {
                    Error::InvalidFormat("sealed flag mismatch")
                });
            }
        }
        Ok(())
    }
}

fn write_uuid_text<W: Write>(writer: &mut W, uuid: Option<Uuid>) -> std::io::Result<()> {
    let mut text = [0u8; UUID_TEXT_LEN];
    if let Some(uuid) = uuid {
        let mut buf = [0u8; uuid::fmt::Hyphenated::LENGTH];
        let s = uuid.hyphenated().encode_lower(&mut buf);
        text[..s.len()].copy_from_slice(s.as_bytes());
    }
    writer.write_all(&text)
}

fn read_uuid_text<R: Read>(reader: &mut R) -> std::io::Result<Option<Uuid>> {
    let mut text = [0u8; UUID_TEXT_LEN];
    reader.read_exact(&mut text)?;
    Ok(parse_uuid_text(&text))
}

/// Parses a NUL-terminated UUID text field; `None` for null or garbled text.
#[must_use]
pub fn parse_uuid_text(bytes: &[u8]) -> Option<Uuid> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let text = std::str::from_utf8(bytes.get(..end)?).ok()?;
    Uuid::parse_str(text).ok()
}

/// Whether `text` is a well-formed UUID.
#[must_use]
pub fn is_valid_uuid(text: &str) -> bool {
    Uuid::parse_str(text).is_ok()
}

impl Encode for HeaderTrailer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        let mut block = Vec::with_capacity(Self::SPACE);

        block.write_all(&MAGIC0)?;
        block.write_all(&MAGIC1)?;
        block.write_u32::<LittleEndian>(ENCODED_FIELDS_LEN)?;
        block.write_u32::<LittleEndian>(self.flags)?;
        block.write_u64::<LittleEndian>(self.index_offset)?;
        block.write_u64::<LittleEndian>(self.index_size)?;
        block.write_u64::<LittleEndian>(self.virtual_size)?;
        write_uuid_text(&mut block, self.uuid)?;
        write_uuid_text(&mut block, self.parent_uuid)?;
        block.write_u8(0)?; // from (deprecated)
        block.write_u8(0)?; // to (deprecated)
        block.write_u8(self.version)?;
        block.write_u8(self.sub_version)?;
        block.write_all(&self.user_tag)?;

        debug_assert_eq!(ENCODED_FIELDS_LEN as usize, block.len());
        block.resize(Self::SPACE, 0);

        writer.write_all(&block)?;
        Ok(())
    }
}

impl Decode for HeaderTrailer {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let mut block = [0u8; Self::SPACE];
        reader.read_exact(&mut block)?;
        let mut cursor = &block[..];

        let mut magic0 = [0u8; 8];
        cursor.read_exact(&mut magic0)?;
        let mut magic1 = [0u8; 16];
        cursor.read_exact(&mut magic1)?;

        if magic0 != MAGIC0 || magic1 != MAGIC1 {
            return Err(DecodeError::InvalidHeader("HeaderTrailer"));
        }

        let _size = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let index_offset = cursor.read_u64::<LittleEndian>()?;
        let index_size = cursor.read_u64::<LittleEndian>()?;
        let virtual_size = cursor.read_u64::<LittleEndian>()?;
        let uuid = read_uuid_text(&mut cursor)?;
        let parent_uuid = read_uuid_text(&mut cursor)?;
        let _from = cursor.read_u8()?;
        let _to = cursor.read_u8()?;
        let version = cursor.read_u8()?;
        let sub_version = cursor.read_u8()?;
        let mut user_tag = [0u8; Self::TAG_SIZE];
        cursor.read_exact(&mut user_tag)?;

        Ok(Self {
            flags,
            index_offset,
            index_size,
            virtual_size,
            uuid,
            parent_uuid,
            version,
            sub_version,
            user_tag,
        })
    }
}

/// Reads and decodes a framing block at `offset`.
pub fn read_block(file: &dyn RandomAccessFile, offset: u64) -> Result<HeaderTrailer> {
    let mut buf = vec![0u8; HeaderTrailer::SPACE];
    read_exact_at(file, &mut buf, offset)?;
    let mut cursor = &buf[..];
    Ok(HeaderTrailer::decode_from(&mut cursor)?)
}

/// Encodes and writes a framing block at `offset`.
pub(crate) fn write_block(
    file: &dyn RandomAccessFile,
    ht: &HeaderTrailer,
    offset: u64,
) -> Result<()> {
    let mut buf = Vec::with_capacity(HeaderTrailer::SPACE);
    ht.encode_into(&mut buf)?;
    write_all_at(file, &buf, offset)
}
