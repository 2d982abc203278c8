// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block-compressed read-only layer files.
//!
//! A compressed file holds a 4 KiB header, compressed payload blocks back to
//! back, a jump table of per-block compressed sizes (plus per-block CRC32s
//! when verification is enabled), and a 4 KiB trailer mirroring the header.
//! The layer engine consumes it as a transparent byte-addressable data file.

mod compressor;

pub use compressor::Algorithm;

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    fs::{read_exact_at, write_all_at, RandomAccessFile},
    Error, Result,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;

/// 8-byte magic preamble of a compressed layer file.
pub const MAGIC0: [u8; 8] = *b"ZFile\0\x01\0";

/// 16-byte magic UUID following the preamble.
pub const MAGIC1: [u8; 16] = [
    0x31, 0x9c, 0x6b, 0x74, 0x5d, 0xc0, 0x45, 0x11, 0x92, 0x1a, 0x8e, 0xe5, 0x7f, 0x0e, 0x5c,
    0x2f,
];

/// Default logical block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

const SPACE: usize = 4096;
const FLAG_HEADER: u32 = 1 << 0;
const FLAG_SEALED: u32 = 1 << 2;
const ENCODED_FIELDS_LEN: u32 = 63;

/// How a stream gets compressed.
#[derive(Clone, Copy, Debug)]
pub struct CompressOptions {
    /// Logical (uncompressed) block size in bytes.
    pub block_size: u32,
    /// Compression algorithm.
    pub algorithm: Algorithm,
    /// Compression level (0 = the algorithm's default).
    pub level: u8,
    /// Store a CRC32 of every uncompressed block.
    pub verify: bool,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            algorithm: Algorithm::Lz4,
            level: 0,
            verify: false,
        }
    }
}

#[derive(Clone, Debug)]
struct ZHeaderTrailer {
    flags: u32,
    index_offset: u64,
    index_size: u64,
    raw_size: u64,
    block_size: u32,
    algorithm: Algorithm,
    level: u8,
    verify: bool,
}

impl ZHeaderTrailer {
    fn new(opt: &CompressOptions, raw_size: u64) -> Self {
        Self {
            flags: FLAG_HEADER,
            index_offset: 0,
            index_size: 0,
            raw_size,
            block_size: opt.block_size,
            algorithm: opt.algorithm,
            level: opt.level,
            verify: opt.verify,
        }
    }

    fn is_header(&self) -> bool {
        self.flags & FLAG_HEADER != 0
    }

    fn is_sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    fn set_trailer(&mut self) {
        self.flags &= !FLAG_HEADER;
    }

    fn set_sealed(&mut self) {
        self.flags |= FLAG_SEALED;
    }
}

impl Encode for ZHeaderTrailer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        let mut block = Vec::with_capacity(SPACE);

        block.write_all(&MAGIC0)?;
        block.write_all(&MAGIC1)?;
        block.write_u32::<LittleEndian>(ENCODED_FIELDS_LEN)?;
        block.write_u32::<LittleEndian>(self.flags)?;
        block.write_u64::<LittleEndian>(self.index_offset)?;
        block.write_u64::<LittleEndian>(self.index_size)?;
        block.write_u64::<LittleEndian>(self.raw_size)?;
        block.write_u32::<LittleEndian>(self.block_size)?;
        self.algorithm.encode_into(&mut block)?;
        block.write_u8(self.level)?;
        block.write_u8(u8::from(self.verify))?;

        debug_assert_eq!(ENCODED_FIELDS_LEN as usize, block.len());
        block.resize(SPACE, 0);

        writer.write_all(&block)?;
        Ok(())
    }
}

impl Decode for ZHeaderTrailer {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let mut block = [0u8; SPACE];
        reader.read_exact(&mut block)?;
        let mut cursor = &block[..];

        let mut magic0 = [0u8; 8];
        cursor.read_exact(&mut magic0)?;
        let mut magic1 = [0u8; 16];
        cursor.read_exact(&mut magic1)?;

        if magic0 != MAGIC0 || magic1 != MAGIC1 {
            return Err(DecodeError::InvalidHeader("ZHeaderTrailer"));
        }

        let _size = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let index_offset = cursor.read_u64::<LittleEndian>()?;
        let index_size = cursor.read_u64::<LittleEndian>()?;
        let raw_size = cursor.read_u64::<LittleEndian>()?;
        let block_size = cursor.read_u32::<LittleEndian>()?;
        let algorithm = Algorithm::decode_from(&mut cursor)?;
        let level = cursor.read_u8()?;
        let verify = cursor.read_u8()? != 0;

        Ok(Self {
            flags,
            index_offset,
            index_size,
            raw_size,
            block_size,
            algorithm,
            level,
            verify,
        })
    }
}

fn read_zblock(file: &dyn RandomAccessFile, offset: u64) -> Result<ZHeaderTrailer> {
    let mut buf = vec![0u8; SPACE];
    read_exact_at(file, &mut buf, offset)?;
    let mut cursor = &buf[..];
    Ok(ZHeaderTrailer::decode_from(&mut cursor)?)
}

/// Whether the file starts with a compressed-layer header.
pub fn is_zfile(file: &dyn RandomAccessFile) -> Result<bool> {
    if file.file_size()? < SPACE as u64 {
        return Ok(false);
    }
    match read_zblock(file, 0) {
        Ok(ht) => Ok(ht.is_header()),
        Err(Error::Decode(DecodeError::InvalidHeader(_))) => Ok(false),
        Err(e) => Err(e),
    }
}

/// A compressed layer file opened for reading.
///
/// Positional reads decompress the covering blocks into a scratch buffer
/// and copy out the requested range; the jump table is memoized into
/// absolute block offsets at open time.
pub struct ZFile {
    file: Arc<dyn RandomAccessFile>,
    block_size: u32,
    raw_size: u64,
    algorithm: Algorithm,
    // absolute byte offset of every block, plus the end of the last one
    offsets: Vec<u64>,
    crcs: Vec<u32>,
    verify: bool,
}

impl ZFile {
    /// Opens a compressed file, parsing header, trailer and jump table.
    ///
    /// With `verify`, every decompressed block is checked against its stored
    /// CRC32 (requires the file to carry them).
    pub fn open_ro(file: Arc<dyn RandomAccessFile>, verify: bool) -> Result<Self> {
        let header = read_zblock(&*file, 0)?;
        if !header.is_header() {
            return Err(Error::InvalidFormat("compressed file starts with a trailer"));
        }

        let file_size = file.file_size()?;
        if file_size < 2 * SPACE as u64 {
            return Err(Error::InvalidFormat("compressed file too short for a trailer"));
        }

        let trailer = read_zblock(&*file, file_size - SPACE as u64)?;
        if trailer.is_header() || !trailer.is_sealed() {
            return Err(Error::InvalidFormat("compressed file trailer flag mismatch"));
        }
        if trailer.block_size == 0 {
            return Err(Error::InvalidFormat("compressed block size is zero"));
        }

        let blocks = trailer.raw_size.div_ceil(u64::from(trailer.block_size));
        if blocks != trailer.index_size {
            return Err(Error::InvalidFormat("jump table length mismatch"));
        }

        let entry_bytes = if trailer.verify { 8 } else { 4 };
        let table_bytes = blocks * entry_bytes;
        if trailer.index_offset < SPACE as u64
            || trailer.index_offset + table_bytes > file_size - SPACE as u64
        {
            return Err(Error::InvalidFormat("jump table escapes the file"));
        }

        let mut raw = vec![0u8; table_bytes as usize];
        read_exact_at(&*file, &mut raw, trailer.index_offset)?;
        let mut cursor = &raw[..];

        let mut offsets = Vec::with_capacity(blocks as usize + 1);
        let mut at = SPACE as u64;
        offsets.push(at);
        for _ in 0..blocks {
            at += u64::from(cursor.read_u32::<LittleEndian>().map_err(DecodeError::from)?);
            offsets.push(at);
        }

        let mut crcs = Vec::new();
        if trailer.verify {
            crcs.reserve(blocks as usize);
            for _ in 0..blocks {
                crcs.push(cursor.read_u32::<LittleEndian>().map_err(DecodeError::from)?);
            }
        }

        if offsets.last().copied() != Some(trailer.index_offset) {
            return Err(Error::InvalidFormat("payload and jump table disagree"));
        }

        let verify = if verify && !trailer.verify {
            log::warn!("verification requested but the file carries no checksums");
            false
        } else {
            verify
        };

        log::info!(
            "compressed file: {{ raw size: {}, block size: {}, blocks: {blocks}, algorithm: {}, checksums: {} }}",
            trailer.raw_size,
            trailer.block_size,
            trailer.algorithm,
            trailer.verify,
        );

        Ok(Self {
            file,
            block_size: trailer.block_size,
            raw_size: trailer.raw_size,
            algorithm: trailer.algorithm,
            offsets,
            crcs,
            verify,
        })
    }

    /// Logical (uncompressed) size in bytes.
    #[must_use]
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    /// Logical block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_raw_len(&self, block: u64) -> usize {
        let start = block * u64::from(self.block_size);
        (self.raw_size - start).min(u64::from(self.block_size)) as usize
    }

    fn load_block(&self, block: u64, scratch: &mut [u8]) -> Result<usize> {
        let lo = self.offsets[block as usize];
        let hi = self.offsets[block as usize + 1];
        let raw_len = self.block_raw_len(block);

        let mut compressed = vec![0u8; (hi - lo) as usize];
        read_exact_at(&*self.file, &mut compressed, lo)?;

        // a block that would not shrink is stored raw; its jump-table entry
        // then equals the uncompressed length
        if compressed.len() == raw_len {
            scratch[..raw_len].copy_from_slice(&compressed);
        } else {
            let n = self
                .algorithm
                .decompress(&compressed, &mut scratch[..raw_len])?;
            if n != raw_len {
                return Err(Error::Decompress);
            }
        }

        if self.verify {
            let got = crc32fast::hash(&scratch[..raw_len]);
            let expected = self.crcs[block as usize];
            if got != expected {
                log::error!("block {block} checksum mismatch: expected {expected:#010x}, got {got:#010x}");
                return Err(Error::ChecksumMismatch(expected, got));
            }
        }

        Ok(raw_len)
    }

    /// Reads up to `buf.len()` bytes at `offset` of the logical stream.
    ///
    /// Short only at end of file.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.raw_size || buf.is_empty() {
            return Ok(0);
        }

        let count = buf.len().min((self.raw_size - offset) as usize);
        let bs = u64::from(self.block_size);
        let first = offset / bs;
        let last = (offset + count as u64 - 1) / bs;

        let mut scratch = vec![0u8; self.block_size as usize];
        let mut copied = 0usize;

        for block in first..=last {
            let raw_len = self.load_block(block, &mut scratch)?;

            let block_start = block * bs;
            let lo = offset.max(block_start) - block_start;
            let hi = ((offset + count as u64).min(block_start + raw_len as u64)) - block_start;

            buf[copied..copied + (hi - lo) as usize]
                .copy_from_slice(&scratch[lo as usize..hi as usize]);
            copied += (hi - lo) as usize;
        }

        Ok(copied)
    }
}

impl RandomAccessFile for ZFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.pread(buf, offset).map_err(std::io::Error::other)
    }

    fn file_size(&self) -> std::io::Result<u64> {
        Ok(self.raw_size)
    }
}

/// Compresses a flat byte stream into a compressed layer file.
pub fn compress(
    src: &dyn RandomAccessFile,
    dst: &dyn RandomAccessFile,
    opt: &CompressOptions,
) -> Result<()> {
    if opt.block_size == 0 {
        return Err(Error::InvalidFormat("compressed block size is zero"));
    }

    let raw_size = src.file_size()?;
    let mut header = ZHeaderTrailer::new(opt, raw_size);
    write_block_at(dst, &header, 0)?;

    let blocks = raw_size.div_ceil(u64::from(opt.block_size));
    let mut sizes: Vec<u32> = Vec::with_capacity(blocks as usize);
    let mut crcs: Vec<u32> = Vec::with_capacity(if opt.verify { blocks as usize } else { 0 });

    let mut raw = vec![0u8; opt.block_size as usize];
    let mut tail = SPACE as u64;

    for block in 0..blocks {
        let offset = block * u64::from(opt.block_size);
        let raw_len = (raw_size - offset).min(u64::from(opt.block_size)) as usize;
        read_exact_at(src, &mut raw[..raw_len], offset)?;

        if opt.verify {
            crcs.push(crc32fast::hash(&raw[..raw_len]));
        }

        let compressed = opt.algorithm.compress(&raw[..raw_len]);
        let stored: &[u8] = if compressed.len() >= raw_len {
            // incompressible block, store it raw
            &raw[..raw_len]
        } else {
            &compressed
        };

        write_all_at(dst, stored, tail)?;
        sizes.push(stored.len() as u32);
        tail += stored.len() as u64;
    }

    let index_offset = tail;
    let mut table = Vec::with_capacity(sizes.len() * 8);
    for size in &sizes {
        table.write_u32::<LittleEndian>(*size).map_err(EncodeError::from)?;
    }
    for crc in &crcs {
        table.write_u32::<LittleEndian>(*crc).map_err(EncodeError::from)?;
    }
    write_all_at(dst, &table, tail)?;
    tail += table.len() as u64;

    header.index_offset = index_offset;
    header.index_size = blocks;
    header.set_sealed();

    let mut trailer = header.clone();
    trailer.set_trailer();
    write_block_at(dst, &trailer, tail)?;

    // rewrite the header now that the jump table location is known
    write_block_at(dst, &header, 0)?;

    dst.sync_all()?;
    log::info!(
        "compressed {raw_size} bytes into {} blocks, payload {} bytes",
        blocks,
        index_offset - SPACE as u64,
    );
    Ok(())
}

/// Extracts a compressed layer file back into a flat byte stream.
pub fn decompress(src: Arc<dyn RandomAccessFile>, dst: &dyn RandomAccessFile) -> Result<()> {
    let zfile = ZFile::open_ro(src, true)?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;

    while offset < zfile.raw_size() {
        let n = zfile.pread(&mut buf, offset)?;
        if n == 0 {
            return Err(Error::ShortRead(buf.len(), 0));
        }
        write_all_at(dst, &buf[..n], offset)?;
        offset += n as u64;
    }

    Ok(())
}

fn write_block_at(
    file: &dyn RandomAccessFile,
    ht: &ZHeaderTrailer,
    offset: u64,
) -> Result<()> {
    let mut buf = Vec::with_capacity(SPACE);
    ht.encode_into(&mut buf)?;
    write_all_at(file, &buf, offset)
}
