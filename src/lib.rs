// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A layered, log-structured block device format.
//!
//! ##### About
//!
//! This crate materializes a stack of block snapshots ("layers") as one
//! read/write virtual block device, the way container images stack. A layer
//! is an append-only sparse file: payload gets appended, and a sorted array
//! of `(offset, length) -> mapped_offset` records — the index — projects
//! virtual sector ranges onto it. Writing appends payload and index records;
//! reading walks the (possibly multi-layer) index and serves every covered
//! range from the layer that owns it, zero-filling the holes.
//!
//! A writable layer is a pair of files (data + index record log) that can be
//! [sealed in place](RwFile::close_seal) or [committed](RwFile::commit) into
//! a fresh, garbage-free sealed layer. Sealed layers chain through parent
//! UUIDs, stack below one writable layer, and can be
//! [merged](merge_files) into a single layer. Sealed layers may additionally
//! be block-compressed ([`zfile`]) and remain byte-addressable.
//!
//! # Example usage
//!
//! ```
//! use lsmt::{CreateArgs, RwFile};
//! use std::sync::Arc;
//! #
//! # let dir = tempfile::tempdir()?;
//! # let open = |name: &str| -> std::io::Result<Arc<std::fs::File>> {
//! #     Ok(Arc::new(std::fs::OpenOptions::new().read(true).write(true)
//! #         .create(true).truncate(true).open(dir.path().join(name))?))
//! # };
//!
//! let data = open("layer.data")?;
//! let index = open("layer.index")?;
//!
//! // a 1 MiB virtual block device backed by the two files
//! let file = RwFile::create(data, index, &CreateArgs::new(1 << 20))?;
//!
//! file.pwrite(&[0xAB; 4096], 0)?;
//!
//! let mut buf = [0u8; 4096];
//! file.pread(&mut buf, 0)?;
//! assert_eq!([0xAB; 4096], buf);
//!
//! // unwritten ranges read back as zeroes
//! file.pread(&mut buf, 8192)?;
//! assert_eq!([0u8; 4096], buf);
//! #
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod coding;
mod compact;
mod error;
mod fs;

#[doc(hidden)]
pub mod header;

#[doc(hidden)]
pub mod index;

mod ro;
mod rw;
mod segment;

pub mod zfile;

/// Most layers a single stack can hold.
pub const MAX_STACK_LAYERS: usize = 255;

#[doc(hidden)]
pub use index::{merge_memory_indexes, squash, ComboIndex, Index0, MemoryIndex};

pub use {
    coding::{Decode, DecodeError, Encode, EncodeError},
    compact::{merge_files, CommitArgs},
    error::{Error, Result},
    fs::RandomAccessFile,
    ro::{DataStat, FileStat, RoFile, DEFAULT_MAX_IO_SIZE},
    rw::{CreateArgs, RwFile},
    segment::{Segment, SegmentMapping, INVALID_OFFSET, MAX_LENGTH, SECTOR_SIZE},
};
