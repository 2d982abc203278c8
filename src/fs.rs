// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};

/// Byte-addressable file abstraction for pluggable storage backends.
///
/// Everything the layer engine touches — local files, block-compressed
/// layers, remote fetchers supplied by a caller — goes through positional
/// I/O, so a handle can be shared between readers without seek state.
pub trait RandomAccessFile: Send + Sync {
    /// Reads bytes at the given absolute offset, returning how many were read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;

    /// Writes bytes at the given absolute offset, returning how many were written.
    ///
    /// Read-only backends report `Unsupported`.
    fn write_at(&self, _buf: &[u8], _offset: u64) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "file is not writable",
        ))
    }

    /// Returns the current file size in bytes.
    fn file_size(&self) -> std::io::Result<u64>;

    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> std::io::Result<()> {
        Ok(())
    }

    /// Flushes data (not necessarily metadata) to stable storage.
    fn sync_data(&self) -> std::io::Result<()> {
        self.sync_all()
    }
}

#[cfg(unix)]
impl RandomAccessFile for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }

    fn file_size(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync_all(&self) -> std::io::Result<()> {
        std::fs::File::sync_all(self)
    }

    fn sync_data(&self) -> std::io::Result<()> {
        std::fs::File::sync_data(self)
    }
}

#[cfg(windows)]
impl RandomAccessFile for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, offset)
    }

    fn file_size(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync_all(&self) -> std::io::Result<()> {
        std::fs::File::sync_all(self)
    }

    fn sync_data(&self) -> std::io::Result<()> {
        std::fs::File::sync_data(self)
    }
}

/// Reads exactly `buf.len()` bytes at `offset`.
///
/// A short read is a hard error; partially filled buffers are never handed
/// to the caller.
pub(crate) fn read_exact_at(
    file: &dyn RandomAccessFile,
    buf: &mut [u8],
    mut offset: u64,
) -> Result<()> {
    let want = buf.len();
    let mut filled = 0;

    while filled < want {
        let n = file.read_at(&mut buf[filled..], offset)?;
        if n == 0 {
            return Err(Error::ShortRead(want, filled));
        }
        filled += n;
        offset += n as u64;
    }

    Ok(())
}

/// Writes all of `buf` at `offset`.
pub(crate) fn write_all_at(
    file: &dyn RandomAccessFile,
    buf: &[u8],
    mut offset: u64,
) -> Result<()> {
    let want = buf.len();
    let mut written = 0;

    while written < want {
        let n = file.write_at(&buf[written..], offset)?;
        if n == 0 {
            return Err(Error::ShortWrite(want, written));
        }
        written += n;
        offset += n as u64;
    }

    Ok(())
}
