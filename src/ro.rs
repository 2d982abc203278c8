// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::Decode,
    fs::{read_exact_at, RandomAccessFile},
    header::{read_block, HeaderTrailer},
    index::{merge_memory_indexes, MemoryIndex},
    segment::{Segment, SegmentMapping, MAX_LENGTH, SECTOR_SIZE},
    Error, Result, MAX_STACK_LAYERS,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};
use uuid::Uuid;

/// Default cap on a single underlying I/O (4 MiB).
pub const DEFAULT_MAX_IO_SIZE: usize = 4 << 20;

const LOOKUP_BATCH: usize = 16;
const PARALLEL_LOAD_LIMIT: usize = 32;

/// stat-like facts about a virtual device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    /// Virtual device size in bytes.
    pub size: u64,
    /// I/O granularity in bytes (one sector).
    pub block_size: u64,
    /// Live sectors across the index.
    pub blocks: u64,
}

/// Data usage of a layer or stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataStat {
    /// Bytes occupied in the backing data file(s).
    pub total_data_size: u64,
    /// Bytes still reachable through the index (excluding garbage).
    pub valid_data_size: u64,
}

/// A read-only virtual block device over one or more sealed layers.
///
/// The layer files are held top-first; the merged index's mapping tags are
/// positions into that list.
pub struct RoFile {
    pub(crate) files: Vec<Arc<dyn RandomAccessFile>>,
    pub(crate) uuids: Vec<Option<Uuid>>,
    pub(crate) index: Arc<MemoryIndex>,
    pub(crate) vsize: u64,
    pub(crate) max_io: AtomicUsize,
}

impl RoFile {
    /// Opens a single sealed layer file.
    pub fn open(file: Arc<dyn RandomAccessFile>) -> Result<Self> {
        let (ht, index) = load_sealed(&*file)?;

        log::info!(
            "layer info: {{ uuid: {:?}, parent: {:?}, virtual size: {}, version: {}.{} }}",
            ht.uuid(),
            ht.parent_uuid(),
            ht.virtual_size,
            ht.version,
            ht.sub_version,
        );

        Ok(Self {
            uuids: vec![ht.uuid()],
            files: vec![file],
            index: Arc::new(index),
            vsize: ht.virtual_size,
            max_io: AtomicUsize::new(DEFAULT_MAX_IO_SIZE),
        })
    }

    /// Opens multiple sealed layers as one device; `files[0]` is the
    /// bottom-most layer.
    ///
    /// Indexes load in parallel, the parent chain is verified top-down, and
    /// the per-layer indexes merge into one array whose tags name the source
    /// layer.
    pub fn open_stack(mut files: Vec<Arc<dyn RandomAccessFile>>) -> Result<Self> {
        if files.len() > MAX_STACK_LAYERS {
            log::error!("open too many files ({} > {MAX_STACK_LAYERS})", files.len());
            return Err(Error::TooManyLayers(files.len()));
        }
        if files.is_empty() {
            return Err(Error::InvalidFormat("empty layer stack"));
        }

        // internal order is top-first; merge level = layer tag
        files.reverse();

        let loaded = load_stack_indexes(&files)?;
        verify_parent_chain(&loaded)?;

        let indexes: Vec<&MemoryIndex> = loaded.iter().map(|(_, i)| i).collect();
        let merged = merge_memory_indexes(&indexes)?;

        let vsize = loaded.first().map_or(0, |(ht, _)| ht.virtual_size);
        let uuids = loaded.iter().map(|(ht, _)| ht.uuid()).collect();

        log::debug!("opened {} layers", files.len());

        Ok(Self {
            files,
            uuids,
            index: Arc::new(merged),
            vsize,
            max_io: AtomicUsize::new(DEFAULT_MAX_IO_SIZE),
        })
    }

    /// The merged in-memory index.
    #[must_use]
    pub fn index(&self) -> &MemoryIndex {
        &self.index
    }

    /// Virtual device size in bytes.
    #[must_use]
    pub fn virtual_size(&self) -> u64 {
        self.vsize
    }

    /// Number of stacked layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.files.len()
    }

    /// UUID of the layer at `layer_idx` (0 = top-most).
    #[must_use]
    pub fn uuid(&self, layer_idx: usize) -> Option<Uuid> {
        self.uuids.get(layer_idx).copied().flatten()
    }

    /// Caps the size of a single underlying I/O; must be a non-zero
    /// multiple of 4 KiB.
    pub fn set_max_io_size(&self, size: usize) -> Result<()> {
        set_max_io(&self.max_io, size)
    }

    /// The current per-I/O cap in bytes.
    #[must_use]
    pub fn max_io_size(&self) -> usize {
        self.max_io.load(Ordering::Relaxed)
    }

    /// Reads into `buf` at the given byte offset; both must be
    /// sector-aligned. Unmapped and zeroed ranges read as zeroes.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.pread_deadline(buf, offset, None)
    }

    /// [`RoFile::pread`] with a deadline checked at every suspension point.
    pub fn pread_deadline(
        &self,
        buf: &mut [u8],
        offset: u64,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        if offset >= self.vsize {
            return Ok(0);
        }
        let index = &self.index;
        read_mapped(
            &|s, out| index.lookup(s, out),
            &self.files,
            buf,
            offset,
            self.max_io_size(),
            deadline,
        )?;
        Ok(buf.len())
    }

    /// stat-like facts; size is the virtual size, blocks the live sectors.
    #[must_use]
    pub fn stat(&self) -> FileStat {
        FileStat {
            size: self.vsize,
            block_size: SECTOR_SIZE,
            blocks: self.index.block_count(),
        }
    }

    /// Data usage derived from the merged index.
    #[must_use]
    pub fn data_stat(&self) -> DataStat {
        let size = self.index.block_count() * SECTOR_SIZE;
        DataStat {
            total_data_size: size,
            valid_data_size: size,
        }
    }

    /// A read-only stack cannot be sealed.
    pub fn close_seal(&self) -> Result<()> {
        Err(Error::NotWritable)
    }

    /// A read-only stack cannot be committed; merge the layers instead.
    pub fn commit(
        &self,
        _dst: &dyn RandomAccessFile,
        _args: &crate::compact::CommitArgs,
    ) -> Result<()> {
        Err(Error::NotWritable)
    }
}

pub(crate) fn set_max_io(slot: &AtomicUsize, size: usize) -> Result<()> {
    if size == 0 || size % HeaderTrailer::SPACE != 0 {
        log::error!("max io size {size} is not a positive multiple of 4 KiB");
        return Err(Error::Misaligned(0, size as u64));
    }
    slot.store(size, Ordering::Relaxed);
    Ok(())
}

pub(crate) fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(Error::Timeout),
        _ => Ok(()),
    }
}

pub(crate) fn check_alignment(offset: u64, len: usize) -> Result<()> {
    if offset % SECTOR_SIZE != 0 || len as u64 % SECTOR_SIZE != 0 {
        log::error!("arguments must be sector-aligned (offset {offset}, length {len})");
        return Err(Error::Misaligned(offset, len as u64));
    }
    Ok(())
}

/// Loads the index region of one sealed data file.
///
/// Returns the trailer (which mirrors the header fields) plus the index with
/// sentinel records dropped and tags cleared.
pub(crate) fn load_sealed(
    file: &dyn RandomAccessFile,
) -> Result<(HeaderTrailer, MemoryIndex)> {
    let header = read_block(file, 0)?;
    header.expect(true, true, None)?;

    let file_size = file.file_size()?;
    let space = HeaderTrailer::SPACE as u64;
    if file_size < 2 * space {
        return Err(Error::InvalidFormat("sealed file too short for a trailer"));
    }

    let trailer_offset = file_size - space;
    let trailer = read_block(file, trailer_offset)?;
    trailer.expect(false, true, Some(true))?;

    let record_size = std::mem::size_of::<SegmentMapping>() as u64;
    let index_bytes = trailer
        .index_size
        .checked_mul(record_size)
        .ok_or(Error::InvalidFormat("index size overflows"))?;

    if trailer.index_offset < space
        || trailer.index_offset + index_bytes > trailer_offset
    {
        return Err(Error::InvalidFormat("index region escapes the file"));
    }

    log::debug!(
        "index_size: {}, trailer offset: {trailer_offset}",
        trailer.index_size
    );

    let mut raw = vec![0u8; index_bytes as usize];
    read_exact_at(file, &mut raw, trailer.index_offset)?;

    let mut records = Vec::with_capacity(trailer.index_size as usize);
    let mut cursor = &raw[..];
    for _ in 0..trailer.index_size {
        let mut m = SegmentMapping::decode_from(&mut cursor)?;
        if m.is_valid() {
            m.set_tag(0);
            records.push(m);
        }
    }

    let index = MemoryIndex::new(
        records,
        space / SECTOR_SIZE,
        trailer.index_offset / SECTOR_SIZE,
    )?;

    Ok((trailer, index))
}

/// Loads all layer indexes with bounded parallelism; input is top-first.
#[allow(clippy::expect_used)]
pub(crate) fn load_stack_indexes(
    files: &[Arc<dyn RandomAccessFile>],
) -> Result<Vec<(HeaderTrailer, MemoryIndex)>> {
    let workers = files.len().min(PARALLEL_LOAD_LIMIT);
    log::debug!("loading {} layer indexes on {workers} workers", files.len());

    let slots: Vec<Mutex<Option<Result<(HeaderTrailer, MemoryIndex)>>>> =
        (0..files.len()).map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                let Some(file) = files.get(i) else {
                    break;
                };
                let result = load_sealed(&**file);
                if let Some(slot) = slots.get(i) {
                    *slot.lock().expect("lock is poisoned") = Some(result);
                }
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .expect("lock is poisoned")
                .unwrap_or(Err(Error::InvalidFormat("layer index did not load")))
        })
        .collect()
}

/// Verifies `parent_uuid(i-1) == uuid(i)` across a top-first stack.
pub(crate) fn verify_parent_chain(loaded: &[(HeaderTrailer, MemoryIndex)]) -> Result<()> {
    for (i, pair) in loaded.windows(2).enumerate() {
        let upper = &pair[0].0;
        let lower = &pair[1].0;

        match (upper.parent_uuid(), lower.uuid()) {
            (Some(parent), Some(uuid)) => {
                if parent != uuid {
                    log::error!(
                        "parent uuid mismatch in layer {}: got {uuid}, expected {parent}",
                        i + 1
                    );
                    return Err(Error::ParentChainMismatch(i + 1));
                }
            }
            _ => {
                log::warn!("layer {} carries a null uuid, chain check skipped", i + 1);
            }
        }
    }
    Ok(())
}

/// The shared read engine: splits `[offset, offset + buf.len())` into
/// index-sized segments and serves each from its owning data file, zeroing
/// holes and zeroed mappings.
pub(crate) fn read_mapped<L>(
    lookup: &L,
    files: &[Arc<dyn RandomAccessFile>],
    buf: &mut [u8],
    offset: u64,
    max_io: usize,
    deadline: Option<Instant>,
) -> Result<()>
where
    L: Fn(Segment, &mut [SegmentMapping]) -> usize,
{
    check_alignment(offset, buf.len())?;

    let chunk_cap = max_io.min(MAX_LENGTH as usize * SECTOR_SIZE as usize);
    let mut done = 0usize;

    while done < buf.len() {
        check_deadline(deadline)?;

        let chunk_len = chunk_cap.min(buf.len() - done);
        let chunk_offset = offset + done as u64;
        let chunk = &mut buf[done..done + chunk_len];

        let first_sector = chunk_offset / SECTOR_SIZE;
        let send = first_sector + chunk_len as u64 / SECTOR_SIZE;

        let mut batch = [SegmentMapping::default(); LOOKUP_BATCH];
        let mut pos = first_sector;

        while pos < send {
            let query = Segment::new(pos, (send - pos) as u32);
            let n = lookup(query, &mut batch);

            for m in batch.iter().take(n) {
                if m.offset() > pos {
                    sector_span(chunk, first_sector, pos, m.offset()).fill(0);
                }

                let span = sector_span(chunk, first_sector, m.offset(), m.end());
                if m.zeroed() {
                    span.fill(0);
                } else {
                    check_deadline(deadline)?;
                    let file = files
                        .get(m.tag() as usize)
                        .ok_or(Error::InvalidFormat("mapping tag out of layer range"))?;
                    read_exact_at(&**file, span, m.moffset() * SECTOR_SIZE)?;
                }
                pos = m.end();
            }

            if n < LOOKUP_BATCH {
                if pos < send {
                    sector_span(chunk, first_sector, pos, send).fill(0);
                }
                break;
            }
        }

        done += chunk_len;
    }

    Ok(())
}

fn sector_span<'a>(chunk: &'a mut [u8], base: u64, from: u64, to: u64) -> &'a mut [u8] {
    let lo = ((from - base) * SECTOR_SIZE) as usize;
    let hi = ((to - base) * SECTOR_SIZE) as usize;
    &mut chunk[lo..hi]
}
