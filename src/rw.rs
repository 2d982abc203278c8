// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, Encode},
    compact::{self, CommitArgs},
    fs::{read_exact_at, write_all_at, RandomAccessFile},
    header::{read_block, write_block, HeaderTrailer},
    index::{ComboIndex, Index0, MemoryIndex},
    ro::{
        check_alignment, check_deadline, read_mapped, set_max_io, DataStat, FileStat, RoFile,
        DEFAULT_MAX_IO_SIZE,
    },
    segment::{SegmentMapping, MAX_LENGTH, SECTOR_SIZE},
    Error, Result, MAX_STACK_LAYERS,
};
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};
use uuid::Uuid;

/// Identity and geometry of a new writable layer.
#[derive(Clone, Debug)]
pub struct CreateArgs {
    /// Virtual device size in bytes.
    pub virtual_size: u64,
    /// The new layer's UUID.
    pub uuid: Uuid,
    /// UUID of the layer below, if any.
    pub parent_uuid: Option<Uuid>,
    /// Free-form tag, at most 256 bytes.
    pub user_tag: Vec<u8>,
}

impl CreateArgs {
    /// Arguments for a layer of `virtual_size` bytes with a fresh UUID.
    #[must_use]
    pub fn new(virtual_size: u64) -> Self {
        Self {
            virtual_size,
            uuid: Uuid::new_v4(),
            parent_uuid: None,
            user_tag: Vec::new(),
        }
    }

    /// Sets the parent layer UUID.
    #[must_use]
    pub fn with_parent_uuid(mut self, parent: Uuid) -> Self {
        self.parent_uuid = Some(parent);
        self
    }

    /// Sets the user tag.
    #[must_use]
    pub fn with_user_tag(mut self, tag: impl Into<Vec<u8>>) -> Self {
        self.user_tag = tag.into();
        self
    }
}

struct WriteState {
    data_tail: u64,
    index_tail: u64,
    staged: Vec<SegmentMapping>,
    group_records: usize,
}

impl WriteState {
    fn append_record(
        &mut self,
        findex: &dyn RandomAccessFile,
        m: SegmentMapping,
    ) -> Result<()> {
        if self.group_records == 0 {
            let buf = m.encode_into_vec();
            write_all_at(findex, &buf, self.index_tail)?;
            self.index_tail += buf.len() as u64;
            return Ok(());
        }

        self.staged.push(m);
        if self.staged.len() >= self.group_records {
            self.flush_group(findex)?;
        }
        Ok(())
    }

    fn flush_group(&mut self, findex: &dyn RandomAccessFile) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }

        // pad to the full buffer; loaders skip the sentinels
        while self.staged.len() < self.group_records {
            self.staged.push(SegmentMapping::invalid());
        }

        let mut buf = Vec::with_capacity(
            self.staged.len() * std::mem::size_of::<SegmentMapping>(),
        );
        for m in &self.staged {
            m.encode_into(&mut buf)?;
        }

        write_all_at(findex, &buf, self.index_tail)?;
        self.index_tail += buf.len() as u64;
        self.staged.clear();
        Ok(())
    }
}

/// A writable virtual block device: an append-only data file, an append-only
/// index record log, and a mutable in-memory index, optionally stacked on a
/// read-only layer set.
///
/// Reads take no lock; writes serialize behind the per-device write mutex.
pub struct RwFile {
    files: Vec<Arc<dyn RandomAccessFile>>,
    uuids: Vec<Option<Uuid>>,
    data: Arc<dyn RandomAccessFile>,
    findex: Arc<dyn RandomAccessFile>,
    index: ComboIndex,
    vsize: AtomicU64,
    max_io: AtomicUsize,
    inner: Mutex<WriteState>,
}

impl RwFile {
    /// Creates a new writable layer over the given (empty) data and index
    /// files, writing both headers.
    pub fn create(
        data: Arc<dyn RandomAccessFile>,
        findex: Arc<dyn RandomAccessFile>,
        args: &CreateArgs,
    ) -> Result<Self> {
        let space = HeaderTrailer::SPACE as u64;

        let mut header = HeaderTrailer::new(args.uuid, args.parent_uuid);
        header.set_data_file();
        header.virtual_size = args.virtual_size;
        header.set_user_tag(&args.user_tag)?;
        write_block(&*data, &header, 0)?;

        let mut index_header = header.clone();
        index_header.set_index_file();
        index_header.index_offset = space;
        write_block(&*findex, &index_header, 0)?;

        if args.parent_uuid.is_none() {
            log::warn!("parent uuid is null");
        }
        log::info!(
            "layer info: {{ uuid: {}, parent: {:?}, virtual size: {} }}",
            args.uuid,
            args.parent_uuid,
            args.virtual_size,
        );

        Ok(Self {
            files: vec![data.clone()],
            uuids: vec![Some(args.uuid)],
            data,
            findex,
            index: ComboIndex::unstacked(Index0::new()),
            vsize: AtomicU64::new(args.virtual_size),
            max_io: AtomicUsize::new(DEFAULT_MAX_IO_SIZE),
            inner: Mutex::new(WriteState {
                data_tail: space,
                index_tail: space,
                staged: Vec::new(),
                group_records: 0,
            }),
        })
    }

    /// Opens an unsealed data + index pair, replaying the index record log.
    pub fn open(
        data: Arc<dyn RandomAccessFile>,
        findex: Arc<dyn RandomAccessFile>,
    ) -> Result<Self> {
        let space = HeaderTrailer::SPACE as u64;
        let record_size = std::mem::size_of::<SegmentMapping>() as u64;

        let header = read_block(&*data, 0)?;
        header.expect(true, true, Some(false))?;

        let index_header = read_block(&*findex, 0)?;
        index_header.expect(true, false, Some(false))?;
        if index_header.index_offset != space {
            return Err(Error::InvalidFormat("index record log offset mismatch"));
        }

        let index_file_size = findex.file_size()?;
        let record_count = index_file_size.saturating_sub(space) / record_size;
        let record_bytes = record_count * record_size;

        let mut raw = vec![0u8; record_bytes as usize];
        read_exact_at(&*findex, &mut raw, space)?;

        let data_size = data.file_size()?;
        let mut records = Vec::with_capacity(record_count as usize);
        let mut cursor = &raw[..];
        for _ in 0..record_count {
            let mut m = SegmentMapping::decode_from(&mut cursor)?;
            if m.is_valid() {
                m.set_tag(0);
                records.push(m);
            }
        }

        if !crate::index::verify_mapping_moffsets(
            &records,
            space / SECTOR_SIZE,
            data_size / SECTOR_SIZE,
        ) {
            return Err(Error::InvalidFormat("mapped offset out of range"));
        }

        let index0 = Index0::replay(records);
        log::info!(
            "layer info: {{ uuid: {:?}, parent: {:?}, virtual size: {}, version: {}.{} }}",
            header.uuid(),
            header.parent_uuid(),
            header.virtual_size,
            header.version,
            header.sub_version,
        );

        Ok(Self {
            files: vec![data.clone()],
            uuids: vec![header.uuid()],
            data,
            findex,
            index: ComboIndex::unstacked(index0),
            vsize: AtomicU64::new(header.virtual_size),
            max_io: AtomicUsize::new(DEFAULT_MAX_IO_SIZE),
            inner: Mutex::new(WriteState {
                data_tail: data_size,
                index_tail: space + record_bytes,
                staged: Vec::new(),
                group_records: 0,
            }),
        })
    }

    /// Stacks this (unstacked) writable layer over a read-only layer set,
    /// forming one virtual device.
    ///
    /// With `check_order`, the read-only parent chain is re-verified from
    /// the layer headers.
    pub fn stack(self, lower: RoFile, check_order: bool) -> Result<Self> {
        if self.files.len() != 1 {
            return Err(Error::Unsupported("upper layer is already stacked"));
        }
        if lower.files.len() >= MAX_STACK_LAYERS {
            return Err(Error::TooManyLayers(lower.files.len() + 1));
        }

        if check_order {
            verify_layer_headers(&lower.files)?;

            let rw_header = read_block(&*self.data, 0)?;
            match (rw_header.parent_uuid(), lower.uuids.first().copied().flatten()) {
                (Some(parent), Some(top)) if parent != top => {
                    log::warn!(
                        "writable layer's parent uuid {parent} does not name the top read-only layer {top}"
                    );
                }
                _ => {}
            }
        } else {
            log::warn!("stacking layers without order check");
        }

        let ro_count = lower.files.len();
        self.index.reseat_backing(lower.index.clone(), ro_count as u8);

        let mut files = lower.files;
        files.push(self.data.clone());
        let mut uuids = lower.uuids;
        uuids.extend(self.uuids);

        Ok(Self {
            files,
            uuids,
            data: self.data,
            findex: self.findex,
            index: self.index,
            vsize: self.vsize,
            max_io: self.max_io,
            inner: self.inner,
        })
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, WriteState> {
        self.inner.lock().expect("lock is poisoned")
    }

    /// The combined (top over backing) index.
    #[must_use]
    pub fn index(&self) -> &ComboIndex {
        &self.index
    }

    /// Virtual device size in bytes.
    #[must_use]
    pub fn virtual_size(&self) -> u64 {
        self.vsize.load(Ordering::Acquire)
    }

    /// Number of stacked layers, the writable one included.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.files.len()
    }

    /// UUID of the layer at `layer_idx` (0 = top read-only layer; the
    /// writable layer sits last).
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

    /// Reconfigures index group commit to `buffer_bytes` worth of records
    /// (0 disables staging; records then hit the log one by one).
    ///
    /// Shrinking below the currently staged count flushes first.
    pub fn set_index_group_commit(&self, buffer_bytes: usize) -> Result<()> {
        let records = buffer_bytes / std::mem::size_of::<SegmentMapping>();
        let mut state = self.lock();

        if records < state.staged.len() {
            state.flush_group(&*self.findex)?;
        }
        state.group_records = records;
        Ok(())
    }

    /// Reads into `buf` at the given byte offset; both must be
    /// sector-aligned.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.pread_deadline(buf, offset, None)
    }

    /// [`RwFile::pread`] with a deadline checked at every suspension point.
    pub fn pread_deadline(
        &self,
        buf: &mut [u8],
        offset: u64,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        if offset >= self.virtual_size() {
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

    /// Writes `buf` at the given byte offset; both must be sector-aligned.
    ///
    /// The payload is appended to the data file, the mapping spliced into
    /// the in-memory index and appended to the index record log. Writes past
    /// the current virtual size extend it.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.pwrite_deadline(buf, offset, None)
    }

    /// [`RwFile::pwrite`] with a deadline checked at every suspension point.
    pub fn pwrite_deadline(
        &self,
        buf: &[u8],
        offset: u64,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        check_alignment(offset, buf.len())?;
        log::debug!("pwrite {{ offset: {offset}, length: {} }}", buf.len());

        let chunk_cap = self
            .max_io_size()
            .min(MAX_LENGTH as usize * SECTOR_SIZE as usize);
        let mut done = 0usize;

        while done < buf.len() {
            check_deadline(deadline)?;

            let chunk_len = chunk_cap.min(buf.len() - done);
            let chunk_offset = offset + done as u64;
            let chunk = &buf[done..done + chunk_len];

            {
                let mut state = self.lock();

                let moffset = state.data_tail;
                write_all_at(&*self.data, chunk, moffset)?;
                state.data_tail += chunk_len as u64;

                let m = SegmentMapping::new(
                    chunk_offset / SECTOR_SIZE,
                    (chunk_len as u64 / SECTOR_SIZE) as u32,
                    moffset / SECTOR_SIZE,
                );
                self.index.insert(m);
                state.append_record(&*self.findex, m)?;
            }

            done += chunk_len;
        }

        let end = offset + buf.len() as u64;
        let before = self.vsize.fetch_max(end, Ordering::AcqRel);
        if before < end {
            log::info!("virtual size extended: {before} -> {end}");
        }

        Ok(buf.len())
    }

    /// Punches a hole: the range reads as zeroes afterwards and its live
    /// sectors leave the block count. Sector-aligned; long ranges split at
    /// the maximum mapping length.
    pub fn trim(&self, offset: u64, len: u64) -> Result<()> {
        check_alignment(offset, len as usize)?;

        let chunk_cap = u64::from(MAX_LENGTH) * SECTOR_SIZE;
        let mut pos = offset;
        let end = offset + len;

        while pos < end {
            let chunk = chunk_cap.min(end - pos);

            let mut state = self.lock();
            // the record stays self-describing: its mapped offset is the
            // current data tail, even though a hole owns no bytes
            let mut m = SegmentMapping::new(
                pos / SECTOR_SIZE,
                (chunk / SECTOR_SIZE) as u32,
                state.data_tail / SECTOR_SIZE,
            );
            m.set_zeroed(true);
            self.index.insert(m);
            state.append_record(&*self.findex, m)?;
            drop(state);

            pos += chunk;
        }

        Ok(())
    }

    /// Zeroes a range. Behaviorally a trim: reads return zeroes and the
    /// block count drops; no payload is appended.
    pub fn zero_range(&self, offset: u64, len: u64) -> Result<()> {
        self.trim(offset, len)
    }

    /// Adjusts the virtual size without touching any data.
    pub fn ftruncate(&self, virtual_size: u64) -> Result<()> {
        self.vsize.store(virtual_size, Ordering::Release);
        Ok(())
    }

    /// Flushes staged index records and syncs both files.
    pub fn fsync(&self) -> Result<()> {
        self.lock().flush_group(&*self.findex)?;
        self.data.sync_all()?;
        self.findex.sync_all()?;
        Ok(())
    }

    /// Like [`RwFile::fsync`], without forcing metadata out.
    pub fn fdatasync(&self) -> Result<()> {
        self.lock().flush_group(&*self.findex)?;
        self.data.sync_data()?;
        self.findex.sync_data()?;
        Ok(())
    }

    /// stat-like facts; blocks counts the writable layer's live sectors.
    #[must_use]
    pub fn stat(&self) -> FileStat {
        FileStat {
            size: self.virtual_size(),
            block_size: SECTOR_SIZE,
            blocks: self.index.block_count(),
        }
    }

    /// Data usage of the writable layer: bytes appended vs. bytes still
    /// reachable through the index.
    pub fn data_stat(&self) -> Result<DataStat> {
        let total = self
            .data
            .file_size()?
            .saturating_sub(HeaderTrailer::SPACE as u64);
        let valid = self.index.block_count() * SECTOR_SIZE;
        log::debug!("data size: {total} (valid: {valid})");
        Ok(DataStat {
            total_data_size: total,
            valid_data_size: valid,
        })
    }

    /// Commits the writable layer into `dst` as a single sealed layer,
    /// dropping garbage between live ranges and eliding zero blocks.
    ///
    /// Stacked devices cannot be committed; merge the read-only set instead.
    pub fn commit(&self, dst: &dyn RandomAccessFile, args: &CommitArgs) -> Result<()> {
        if self.files.len() > 1 {
            return Err(Error::Unsupported("commit of a stacked device"));
        }

        self.lock().flush_group(&*self.findex)?;

        let header = read_block(&*self.data, 0)?;
        let mappings = self.index.dump_top(0);

        compact::compact(
            std::slice::from_ref(&self.data),
            mappings,
            self.virtual_size(),
            header.parent_uuid(),
            args,
            dst,
        )
    }

    /// Seals the layer in place: flushes staged records, appends the dumped
    /// index to the data file and writes the sealed trailer.
    ///
    /// With `reopen`, returns the same layer reopened as a read-only file.
    pub fn close_seal(self, reopen: bool) -> Result<Option<RoFile>> {
        let space = HeaderTrailer::SPACE as u64;

        let mut state = self.lock();
        state.flush_group(&*self.findex)?;

        let dumped = self.index.dump_top(SECTOR_SIZE as usize);
        let index_offset = state.data_tail;
        let index_size = self.index.top_len() as u64;

        let mut buf =
            Vec::with_capacity(dumped.len() * std::mem::size_of::<SegmentMapping>());
        for m in &dumped {
            m.encode_into(&mut buf)?;
        }
        write_all_at(&*self.data, &buf, index_offset)?;
        state.data_tail += buf.len() as u64;

        let header = read_block(&*self.data, 0)?;
        let mut trailer = header.clone();
        trailer.set_trailer();
        trailer.set_sealed();
        trailer.set_data_file();
        trailer.index_offset = index_offset;
        trailer.index_size = index_size;
        trailer.virtual_size = self.virtual_size();
        write_block(&*self.data, &trailer, state.data_tail)?;

        // flip the header sealed bit so the pair cannot reopen writable
        let mut sealed_header = header.clone();
        sealed_header.set_sealed();
        sealed_header.virtual_size = trailer.virtual_size;
        write_block(&*self.data, &sealed_header, 0)?;

        self.data.sync_all()?;
        drop(state);

        if !reopen {
            return Ok(None);
        }

        let records: Vec<SegmentMapping> =
            dumped.into_iter().filter(|m| m.is_valid()).collect();
        let index = MemoryIndex::new(
            records,
            space / SECTOR_SIZE,
            index_offset / SECTOR_SIZE,
        )?;

        Ok(Some(RoFile {
            files: vec![self.data],
            uuids: vec![header.uuid()],
            index: Arc::new(index),
            vsize: trailer.virtual_size,
            max_io: AtomicUsize::new(DEFAULT_MAX_IO_SIZE),
        }))
    }
}

/// Re-verifies the parent chain of already-opened layer files (top-first)
/// from their on-disk headers.
fn verify_layer_headers(files: &[Arc<dyn RandomAccessFile>]) -> Result<()> {
    let mut headers = Vec::with_capacity(files.len());
    for file in files {
        headers.push(read_block(&**file, 0)?);
    }

    for (i, pair) in headers.windows(2).enumerate() {
        match (pair[0].parent_uuid(), pair[1].uuid()) {
            (Some(parent), Some(uuid)) => {
                if parent != uuid {
                    log::error!(
                        "parent uuid mismatch in layer {}: which uuid is {uuid}, expected {parent}",
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
