// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compaction: rewriting a set of live mappings into one sealed layer file.
//!
//! Payload is copied in mapping order, all-zero sectors become zeroed
//! mappings instead of bytes, the squashed index lands 4 KiB-padded behind
//! the payload, and a sealed trailer closes the file.

use crate::{
    coding::Encode,
    fs::{read_exact_at, write_all_at, RandomAccessFile},
    header::{write_block, HeaderTrailer},
    index::{merge_memory_indexes, squash, MemoryIndex},
    ro::{load_stack_indexes, verify_parent_chain},
    segment::{SegmentMapping, SECTOR_SIZE},
    Error, Result, MAX_STACK_LAYERS,
};
use std::sync::Arc;
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Identity overrides for a committed layer.
#[derive(Clone, Debug, Default)]
pub struct CommitArgs {
    /// Free-form tag for the new layer, at most 256 bytes.
    pub user_tag: Vec<u8>,
    /// Parent UUID override; defaults to the source's own parent linkage.
    pub parent_uuid: Option<Uuid>,
}

impl CommitArgs {
    /// Sets the user tag.
    #[must_use]
    pub fn with_user_tag(mut self, tag: impl Into<Vec<u8>>) -> Self {
        self.user_tag = tag.into();
        self
    }

    /// Sets the parent UUID of the committed layer.
    #[must_use]
    pub fn with_parent_uuid(mut self, parent: Uuid) -> Self {
        self.parent_uuid = Some(parent);
        self
    }
}

fn is_zero_sector(sector: &[u8]) -> bool {
    sector.iter().all(|&b| b == 0)
}

/// Copies one live mapping's payload from its source file into `dst`,
/// splitting out all-zero sectors as zeroed mappings.
///
/// `dst_tail` is the byte append cursor of `dst`; only real payload
/// advances it.
fn pcopy(
    src: &dyn RandomAccessFile,
    m: SegmentMapping,
    dst: &dyn RandomAccessFile,
    dst_tail: &mut u64,
    out: &mut Vec<SegmentMapping>,
) -> Result<()> {
    let mut src_offset = m.moffset() * SECTOR_SIZE;
    let mut logical = m.offset();
    let mut remaining = u64::from(m.length()) * SECTOR_SIZE;

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    while remaining > 0 {
        let step = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
        read_exact_at(src, &mut buf[..step], src_offset)?;

        let sectors = step / SECTOR_SIZE as usize;
        let mut i = 0;
        while i < sectors {
            let lo = i * SECTOR_SIZE as usize;
            let zero = is_zero_sector(&buf[lo..lo + SECTOR_SIZE as usize]);

            let mut run = 1;
            while i + run < sectors {
                let at = (i + run) * SECTOR_SIZE as usize;
                if is_zero_sector(&buf[at..at + SECTOR_SIZE as usize]) != zero {
                    break;
                }
                run += 1;
            }

            let mut piece = SegmentMapping::new(
                logical + i as u64,
                run as u32,
                *dst_tail / SECTOR_SIZE,
            );

            if zero {
                piece.set_zeroed(true);
            } else {
                let hi = lo + run * SECTOR_SIZE as usize;
                write_all_at(dst, &buf[lo..hi], *dst_tail)?;
                *dst_tail += (hi - lo) as u64;
            }

            log::debug!("push {piece:?}");
            out.push(piece);
            i += run;
        }

        src_offset += step as u64;
        logical += sectors as u64;
        remaining -= step as u64;
    }

    Ok(())
}

/// Rewrites `raw_index` (whose tags select files from the top-first
/// `src_files`) into `dst` as a single sealed layer.
pub(crate) fn compact(
    src_files: &[Arc<dyn RandomAccessFile>],
    raw_index: Vec<SegmentMapping>,
    virtual_size: u64,
    default_parent: Option<Uuid>,
    args: &CommitArgs,
    dst: &dyn RandomAccessFile,
) -> Result<()> {
    let space = HeaderTrailer::SPACE as u64;
    let parent = args.parent_uuid.or(default_parent);
    if parent.is_none() {
        log::warn!("parent uuid is null");
    }

    let mut header = HeaderTrailer::new(Uuid::new_v4(), parent);
    header.set_data_file();
    header.set_sealed();
    header.virtual_size = virtual_size;
    header.set_user_tag(&args.user_tag)?;
    write_block(dst, &header, 0)?;

    let mut dst_tail = space;
    let mut compacted = Vec::with_capacity(raw_index.len());

    for m in raw_index {
        if m.zeroed() {
            // no payload to move, just re-anchor the hole at the cursor
            let mut hole = SegmentMapping::new(m.offset(), m.length(), dst_tail / SECTOR_SIZE);
            hole.set_zeroed(true);
            compacted.push(hole);
            continue;
        }

        let src = src_files
            .get(m.tag() as usize)
            .ok_or(Error::InvalidFormat("mapping tag out of layer range"))?;
        pcopy(&**src, m, dst, &mut dst_tail, &mut compacted)?;
    }

    squash(&mut compacted);
    let index_size = compacted.len() as u64;
    let index_offset = dst_tail;

    let record_size = std::mem::size_of::<SegmentMapping>();
    let per_page = HeaderTrailer::SPACE / record_size;
    let padded = compacted.len().div_ceil(per_page) * per_page;
    compacted.resize(padded, SegmentMapping::invalid());
    log::debug!(
        "write index to destination, {index_size} mappings ({padded} with padding)"
    );

    let mut buf = Vec::with_capacity(padded * record_size);
    for m in &compacted {
        m.encode_into(&mut buf)?;
    }
    write_all_at(dst, &buf, dst_tail)?;
    dst_tail += buf.len() as u64;

    let mut trailer = header;
    trailer.set_trailer();
    trailer.index_offset = index_offset;
    trailer.index_size = index_size;
    write_block(dst, &trailer, dst_tail)?;

    dst.sync_all()?;
    Ok(())
}

/// Merges sealed layers (`files[0]` bottom-most) into one sealed layer in
/// `dst`: equivalent to opening the stack and committing it.
///
/// The destination's parent UUID defaults to the bottom-most source's.
pub fn merge_files(
    mut files: Vec<Arc<dyn RandomAccessFile>>,
    dst: &dyn RandomAccessFile,
    args: &CommitArgs,
) -> Result<()> {
    if files.len() > MAX_STACK_LAYERS {
        return Err(Error::TooManyLayers(files.len()));
    }
    if files.is_empty() {
        return Err(Error::InvalidFormat("empty layer stack"));
    }

    files.reverse();

    let loaded = load_stack_indexes(&files)?;
    verify_parent_chain(&loaded)?;

    let indexes: Vec<&MemoryIndex> = loaded.iter().map(|(_, i)| i).collect();
    let merged = merge_memory_indexes(&indexes)?;

    let virtual_size = loaded.first().map_or(0, |(ht, _)| ht.virtual_size);
    let bottom_parent = loaded.last().and_then(|(ht, _)| ht.parent_uuid());

    let raw: Vec<SegmentMapping> = merged.iter().copied().collect();
    compact(&files, raw, virtual_size, bottom_parent, args, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn zero_sector_predicate() {
        assert!(is_zero_sector(&[0u8; 512]));
        let mut sector = [0u8; 512];
        sector[511] = 1;
        assert!(!is_zero_sector(&sector));
    }
}
