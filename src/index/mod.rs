// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-memory index structures over [`SegmentMapping`] records.
//!
//! A layer's index is a sorted array of non-overlapping mappings. Read-only
//! layers use [`MemoryIndex`]; the writable top layer mutates an
//! [`Index0`](index0::Index0), and [`ComboIndex`](combo::ComboIndex) stitches
//! the two together into a single lookup surface.

pub(crate) mod combo;
pub(crate) mod index0;
mod level;

pub use combo::ComboIndex;
pub use index0::Index0;

use crate::{
    segment::{Segment, SegmentMapping, MAX_LENGTH},
    Error, Result, MAX_STACK_LAYERS,
};

/// Trims the first and last looked-up mapping so the result lies within `s`.
pub(crate) fn trim_edge_mappings(out: &mut [SegmentMapping], s: Segment) {
    if let Some(first) = out.first_mut() {
        if first.offset() < s.offset() {
            first.forward_offset_to(s.offset());
        }
    }
    if let Some(last) = out.last_mut() {
        if last.end() > s.end() {
            last.backward_end_to(s.end());
        }
    }
}

fn verify_mapping_order(mappings: &[SegmentMapping]) -> bool {
    mappings.windows(2).all(|w| w[0].end() <= w[1].offset())
}

fn within_window(m: SegmentMapping, begin: u64, end: u64) -> bool {
    if m.zeroed() {
        begin <= m.moffset() && m.moffset() <= end
    } else {
        m.length() > 0 && begin <= m.moffset() && m.mend() <= end
    }
}

pub(crate) fn verify_mapping_moffsets(
    mappings: &[SegmentMapping],
    begin: u64,
    end: u64,
) -> bool {
    for m in mappings {
        if !within_window(*m, begin, end) {
            log::error!(
                "mapped range [{}, {}) escapes data region [{begin}, {end}): {m:?}",
                m.moffset(),
                m.mend(),
            );
            return false;
        }
    }
    true
}

/// A sorted, immutable array of mappings with batched range lookup.
///
/// The backing buffer is exactly 16 bytes per mapping; large indexes get a
/// page cascade on top that narrows the binary search to one page.
#[derive(Debug)]
pub struct MemoryIndex {
    mappings: Vec<SegmentMapping>,
    levels: Vec<Vec<u64>>,
    block_count: u64,
}

impl MemoryIndex {
    /// Builds an index from sorted mappings, validating order and the
    /// mapped-offset window `[moffset_begin, moffset_end)` (in sectors).
    pub fn new(
        mappings: Vec<SegmentMapping>,
        moffset_begin: u64,
        moffset_end: u64,
    ) -> Result<Self> {
        if !verify_mapping_order(&mappings) {
            log::error!("incorrect segment mappings: disordered");
            return Err(Error::InvalidFormat("disordered segment mappings"));
        }
        if !verify_mapping_moffsets(&mappings, moffset_begin, moffset_end) {
            return Err(Error::InvalidFormat("mapped offset out of range"));
        }
        Ok(Self::from_sorted(mappings))
    }

    /// Builds an index from mappings that are known to be sorted and disjoint.
    pub(crate) fn from_sorted(mappings: Vec<SegmentMapping>) -> Self {
        debug_assert!(verify_mapping_order(&mappings));

        let block_count = mappings
            .iter()
            .filter(|m| !m.zeroed())
            .map(|m| u64::from(m.length()))
            .sum();

        let levels = level::build(&mappings);

        Self {
            mappings,
            levels,
            block_count,
        }
    }

    /// Number of mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether the index holds no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Number of live (non-zeroed) sectors.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// First mapping, if any.
    #[must_use]
    pub fn front(&self) -> Option<SegmentMapping> {
        self.mappings.first().copied()
    }

    /// Last mapping, if any.
    #[must_use]
    pub fn back(&self) -> Option<SegmentMapping> {
        self.mappings.last().copied()
    }

    /// Iterates over all mappings in order.
    pub fn iter(&self) -> impl Iterator<Item = &SegmentMapping> {
        self.mappings.iter()
    }

    pub(crate) fn mappings(&self) -> &[SegmentMapping] {
        &self.mappings
    }

    /// Adds `delta` to every stored mapping's layer tag.
    pub fn increase_tag(&mut self, delta: u8) {
        log::debug!("index tag add {delta}");
        for m in &mut self.mappings {
            let tag = m.tag() + delta;
            m.set_tag(tag);
        }
    }

    /// Index of the first mapping whose end exceeds `offset`.
    pub(crate) fn lower_bound(&self, offset: u64) -> usize {
        if self.levels.is_empty() {
            self.mappings.partition_point(|m| m.end() <= offset)
        } else {
            level::lower_bound(&self.levels, &self.mappings, offset)
        }
    }

    /// Looks up mappings intersecting `s`, storing them into `out`.
    ///
    /// Returns the number of stored mappings; the first and last are trimmed
    /// to lie within `s`. A full `out` means there may be more — callers
    /// continue past the last returned mapping's end.
    pub fn lookup(&self, s: Segment, out: &mut [SegmentMapping]) -> usize {
        if s.length() == 0 || out.is_empty() {
            return 0;
        }

        let start = self.lower_bound(s.offset());
        let mut n = 0;

        for m in self.mappings.iter().skip(start) {
            if m.offset() >= s.end() || n == out.len() {
                break;
            }
            out[n] = *m;
            n += 1;
        }

        trim_edge_mappings(&mut out[..n], s);
        n
    }
}

/// Merges a stack of per-layer indexes, `indexes[0]` being the top-most,
/// into one sorted index whose mapping tags identify the source layer.
///
/// The merge is stable and in-order: an upper layer shadows every lower
/// layer, and holes recurse downward. Sectors covered by no layer produce no
/// mapping at all.
pub fn merge_memory_indexes(indexes: &[&MemoryIndex]) -> Result<MemoryIndex> {
    if indexes.len() > MAX_STACK_LAYERS {
        log::error!("too many indexes to merge, {MAX_STACK_LAYERS} at most");
        return Err(Error::TooManyLayers(indexes.len()));
    }

    let mut merged = Vec::with_capacity(indexes.first().map_or(0, |i| i.len()));
    merge_into(0, &mut merged, indexes, 0, u64::MAX);
    Ok(MemoryIndex::from_sorted(merged))
}

fn merge_into(
    level: usize,
    out: &mut Vec<SegmentMapping>,
    stack: &[&MemoryIndex],
    mut begin: u64,
    end: u64,
) {
    let Some((top, rest)) = stack.split_first() else {
        return;
    };
    if begin >= end {
        return;
    }

    let begin0 = begin;
    let first_emitted = out.len();

    for m in top.mappings().iter().skip(top.lower_bound(begin)) {
        if m.offset() >= end {
            break;
        }
        if m.offset() > begin {
            merge_into(level + 1, out, rest, begin, m.offset());
        }
        let mut tagged = *m;
        tagged.set_tag(level as u8);
        out.push(tagged);
        begin = m.end();
    }

    if begin < end {
        merge_into(level + 1, out, rest, begin, end);
    }

    // edge mappings may poke out of [begin0, end)
    if out.len() > first_emitted {
        if let Some(first) = out.get_mut(first_emitted) {
            if first.offset() < begin0 {
                first.forward_offset_to(begin0);
            }
        }
        if let Some(last) = out.last_mut() {
            if last.end() > end {
                last.backward_end_to(end);
            }
        }
    }
}

/// Squashes adjacent mappings that are contiguous in both logical and mapped
/// space, share zeroed-ness and tag, and whose combined length still fits
/// the length field.
pub fn squash(mappings: &mut Vec<SegmentMapping>) {
    if mappings.len() < 2 {
        return;
    }

    let before = mappings.len();
    let mut kept = 0;

    for j in 1..mappings.len() {
        let cur = mappings[j];
        let acc = mappings[kept];

        let contiguous = acc.end() == cur.offset()
            && acc.mend() == cur.moffset()
            && acc.zeroed() == cur.zeroed()
            && acc.tag() == cur.tag()
            && acc.length() + cur.length() <= MAX_LENGTH;

        if contiguous {
            mappings[kept].set_length(acc.length() + cur.length());
        } else {
            kept += 1;
            mappings[kept] = cur;
        }
    }

    mappings.truncate(kept + 1);
    log::debug!("index squashed from {before} to {} mappings", mappings.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn m(offset: u64, length: u32, moffset: u64) -> SegmentMapping {
        SegmentMapping::new(offset, length, moffset)
    }

    fn zm(offset: u64, length: u32, moffset: u64) -> SegmentMapping {
        let mut z = m(offset, length, moffset);
        z.set_zeroed(true);
        z
    }

    #[test]
    fn memory_index_rejects_disorder() {
        let result = MemoryIndex::new(vec![m(0, 10, 8), m(5, 10, 18)], 8, 1_000);
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn memory_index_rejects_escaping_moffset() {
        let result = MemoryIndex::new(vec![m(0, 10, 995)], 8, 1_000);
        assert!(matches!(result, Err(Error::InvalidFormat(_))));

        // zeroed mappings only need their start within the window
        let ok = MemoryIndex::new(vec![zm(0, 10, 1_000)], 8, 1_000);
        assert!(ok.is_ok());
    }

    #[test]
    fn memory_index_lookup_trims_edges() -> Result<()> {
        let idx = MemoryIndex::new(vec![m(0, 100, 8), m(200, 100, 108)], 8, 1_000)?;

        let mut out = [SegmentMapping::default(); 16];
        let n = idx.lookup(Segment::new(50, 200), &mut out);
        assert_eq!(2, n);

        assert_eq!(50, out[0].offset());
        assert_eq!(100, out[0].end());
        assert_eq!(58, out[0].moffset());

        assert_eq!(200, out[1].offset());
        assert_eq!(250, out[1].end());
        assert_eq!(108, out[1].moffset());
        Ok(())
    }

    #[test]
    fn memory_index_lookup_signals_more() -> Result<()> {
        let mappings = (0..64).map(|i| m(i * 10, 5, 8 + i * 5)).collect();
        let idx = MemoryIndex::new(mappings, 8, 1_000)?;

        let mut out = [SegmentMapping::default(); 4];
        let n = idx.lookup(Segment::new(0, 640), &mut out);
        assert_eq!(4, n);

        // continue past the last returned end
        let n2 = idx.lookup(Segment::new(out[3].end(), 600), &mut out);
        assert_eq!(4, n2);
        assert_eq!(40, out[0].offset());
        Ok(())
    }

    #[test]
    fn memory_index_block_count_ignores_zeroed() -> Result<()> {
        let idx = MemoryIndex::new(vec![m(0, 10, 8), zm(20, 30, 18)], 8, 1_000)?;
        assert_eq!(10, idx.block_count());
        Ok(())
    }

    #[test]
    fn merge_prefers_upper_layers() -> Result<()> {
        let top = MemoryIndex::new(vec![m(10, 10, 8)], 8, 1_000)?;
        let bottom = MemoryIndex::new(vec![m(0, 40, 8)], 8, 1_000)?;

        let merged = merge_memory_indexes(&[&top, &bottom])?;
        let flat: Vec<_> = merged.iter().copied().collect();

        assert_eq!(3, flat.len());

        // hole before the top mapping comes from below
        assert_eq!((0, 10, 1), (flat[0].offset(), flat[0].end(), flat[0].tag()));
        // top shadows the middle
        assert_eq!((10, 20, 0), (flat[1].offset(), flat[1].end(), flat[1].tag()));
        // tail comes from below, trimmed forward
        assert_eq!((20, 40, 1), (flat[2].offset(), flat[2].end(), flat[2].tag()));
        assert_eq!(28, flat[2].moffset());
        Ok(())
    }

    #[test]
    fn merge_leaves_uncovered_sectors_unmapped() -> Result<()> {
        let top = MemoryIndex::new(vec![m(100, 10, 8)], 8, 1_000)?;
        let bottom = MemoryIndex::new(vec![m(300, 10, 8)], 8, 1_000)?;

        let merged = merge_memory_indexes(&[&top, &bottom])?;
        assert_eq!(2, merged.len());
        Ok(())
    }

    #[test]
    fn merge_rejects_too_many_layers() {
        let idx = MemoryIndex::from_sorted(vec![]);
        let stack = vec![&idx; MAX_STACK_LAYERS + 1];
        assert!(matches!(
            merge_memory_indexes(&stack),
            Err(Error::TooManyLayers(_))
        ));
    }

    #[test]
    fn increase_tag_rebases_every_mapping() -> Result<()> {
        let mut idx = MemoryIndex::new(vec![m(0, 10, 8), m(20, 10, 18)], 8, 1_000)?;
        idx.increase_tag(3);
        assert!(idx.iter().all(|m| m.tag() == 3));
        Ok(())
    }

    #[test]
    fn front_and_back() -> Result<()> {
        let empty = MemoryIndex::from_sorted(vec![]);
        assert!(empty.front().is_none());
        assert!(empty.back().is_none());

        let idx = MemoryIndex::new(vec![m(0, 10, 8), m(20, 10, 18)], 8, 1_000)?;
        assert_eq!(0, idx.front().map_or(99, |m| m.offset()));
        assert_eq!(20, idx.back().map_or(99, |m| m.offset()));
        Ok(())
    }

    #[test]
    fn squash_merges_contiguous_runs() {
        let mut mappings = vec![m(0, 8, 8), m(8, 8, 16), m(16, 8, 100), m(24, 8, 108)];
        squash(&mut mappings);

        assert_eq!(2, mappings.len());
        assert_eq!(16, mappings[0].length());
        assert_eq!(8, mappings[0].moffset());
        assert_eq!(100, mappings[1].moffset());
    }

    #[test]
    fn squash_respects_length_field_limit() {
        let mut mappings = vec![
            m(0, MAX_LENGTH, 8),
            m(u64::from(MAX_LENGTH), 8, 8 + u64::from(MAX_LENGTH)),
        ];
        squash(&mut mappings);
        assert_eq!(2, mappings.len());
    }

    #[test]
    fn squash_keeps_zeroed_and_live_apart() {
        let mut mappings = vec![m(0, 8, 8), zm(8, 8, 16)];
        squash(&mut mappings);
        assert_eq!(2, mappings.len());
    }
}
