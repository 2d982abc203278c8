// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{trim_edge_mappings, MemoryIndex};
use crate::segment::{Segment, SegmentMapping};
use std::collections::BTreeMap;
use std::ops::Bound;

/// The mutable index of a writable layer.
///
/// An ordered set of non-overlapping mappings keyed by logical offset.
/// [`Index0::insert`] splices the new mapping over whatever it overlaps,
/// so the set invariant ("neither overlaps nor is equal") holds after every
/// mutation and the most recent write always wins.
#[derive(Debug, Default)]
pub struct Index0 {
    map: BTreeMap<u64, SegmentMapping>,
    block_count: u64,
}

impl Index0 {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an index by replaying records in their append order.
    ///
    /// Later records splice over earlier ones, which is exactly the
    /// last-writer-wins semantics of the on-disk record log.
    pub fn replay(records: impl IntoIterator<Item = SegmentMapping>) -> Self {
        let mut index = Self::new();
        for m in records {
            index.insert(m);
        }
        index
    }

    /// Number of stored mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index holds no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of live (non-zeroed) sectors.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// First mapping, if any.
    #[must_use]
    pub fn front(&self) -> Option<SegmentMapping> {
        self.map.values().next().copied()
    }

    /// Last mapping, if any.
    #[must_use]
    pub fn back(&self) -> Option<SegmentMapping> {
        self.map.values().next_back().copied()
    }

    fn put(&mut self, m: SegmentMapping) {
        if !m.zeroed() {
            self.block_count += u64::from(m.length());
        }
        self.map.insert(m.offset(), m);
    }

    fn take(&mut self, offset: u64) {
        if let Some(p) = self.map.remove(&offset) {
            if !p.zeroed() {
                self.block_count -= u64::from(p.length());
            }
        }
    }

    /// Inserts a mapping, splicing it over everything it overlaps.
    ///
    /// Overlapped mappings are erased, shrunk at either edge, or split in
    /// two when the new mapping lands in their interior; zeroed-ness, tag
    /// and mapped offset of the survivors are preserved.
    pub fn insert(&mut self, m: SegmentMapping) {
        if m.length() == 0 {
            return;
        }

        let mut overlapping = Vec::new();

        // a neighbour starting at or before the new mapping may straddle it
        if let Some((_, p)) = self.map.range(..=m.offset()).next_back() {
            if p.end() > m.offset() {
                overlapping.push(*p);
            }
        }
        for (_, p) in self
            .map
            .range((Bound::Excluded(m.offset()), Bound::Unbounded))
        {
            if p.offset() >= m.end() {
                break;
            }
            overlapping.push(*p);
        }

        for p in overlapping {
            self.take(p.offset());

            if p.offset() < m.offset() {
                let mut left = p;
                left.backward_end_to(m.offset());
                self.put(left);
            }
            if p.end() > m.end() {
                let mut right = p;
                right.forward_offset_to(m.end());
                self.put(right);
            }
        }

        self.put(m);
    }

    /// Copies of all stored mappings intersecting `s`, untrimmed, in order.
    pub(crate) fn overlapping(
        &self,
        s: Segment,
    ) -> impl Iterator<Item = SegmentMapping> + '_ {
        let straddler = self
            .map
            .range(..=s.offset())
            .next_back()
            .map(|(_, p)| *p)
            .filter(|p| p.end() > s.offset());

        let rest = self
            .map
            .range((Bound::Excluded(s.offset()), Bound::Unbounded))
            .map(|(_, p)| *p)
            .take_while(move |p| p.offset() < s.end());

        straddler.into_iter().chain(rest)
    }

    /// Looks up mappings intersecting `s`; same contract as
    /// [`MemoryIndex::lookup`].
    pub fn lookup(&self, s: Segment, out: &mut [SegmentMapping]) -> usize {
        if s.length() == 0 || out.is_empty() {
            return 0;
        }

        let mut n = 0;
        for m in self.overlapping(s) {
            if n == out.len() {
                break;
            }
            out[n] = m;
            n += 1;
        }

        trim_edge_mappings(&mut out[..n], s);
        n
    }

    /// Dumps the index as a sorted array.
    ///
    /// With a non-zero `alignment_bytes`, the array is padded with sentinel
    /// records so its byte length becomes a multiple of the alignment.
    #[must_use]
    pub fn dump(&self, alignment_bytes: usize) -> Vec<SegmentMapping> {
        let mut out: Vec<SegmentMapping> = self.map.values().copied().collect();

        if alignment_bytes > 0 {
            let per_alignment = alignment_bytes / std::mem::size_of::<SegmentMapping>();
            debug_assert!(per_alignment > 0);
            let padded = out.len().div_ceil(per_alignment) * per_alignment;
            log::debug!("index dump, size: {padded} (mappings: {})", out.len());
            out.resize(padded, SegmentMapping::invalid());
        }

        out
    }

    /// Snapshots the current set into an immutable index.
    #[must_use]
    pub fn make_read_only(&self) -> MemoryIndex {
        MemoryIndex::from_sorted(self.map.values().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn m(offset: u64, length: u32, moffset: u64) -> SegmentMapping {
        SegmentMapping::new(offset, length, moffset)
    }

    fn flat(index: &Index0) -> Vec<(u64, u64, u64)> {
        index
            .dump(0)
            .iter()
            .map(|m| (m.offset(), m.end(), m.moffset()))
            .collect()
    }

    #[test]
    fn insert_zero_length_is_noop() {
        let mut index = Index0::new();
        index.insert(m(0, 0, 8));
        assert!(index.is_empty());
    }

    #[test]
    fn insert_erases_contained() {
        let mut index = Index0::new();
        index.insert(m(10, 10, 100));
        index.insert(m(0, 40, 200));

        assert_eq!(vec![(0, 40, 200)], flat(&index));
        assert_eq!(40, index.block_count());
    }

    #[test]
    fn insert_splits_interior() {
        let mut index = Index0::new();
        index.insert(m(0, 40, 100));
        index.insert(m(10, 10, 200));

        assert_eq!(
            vec![(0, 10, 100), (10, 20, 200), (20, 40, 120)],
            flat(&index)
        );
        assert_eq!(40, index.block_count());
    }

    #[test]
    fn insert_shrinks_overlapped_edges() {
        let mut index = Index0::new();
        index.insert(m(0, 20, 100));
        index.insert(m(30, 20, 200));
        index.insert(m(10, 30, 300));

        assert_eq!(
            vec![(0, 10, 100), (10, 40, 300), (40, 50, 210)],
            flat(&index)
        );
        assert_eq!(50, index.block_count());
    }

    #[test]
    fn insert_identity_is_idempotent() {
        let mut a = Index0::new();
        a.insert(m(5, 10, 100));
        a.insert(m(5, 10, 100));

        let mut b = Index0::new();
        b.insert(m(5, 10, 100));

        assert_eq!(flat(&b), flat(&a));
        assert_eq!(b.block_count(), a.block_count());
    }

    #[test]
    fn insert_zeroed_drops_block_count() {
        let mut index = Index0::new();
        index.insert(m(0, 8, 100));
        assert_eq!(8, index.block_count());

        let mut hole = m(0, 8, 100);
        hole.set_zeroed(true);
        index.insert(hole);

        assert_eq!(0, index.block_count());
        assert_eq!(1, index.len());
    }

    #[test]
    fn split_preserves_zeroed_and_tag() {
        let mut big = m(0, 40, 100);
        big.set_tag(0);

        let mut index = Index0::new();
        index.insert(big);
        index.insert(m(10, 10, 200));

        let parts = index.dump(0);
        assert_eq!(120, parts[2].moffset());
        assert_eq!(40, parts[2].end());
    }

    #[test]
    fn lookup_matches_contract() {
        let mut index = Index0::new();
        index.insert(m(0, 100, 100));
        index.insert(m(200, 100, 300));

        let mut out = [SegmentMapping::default(); 16];
        let n = index.lookup(Segment::new(50, 200), &mut out);

        assert_eq!(2, n);
        assert_eq!(50, out[0].offset());
        assert_eq!(150, out[0].moffset());
        assert_eq!(250, out[1].end());
    }

    #[test]
    fn dump_pads_to_alignment() {
        let mut index = Index0::new();
        for i in 0..3 {
            index.insert(m(i * 100, 8, 8 + i * 8));
        }

        let dumped = index.dump(512);
        assert_eq!(32, dumped.len());
        assert!(dumped[3..].iter().all(|m| !m.is_valid()));
        assert_eq!(3, dumped.iter().filter(|m| m.is_valid()).count());
    }

    #[test]
    fn front_and_back_span_the_set() {
        let mut index = Index0::new();
        assert!(index.front().is_none());
        assert!(index.back().is_none());

        index.insert(m(100, 8, 8));
        index.insert(m(0, 8, 16));
        assert_eq!(0, index.front().map_or(99, |m| m.offset()));
        assert_eq!(100, index.back().map_or(99, |m| m.offset()));
    }

    #[test]
    fn make_read_only_round_trip() {
        let mut index = Index0::new();
        index.insert(m(0, 8, 8));
        index.insert(m(16, 8, 16));

        let ro = index.make_read_only();
        assert_eq!(2, ro.len());
        assert_eq!(index.block_count(), ro.block_count());
    }
}
