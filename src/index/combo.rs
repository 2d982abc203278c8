// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{trim_edge_mappings, Index0, MemoryIndex};
use crate::segment::{Segment, SegmentMapping};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct Backing {
    index: Arc<MemoryIndex>,
    top_tag: u8,
}

/// A two-level lookup view: a mutable top index over a read-only backing
/// index.
///
/// Top mappings shadow the backing; a lookup never returns overlapping
/// mappings from the two sources. Mappings surfaced from the top carry the
/// tag one above the highest backing layer, so readers always know which
/// data file owns the bytes.
///
/// The top is mutated only through [`ComboIndex::insert`] (callers serialize
/// behind the device write mutex); lookups take the shared side of the locks
/// and never block each other.
pub struct ComboIndex {
    top: RwLock<Index0>,
    backing: RwLock<Backing>,
}

impl ComboIndex {
    /// Composes `top` over `backing`; `ro_layer_count` is the number of
    /// read-only layers below (and becomes the tag of top mappings).
    #[must_use]
    pub fn new(top: Index0, backing: Arc<MemoryIndex>, ro_layer_count: u8) -> Self {
        Self {
            top: RwLock::new(top),
            backing: RwLock::new(Backing {
                index: backing,
                top_tag: ro_layer_count,
            }),
        }
    }

    /// A view with no backing layers at all (a freshly created writable
    /// layer).
    #[must_use]
    pub fn unstacked(top: Index0) -> Self {
        Self::new(top, Arc::new(MemoryIndex::from_sorted(Vec::new())), 0)
    }

    #[allow(clippy::expect_used)]
    fn top_read(&self) -> RwLockReadGuard<'_, Index0> {
        self.top.read().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    fn top_write(&self) -> RwLockWriteGuard<'_, Index0> {
        self.top.write().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    fn backing_read(&self) -> RwLockReadGuard<'_, Backing> {
        self.backing.read().expect("lock is poisoned")
    }

    /// The tag assigned to top mappings (= number of backing layers).
    #[must_use]
    pub fn top_tag(&self) -> u8 {
        self.backing_read().top_tag
    }

    /// Number of mappings in the top index.
    #[must_use]
    pub fn top_len(&self) -> usize {
        self.top_read().len()
    }

    /// Live sectors of the top (writable) layer.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.top_read().block_count()
    }

    /// Splices a mapping into the top index.
    pub fn insert(&self, m: SegmentMapping) {
        self.top_write().insert(m);
    }

    /// Replaces the backing index (used when restacking the same writable
    /// top over a different read-only set).
    #[allow(clippy::expect_used)]
    pub fn reseat_backing(&self, index: Arc<MemoryIndex>, ro_layer_count: u8) {
        let mut backing = self.backing.write().expect("lock is poisoned");
        backing.index = index;
        backing.top_tag = ro_layer_count;
    }

    /// Copies the backing mappings whose tag falls within `[lo, hi)` into a
    /// fresh index; `None` when the range is empty.
    #[must_use]
    pub fn project_backing(&self, lo: u8, hi: u8) -> Option<MemoryIndex> {
        if lo >= hi {
            return None;
        }

        let backing = self.backing_read();
        let range: Vec<SegmentMapping> = backing
            .index
            .iter()
            .filter(|m| m.tag() >= lo && m.tag() < hi)
            .copied()
            .collect();

        log::debug!("index size in tag range [{lo},{hi}): {}", range.len());

        if range.is_empty() {
            None
        } else {
            Some(MemoryIndex::from_sorted(range))
        }
    }

    /// Dumps the top index as a sorted array; see [`Index0::dump`].
    #[must_use]
    pub fn dump_top(&self, alignment_bytes: usize) -> Vec<SegmentMapping> {
        self.top_read().dump(alignment_bytes)
    }

    /// Looks up mappings intersecting `s`; same contract as
    /// [`MemoryIndex::lookup`].
    ///
    /// Each sub-range is served by the top index if it covers it, otherwise
    /// by the backing index restricted to the uncovered hole.
    pub fn lookup(&self, s: Segment, out: &mut [SegmentMapping]) -> usize {
        if s.length() == 0 || out.is_empty() {
            return 0;
        }

        let top = self.top_read();
        let backing = self.backing_read();

        let mut n = 0;
        let mut pos = s.offset();
        let send = s.end();

        for t in top.overlapping(s) {
            if n == out.len() {
                break;
            }
            if t.offset() > pos {
                let hole = Segment::new(pos, (t.offset() - pos) as u32);
                n += backing.index.lookup(hole, &mut out[n..]);
                if n == out.len() {
                    break;
                }
            }
            pos = t.end();

            let mut m = t;
            m.set_tag(backing.top_tag);
            out[n] = m;
            n += 1;

            if pos >= send {
                break;
            }
        }

        if n < out.len() && pos < send {
            let hole = Segment::new(pos, (send - pos) as u32);
            n += backing.index.lookup(hole, &mut out[n..]);
        }

        trim_edge_mappings(&mut out[..n], s);
        n
    }
}
