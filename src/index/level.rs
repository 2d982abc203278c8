// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Page cascade accelerating the index binary search.
//!
//! Each level holds the first logical offset of every page of the level
//! below (4 KiB pages: 256 mappings at the bottom, 512 offsets above).
//! Lookup walks the cascade coarsest-first, narrowing the final search to a
//! single page. Results are identical to searching the flat array.

use crate::segment::SegmentMapping;

const PAGE_SIZE: usize = 4096;
const BOTTOM_FANOUT: usize = PAGE_SIZE / std::mem::size_of::<SegmentMapping>();
const UPPER_FANOUT: usize = PAGE_SIZE / std::mem::size_of::<u64>();

/// Builds the cascade, coarsest level first. Small indexes get none.
pub(crate) fn build(mappings: &[SegmentMapping]) -> Vec<Vec<u64>> {
    if mappings.len() <= BOTTOM_FANOUT {
        return Vec::new();
    }

    let mut levels = Vec::new();

    let bottom: Vec<u64> = mappings
        .chunks(BOTTOM_FANOUT)
        .filter_map(|page| page.first().map(|m| m.offset()))
        .collect();
    levels.push(bottom);

    while levels.last().is_some_and(|l| l.len() > UPPER_FANOUT) {
        let coarser: Vec<u64> = levels
            .last()
            .map(|finer| {
                finer
                    .chunks(UPPER_FANOUT)
                    .filter_map(|page| page.first().copied())
                    .collect()
            })
            .unwrap_or_default();
        levels.push(coarser);
    }

    levels.reverse();

    let shape: Vec<usize> = levels.iter().map(Vec::len).collect();
    log::info!(
        "created level index, depth: {}, elements per level {shape:?} over {} mappings",
        levels.len(),
        mappings.len()
    );

    levels
}

/// Index of the first mapping whose end exceeds `offset`, narrowed through
/// the cascade.
pub(crate) fn lower_bound(
    levels: &[Vec<u64>],
    mappings: &[SegmentMapping],
    offset: u64,
) -> usize {
    let mut lo = 0usize;
    let mut hi = levels.first().map_or(0, Vec::len);

    for (depth, level) in levels.iter().enumerate() {
        let window = &level[lo..hi.min(level.len())];
        let page = lo + window.partition_point(|&first| first < offset);

        // everything starts at or past `offset`
        if page == 0 {
            return 0;
        }

        let bottom = depth == levels.len() - 1;
        let fanout = if bottom { BOTTOM_FANOUT } else { UPPER_FANOUT };
        let child_len = if bottom {
            mappings.len()
        } else {
            levels.get(depth + 1).map_or(0, Vec::len)
        };

        lo = (page - 1) * fanout;
        hi = (page * fanout).min(child_len);
    }

    lo + mappings[lo..hi].partition_point(|m| m.end() <= offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn dense(n: u64) -> Vec<SegmentMapping> {
        // gap of one sector between neighbours, so end <= next offset holds
        (0..n)
            .map(|i| SegmentMapping::new(i * 9, 8, 8 + i * 8))
            .collect()
    }

    #[test]
    fn small_index_builds_no_levels() {
        assert!(build(&dense(BOTTOM_FANOUT as u64)).is_empty());
        assert!(!build(&dense(BOTTOM_FANOUT as u64 + 1)).is_empty());
    }

    #[test]
    fn cascade_deepens_with_size() {
        let one = build(&dense(BOTTOM_FANOUT as u64 * 4));
        assert_eq!(1, one.len());

        let two = build(&dense((BOTTOM_FANOUT * UPPER_FANOUT) as u64 + 1));
        assert_eq!(2, two.len());
    }

    #[test]
    fn lower_bound_matches_flat_search() {
        let mappings = dense(BOTTOM_FANOUT as u64 * 3 + 17);
        let levels = build(&mappings);
        assert!(!levels.is_empty());

        for offset in (0..mappings.len() as u64 * 9 + 20).step_by(3) {
            let flat = mappings.partition_point(|m| m.end() <= offset);
            let narrowed = lower_bound(&levels, &mappings, offset);
            assert_eq!(flat, narrowed, "diverged at offset {offset}");
        }
    }
}
