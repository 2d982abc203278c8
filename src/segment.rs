// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Sector size in bytes; all index offsets and lengths are sector-granular.
pub const SECTOR_SIZE: u64 = 512;

const OFFSET_BITS: u32 = 50;
const LENGTH_BITS: u32 = 14;
const MOFFSET_BITS: u32 = 55;

const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const MOFFSET_MASK: u64 = (1 << MOFFSET_BITS) - 1;
const ZEROED_BIT: u64 = 1 << MOFFSET_BITS;
const TAG_SHIFT: u32 = 56;

/// Largest encodable sector offset, doubling as the padding sentinel.
///
/// Index regions are padded to their alignment with records whose offset is
/// this value; loaders drop them.
pub const INVALID_OFFSET: u64 = OFFSET_MASK;

/// Largest encodable mapping length in sectors.
pub const MAX_LENGTH: u32 = (1 << LENGTH_BITS) - 1;

/// A logical sector range `[offset, offset + length)`.
///
/// Packed into 8 bytes: bits 0..50 hold the offset, bits 50..64 the length.
/// The packing is the canonical one, shared by the in-memory index arrays
/// and the on-disk index regions.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Segment(u64);

impl Segment {
    /// Creates a segment; offset and length must fit their bit fields.
    #[must_use]
    pub fn new(offset: u64, length: u32) -> Self {
        assert!(offset <= OFFSET_MASK, "segment offset out of range");
        assert!(length <= MAX_LENGTH, "segment length out of range");
        Self(offset | (u64::from(length) << OFFSET_BITS))
    }

    /// Start sector.
    #[must_use]
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Length in sectors.
    #[must_use]
    pub fn length(self) -> u32 {
        (self.0 >> OFFSET_BITS) as u32
    }

    /// One-past-the-end sector.
    #[must_use]
    pub fn end(self) -> u64 {
        self.offset() + u64::from(self.length())
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        assert!(offset <= OFFSET_MASK, "segment offset out of range");
        self.0 = (self.0 & !OFFSET_MASK) | offset;
    }

    pub(crate) fn set_length(&mut self, length: u32) {
        assert!(length <= MAX_LENGTH, "segment length out of range");
        self.0 = (self.0 & OFFSET_MASK) | (u64::from(length) << OFFSET_BITS);
    }

    /// Moves the start forward to `x`, shrinking the segment.
    ///
    /// Panics unless `offset <= x <= end`; the caller clamps first.
    pub fn forward_offset_to(&mut self, x: u64) {
        assert!(self.offset() <= x && x <= self.end(), "cannot forward out of range");
        let length = (self.end() - x) as u32;
        self.set_offset(x);
        self.set_length(length);
    }

    /// Moves the end backward to `x`, shrinking the segment.
    ///
    /// Panics unless `offset < x <= end`.
    pub fn backward_end_to(&mut self, x: u64) {
        assert!(self.offset() < x && x <= self.end(), "cannot shrink end out of range");
        self.set_length((x - self.offset()) as u32);
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment[{}, {})", self.offset(), self.end())
    }
}

/// A logical→physical mapping record.
///
/// Packed into 16 bytes: a [`Segment`], then a second little-endian word
/// holding the mapped offset (bits 0..55), the zeroed bit (55) and the layer
/// tag (bits 56..64). A set zeroed bit marks a hole: the range reads as
/// zeroes and the mapped offset is informational only.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct SegmentMapping {
    seg: Segment,
    loc: u64,
}

impl SegmentMapping {
    /// Creates a live (non-zeroed, tag 0) mapping.
    #[must_use]
    pub fn new(offset: u64, length: u32, moffset: u64) -> Self {
        assert!(moffset <= MOFFSET_MASK, "mapped offset out of range");
        Self {
            seg: Segment::new(offset, length),
            loc: moffset,
        }
    }

    /// The padding sentinel record.
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            seg: Segment::new(INVALID_OFFSET, 0),
            loc: 0,
        }
    }

    /// Whether this record is a real mapping (not padding).
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.seg.offset() != INVALID_OFFSET
    }

    /// The logical sector range.
    #[must_use]
    pub fn segment(self) -> Segment {
        self.seg
    }

    /// Start sector in logical space.
    #[must_use]
    pub fn offset(self) -> u64 {
        self.seg.offset()
    }

    /// Length in sectors.
    #[must_use]
    pub fn length(self) -> u32 {
        self.seg.length()
    }

    /// One-past-the-end sector in logical space.
    #[must_use]
    pub fn end(self) -> u64 {
        self.seg.end()
    }

    /// Start sector in the owning data file.
    #[must_use]
    pub fn moffset(self) -> u64 {
        self.loc & MOFFSET_MASK
    }

    /// One-past-the-end sector in the owning data file.
    ///
    /// A zeroed mapping occupies no bytes, so its mapped end equals its
    /// mapped offset.
    #[must_use]
    pub fn mend(self) -> u64 {
        if self.zeroed() {
            self.moffset()
        } else {
            self.moffset() + u64::from(self.length())
        }
    }

    /// Whether the range is a hole.
    #[must_use]
    pub fn zeroed(self) -> bool {
        (self.loc & ZEROED_BIT) != 0
    }

    /// Which data file of the layer list supplies the bytes.
    #[must_use]
    pub fn tag(self) -> u8 {
        (self.loc >> TAG_SHIFT) as u8
    }

    pub(crate) fn set_length(&mut self, length: u32) {
        self.seg.set_length(length);
    }

    pub(crate) fn set_moffset(&mut self, moffset: u64) {
        assert!(moffset <= MOFFSET_MASK, "mapped offset out of range");
        self.loc = (self.loc & !MOFFSET_MASK) | moffset;
    }

    pub(crate) fn set_zeroed(&mut self, zeroed: bool) {
        if zeroed {
            self.loc |= ZEROED_BIT;
        } else {
            self.loc &= !ZEROED_BIT;
        }
    }

    pub(crate) fn set_tag(&mut self, tag: u8) {
        self.loc = (self.loc & !(0xFF << TAG_SHIFT)) | (u64::from(tag) << TAG_SHIFT);
    }

    /// Moves the logical start forward to `x`, advancing the mapped offset
    /// by the same distance for live mappings.
    pub fn forward_offset_to(&mut self, x: u64) {
        let delta = x - self.offset();
        self.seg.forward_offset_to(x);
        if !self.zeroed() {
            self.set_moffset(self.moffset() + delta);
        }
    }

    /// Moves the logical end backward to `x`.
    pub fn backward_end_to(&mut self, x: u64) {
        self.seg.backward_end_to(x);
    }

    /// Clamps the mapping to lie within `bound`, preserving zeroed-ness and tag.
    pub fn trim_to(&mut self, bound: Segment) {
        if self.offset() < bound.offset() {
            self.forward_offset_to(bound.offset());
        }
        if self.end() > bound.end() {
            self.backward_end_to(bound.end());
        }
    }
}

impl std::fmt::Debug for SegmentMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} -> Mapping[{}, zeroed={}, tag={}]",
            self.seg,
            self.moffset(),
            u8::from(self.zeroed()),
            self.tag(),
        )
    }
}

impl Encode for SegmentMapping {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.seg.0)?;
        writer.write_u64::<LittleEndian>(self.loc)?;
        Ok(())
    }
}

impl Decode for SegmentMapping {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let seg = reader.read_u64::<LittleEndian>()?;
        let loc = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            seg: Segment(seg),
            loc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn segment_packing() {
        let s = Segment::new(0x0003_FFFF_FFFF_FFFE, MAX_LENGTH);
        assert_eq!(0x0003_FFFF_FFFF_FFFE, s.offset());
        assert_eq!(MAX_LENGTH, s.length());
        assert_eq!(0x0003_FFFF_FFFF_FFFE + u64::from(MAX_LENGTH), s.end());
    }

    #[test]
    fn segment_trim_math() {
        let mut s = Segment::new(100, 50);
        s.forward_offset_to(120);
        assert_eq!(120, s.offset());
        assert_eq!(30, s.length());
        s.backward_end_to(140);
        assert_eq!(140, s.end());
        assert_eq!(20, s.length());
    }

    #[test]
    #[should_panic(expected = "cannot forward out of range")]
    fn segment_forward_past_end_panics() {
        let mut s = Segment::new(0, 8);
        s.forward_offset_to(9);
    }

    #[test]
    fn mapping_packing() {
        let mut m = SegmentMapping::new(1234, 8, 0x007F_FFFF_FFFF_FFFE);
        m.set_tag(0xAB);
        assert_eq!(1234, m.offset());
        assert_eq!(8, m.length());
        assert_eq!(0x007F_FFFF_FFFF_FFFE, m.moffset());
        assert_eq!(0xAB, m.tag());
        assert!(!m.zeroed());

        m.set_zeroed(true);
        assert!(m.zeroed());
        assert_eq!(m.moffset(), m.mend());
    }

    #[test]
    fn mapping_forward_advances_moffset() {
        let mut m = SegmentMapping::new(16, 16, 100);
        m.forward_offset_to(24);
        assert_eq!(24, m.offset());
        assert_eq!(8, m.length());
        assert_eq!(108, m.moffset());

        let mut z = SegmentMapping::new(16, 16, 100);
        z.set_zeroed(true);
        z.forward_offset_to(24);
        assert_eq!(100, z.moffset());
    }

    #[test]
    fn mapping_trim_to_bound() {
        let mut m = SegmentMapping::new(0, 64, 8);
        m.trim_to(Segment::new(8, 16));
        assert_eq!(8, m.offset());
        assert_eq!(24, m.end());
        assert_eq!(16, m.moffset());
    }

    #[test]
    fn mapping_codec_roundtrip() {
        let mut m = SegmentMapping::new(777, 42, 12345);
        m.set_tag(3);
        m.set_zeroed(true);

        let buf = m.encode_into_vec();
        assert_eq!(16, buf.len());

        let mut cursor = std::io::Cursor::new(buf);
        let out = SegmentMapping::decode_from(&mut cursor).expect("should decode");
        assert_eq!(m, out);
    }

    #[test]
    fn sentinel_is_invalid() {
        assert!(!SegmentMapping::invalid().is_valid());
        assert!(SegmentMapping::new(0, 1, 0).is_valid());
    }
}
