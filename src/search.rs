//! Offset discovery tables.
//!
//! Both tables look at the sector `SEARCH_SECTOR` sectors into the track
//! and are filled once per pass over the stream, independent of how many
//! offsets are registered with the engine.
//!
//! - [`ChecksumSearch`] keeps plain and index-weighted prefix sums of frame
//!   values, so the AccurateRip-style sum of any 588-frame window in range
//!   is the difference of two prefix values.
//! - [`CrcSearch`] keeps one CRC32 per candidate shift, each covering that
//!   shift's 588-frame window.

#![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]

use crate::{
    constants::{SEARCH_SECTOR, SECTOR_FRAMES},
    crc::CrcAccumulator,
    error::{Error, Result},
    types::Offset,
};

/// First frame (0-based) of the search sector at offset zero
const SEARCH_START: u64 = (SEARCH_SECTOR * SECTOR_FRAMES) as u64;

/// Largest search range the search sector leaves room for
pub const MAX_SEARCH_RANGE: u32 = (SEARCH_SECTOR * SECTOR_FRAMES) as u32;

/// Owned table with one slot per offset in `[-range, range]`.
///
/// Slots are only reachable through the checked accessors.
#[derive(Debug, Clone)]
pub struct OffsetTable<T> {
    values: Vec<T>,
    range: u32,
}

impl<T: Clone> OffsetTable<T> {
    /// Allocate a table for offsets in `[-range, range]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the slots cannot be allocated.
    pub fn new(range: u32, init: T) -> Result<Self> {
        let len = 2 * range as usize + 1;
        let mut values = Vec::new();
        values.try_reserve_exact(len)?;
        values.resize(len, init);
        Ok(Self { values, range })
    }
}

impl<T> OffsetTable<T> {
    /// Largest offset magnitude covered.
    #[inline]
    pub fn range(&self) -> u32 {
        self.range
    }

    #[inline]
    fn slot(&self, offset: Offset) -> Option<usize> {
        let index = i64::from(offset) + i64::from(self.range);
        usize::try_from(index).ok().filter(|i| *i < self.values.len())
    }

    /// Slot for an offset, if in range.
    pub fn get(&self, offset: Offset) -> Option<&T> {
        self.slot(offset).map(|i| &self.values[i])
    }

    /// Mutable slot for an offset, if in range.
    pub fn get_mut(&mut self, offset: Offset) -> Option<&mut T> {
        self.slot(offset).map(move |i| &mut self.values[i])
    }

    /// Iterate over `(offset, slot)` pairs in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = (Offset, &T)> + '_ {
        let range = self.range as Offset;
        self.values
            .iter()
            .enumerate()
            .map(move |(i, v)| (i as Offset - range, v))
    }
}

/// Prefix sums for the rolling-sum offset search.
#[derive(Debug, Clone)]
pub struct ChecksumSearch {
    /// Search range in frames
    range: u32,
    /// Track frame (0-based) stored at local index 1
    first: u64,
    /// `weighted[k]` is the sum of `i * value_i` for local `i <= k`
    weighted: Vec<u64>,
    /// `plain[k]` is the sum of `value_i` for local `i <= k`
    plain: Vec<u64>,
    /// Number of frames stored
    filled: usize,
}

impl ChecksumSearch {
    /// Allocate tables for offsets in `[-range, range]`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the range reaches before the track start,
    /// or an allocation error.
    pub fn new(range: u32) -> Result<Self> {
        if range > MAX_SEARCH_RANGE {
            return Err(Error::InvalidConfig(format!(
                "checksum search range {range} exceeds {MAX_SEARCH_RANGE}"
            )));
        }
        let len = 2 * range as usize + SECTOR_FRAMES + 1;
        let mut weighted = Vec::new();
        weighted.try_reserve_exact(len)?;
        weighted.resize(len, 0);
        let mut plain = Vec::new();
        plain.try_reserve_exact(len)?;
        plain.resize(len, 0);
        Ok(Self {
            range,
            first: SEARCH_START - u64::from(range),
            weighted,
            plain,
            filled: 0,
        })
    }

    /// Number of frames the table spans.
    #[inline]
    fn span(&self) -> usize {
        self.weighted.len() - 1
    }

    /// Add the frame values of a block whose first frame sits at `start`.
    pub fn feed(&mut self, start: u64, values: &[u32]) {
        let next = self.first + self.filled as u64;
        let end = start + values.len() as u64;
        let stop = (self.first + self.span() as u64).min(end);
        if next < start || next >= stop {
            return;
        }
        for &value in &values[(next - start) as usize..(stop - start) as usize] {
            let k = self.filled + 1;
            let value = u64::from(value);
            self.weighted[k] = self.weighted[k - 1].wrapping_add((k as u64).wrapping_mul(value));
            self.plain[k] = self.plain[k - 1].wrapping_add(value);
            self.filled = k;
        }
    }

    /// Every offset whose windowed sum matches `reference`.
    ///
    /// A zero reference never matches.
    pub fn find(&self, reference: u32) -> Vec<Offset> {
        if reference == 0 {
            return Vec::new();
        }
        let mut found = Vec::new();
        for c in 0..=2 * self.range as usize {
            let hi = c + SECTOR_FRAMES;
            if hi > self.filled {
                break;
            }
            let weighted = self.weighted[hi].wrapping_sub(self.weighted[c]);
            let plain = self.plain[hi].wrapping_sub(self.plain[c]);
            let sum = weighted.wrapping_sub((c as u64).wrapping_mul(plain));
            if sum as u32 == reference {
                found.push(c as Offset - self.range as Offset);
            }
        }
        found
    }

    /// Forget all stored frames.
    pub fn clear(&mut self) {
        self.filled = 0;
    }
}

/// Shift-indexed CRC32 table for the CRC offset search.
#[derive(Debug, Clone)]
pub struct CrcSearch {
    table: OffsetTable<CrcAccumulator>,
    /// Bytes in one complete window
    window_bytes: u64,
}

impl CrcSearch {
    /// Allocate one accumulator per shift in `[-range, range]`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the range reaches before the track start,
    /// or an allocation error.
    pub fn new(range: u32, bytes_per_frame: usize) -> Result<Self> {
        if range > MAX_SEARCH_RANGE {
            return Err(Error::InvalidConfig(format!(
                "CRC search range {range} exceeds {MAX_SEARCH_RANGE}"
            )));
        }
        Ok(Self {
            table: OffsetTable::new(range, CrcAccumulator::new())?,
            window_bytes: (SECTOR_FRAMES * bytes_per_frame) as u64,
        })
    }

    /// Hash the bytes of a block whose first frame sits at `start`.
    ///
    /// `bytes` is the little-endian image of the block.
    pub fn feed(&mut self, start: u64, bytes: &[u8], bytes_per_frame: usize) {
        let frames = (bytes.len() / bytes_per_frame) as i64;
        let start = start as i64;
        let end = start + frames;
        let origin = SEARCH_START as i64;
        let range = i64::from(self.table.range());
        let sector = SECTOR_FRAMES as i64;

        // Shifts whose window [origin + k, origin + k + sector) meets the block
        let lo = (start - origin - sector + 1).max(-range);
        let hi = (end - 1 - origin).min(range);
        for shift in lo..=hi {
            let first = origin + shift;
            let from = first.max(start);
            let to = (first + sector).min(end);
            if from >= to {
                continue;
            }
            if let Some(acc) = self.table.get_mut(shift as Offset) {
                let a = (from - start) as usize * bytes_per_frame;
                let b = (to - start) as usize * bytes_per_frame;
                acc.update(&bytes[a..b]);
            }
        }
    }

    /// Every shift whose complete window hashes to `reference`.
    pub fn find(&self, reference: u32) -> Vec<Offset> {
        self.table
            .iter()
            .filter(|(_, acc)| acc.len() == self.window_bytes && acc.piece().crc == reference)
            .map(|(shift, _)| shift)
            .collect()
    }

    /// Forget all hashed bytes.
    pub fn clear(&mut self) {
        for shift in -(self.table.range() as Offset)..=self.table.range() as Offset {
            if let Some(acc) = self.table.get_mut(shift) {
                acc.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::{sample_bytes, CrcPiece};
    use crate::types::frame_value;

    fn noise(frames: usize, seed: u32) -> Vec<i16> {
        let mut state = seed;
        (0..frames * 2)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 16) as i16
            })
            .collect()
    }

    #[test]
    fn test_offset_table_bounds() {
        let mut table = OffsetTable::new(3, 0u8).unwrap();
        assert!(table.get(-3).is_some());
        assert!(table.get(3).is_some());
        assert!(table.get(4).is_none());
        assert!(table.get(-4).is_none());
        *table.get_mut(-3).unwrap() = 7;
        let first = table.iter().next().unwrap();
        assert_eq!(first, (-3, &7));
        assert_eq!(table.iter().count(), 7);
    }

    #[test]
    fn test_checksum_search_finds_shift() {
        let range = 64;
        let frames = SEARCH_SECTOR * SECTOR_FRAMES + 2 * SECTOR_FRAMES;
        let samples = noise(frames, 1);
        let values: Vec<u32> = samples.chunks(2).map(frame_value).collect();

        let mut search = ChecksumSearch::new(range).unwrap();
        for (i, block) in values.chunks(1000).enumerate() {
            search.feed((i * 1000) as u64, block);
        }

        for shift in [-64i64, -1, 0, 17, 64] {
            let begin = (SEARCH_START as i64 + shift) as usize;
            let reference = values[begin..begin + SECTOR_FRAMES]
                .iter()
                .enumerate()
                .fold(0u64, |acc, (m, v)| {
                    acc.wrapping_add((m as u64 + 1) * u64::from(*v))
                }) as u32;
            assert!(search.find(reference).contains(&(shift as Offset)), "{shift}");
        }
    }

    #[test]
    fn test_checksum_search_zero_reference() {
        let mut search = ChecksumSearch::new(16).unwrap();
        // All-zero audio makes every windowed sum zero
        search.feed(0, &vec![0u32; SEARCH_SECTOR * SECTOR_FRAMES + 1000]);
        assert!(search.find(0).is_empty());
    }

    #[test]
    fn test_checksum_search_short_track() {
        let mut search = ChecksumSearch::new(16).unwrap();
        search.feed(0, &vec![1u32; 1000]);
        assert!(search.find(1).is_empty());
    }

    #[test]
    fn test_range_limit() {
        assert!(ChecksumSearch::new(MAX_SEARCH_RANGE + 1).is_err());
        assert!(CrcSearch::new(MAX_SEARCH_RANGE + 1, 4).is_err());
    }

    #[test]
    fn test_crc_search_finds_shift() {
        let range = 100;
        let frames = SEARCH_SECTOR * SECTOR_FRAMES + 2 * SECTOR_FRAMES;
        let samples = noise(frames, 2);
        let mut search = CrcSearch::new(range, 4).unwrap();

        let mut bytes = Vec::new();
        for (i, block) in samples.chunks(2 * 777).enumerate() {
            sample_bytes(block, &mut bytes);
            search.feed((i * 777) as u64, &bytes, 4);
        }

        for shift in [-100i64, -3, 0, 55, 100] {
            let begin = (SEARCH_START as i64 + shift) as usize * 2;
            let mut window = Vec::new();
            sample_bytes(&samples[begin..begin + 2 * SECTOR_FRAMES], &mut window);
            let reference = CrcPiece::of(&window).crc;
            assert!(search.find(reference).contains(&(shift as Offset)), "{shift}");
        }

        search.clear();
        assert!(search.find(0).is_empty());
    }
}
