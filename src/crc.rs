//! CRC32 accumulation and composition.
//!
//! Every CRC in this crate is the IEEE CRC32 used by EAC and CUETools,
//! computed with `crc32fast`. Track CRCs are built from independently
//! accumulated pieces and stitched together afterwards, so each piece
//! remembers how many bytes it covers.

use crc32fast::Hasher;

/// Zero bytes used to hash stretches of digital silence
const ZEROES: [u8; 4096] = [0; 4096];

/// Compose `CRC32(a ‖ b)` from `CRC32(a)`, `CRC32(b)` and the length of `b`.
pub fn crc32_combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    let mut first = Hasher::new_with_initial(crc1);
    let second = Hasher::new_with_initial_len(crc2, len2);
    first.combine(&second);
    first.finalize()
}

/// CRC32 of a finished byte range along with its length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrcPiece {
    /// CRC32 of the range
    pub crc: u32,
    /// Length of the range in bytes
    pub len: u64,
}

impl CrcPiece {
    /// CRC32 of an empty range.
    pub const EMPTY: CrcPiece = CrcPiece { crc: 0, len: 0 };

    /// Hash a byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        let mut acc = CrcAccumulator::new();
        acc.update(bytes);
        acc.piece()
    }

    /// Hash `len` zero bytes.
    pub fn zeroes(len: u64) -> Self {
        let mut acc = CrcAccumulator::new();
        let mut left = len;
        while left > 0 {
            let n = left.min(ZEROES.len() as u64) as usize;
            acc.update(&ZEROES[..n]);
            left -= n as u64;
        }
        acc.piece()
    }

    /// Append another range after this one.
    #[must_use]
    pub fn concat(self, next: CrcPiece) -> Self {
        Self {
            crc: crc32_combine(self.crc, next.crc, next.len),
            len: self.len + next.len,
        }
    }
}

/// Running CRC32 over a byte range that grows block by block.
#[derive(Debug, Clone, Default)]
pub struct CrcAccumulator {
    hasher: Hasher,
    len: u64,
}

impl CrcAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes.
    #[inline]
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.len += bytes.len() as u64;
    }

    /// Append the non-zero 16-bit samples of a little-endian sample image.
    pub fn update_skip_zero(&mut self, bytes: &[u8]) {
        let mut run = 0;
        for (i, sample) in bytes.chunks_exact(2).enumerate() {
            if sample[0] == 0 && sample[1] == 0 {
                if run < i * 2 {
                    self.update(&bytes[run..i * 2]);
                }
                run = i * 2 + 2;
            }
        }
        let end = bytes.len() - bytes.len() % 2;
        if run < end {
            self.update(&bytes[run..end]);
        }
    }

    /// Number of bytes hashed so far.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Check if nothing has been hashed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Snapshot the CRC of everything hashed so far.
    pub fn piece(&self) -> CrcPiece {
        CrcPiece {
            crc: self.hasher.clone().finalize(),
            len: self.len,
        }
    }

    /// Forget everything hashed so far.
    pub fn reset(&mut self) {
        self.hasher.reset();
        self.len = 0;
    }
}

/// Little-endian byte image of interleaved 16-bit samples.
pub fn sample_bytes(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_value() {
        // Standard check value for CRC-32/ISO-HDLC
        assert_eq!(CrcPiece::of(b"123456789").crc, 0xcbf4_3926);
    }

    #[test]
    fn test_combine_empty_suffix() {
        let crc = CrcPiece::of(b"abc").crc;
        assert_eq!(crc32_combine(crc, 0, 0), crc);
        assert_eq!(crc32_combine(0, crc, 3), crc);
    }

    #[test]
    fn test_zeroes() {
        let zeros = vec![0u8; 10_000];
        assert_eq!(CrcPiece::zeroes(10_000), CrcPiece::of(&zeros));
        assert_eq!(CrcPiece::zeroes(0), CrcPiece::EMPTY);
    }

    #[test]
    fn test_skip_zero() {
        let samples: Vec<i16> = vec![0, 5, 0, 0, -3, 7, 0, 256];
        let mut bytes = Vec::new();
        sample_bytes(&samples, &mut bytes);

        let kept: Vec<i16> = samples.iter().copied().filter(|s| *s != 0).collect();
        let mut kept_bytes = Vec::new();
        sample_bytes(&kept, &mut kept_bytes);

        let mut acc = CrcAccumulator::new();
        acc.update_skip_zero(&bytes);
        assert_eq!(acc.piece(), CrcPiece::of(&kept_bytes));
        assert_eq!(acc.len(), 8);
    }

    #[test]
    fn test_skip_zero_keeps_zero_bytes_inside_samples() {
        // 256 is [0x00, 0x01], only whole zero samples are dropped
        let mut acc = CrcAccumulator::new();
        acc.update_skip_zero(&[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(acc.piece(), CrcPiece::of(&[0x00, 0x01]));
    }

    #[test]
    fn test_accumulator_reset() {
        let mut acc = CrcAccumulator::new();
        acc.update(b"junk");
        acc.reset();
        assert!(acc.is_empty());
        acc.update(b"123456789");
        assert_eq!(acc.piece().crc, 0xcbf4_3926);
    }

    proptest! {
        #[test]
        fn combine_matches_direct_crc(data in prop::collection::vec(any::<u8>(), 0..2048), split in any::<prop::sample::Index>()) {
            let at = split.index(data.len() + 1);
            let (prefix, suffix) = data.split_at(at);
            let joined = CrcPiece::of(prefix).concat(CrcPiece::of(suffix));
            prop_assert_eq!(joined, CrcPiece::of(&data));
        }

        #[test]
        fn chained_pieces_match_direct_crc(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..12)) {
            let whole: Vec<u8> = chunks.concat();
            let joined = chunks
                .iter()
                .fold(CrcPiece::EMPTY, |acc, chunk| acc.concat(CrcPiece::of(chunk)));
            prop_assert_eq!(joined, CrcPiece::of(&whole));
        }
    }
}
