//! Byte-level comparison of two sample streams.

use tracing::debug;

use crate::{
    crc::sample_bytes,
    error::{Error, Result},
    source::SampleSource,
};

/// Outcome of [`compare`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diff {
    /// Bytes of the 16-bit sample images that differ, including every byte
    /// of the longer stream past the end of the shorter one
    pub differing_bytes: u64,
    /// Frames read from the first stream
    pub frames_a: u64,
    /// Frames read from the second stream
    pub frames_b: u64,
    /// First stream is mono, or stereo with identical channels throughout
    pub mono_a: bool,
    /// Second stream is mono, or stereo with identical channels throughout
    pub mono_b: bool,
}

impl Diff {
    /// Check if both streams are byte-for-byte identical.
    #[inline]
    pub fn is_identical(&self) -> bool {
        self.differing_bytes == 0 && self.frames_a == self.frames_b
    }
}

/// Buffered cursor over the byte image of one source.
struct Reader<'a, S: SampleSource + ?Sized> {
    source: &'a mut S,
    channels: usize,
    bytes: Vec<u8>,
    cursor: usize,
    frames: u64,
    mono: bool,
    done: bool,
}

impl<'a, S: SampleSource + ?Sized> Reader<'a, S> {
    fn new(source: &'a mut S) -> Result<Self> {
        source.rewind()?;
        let channels = usize::from(source.channels());
        Ok(Self {
            source,
            channels,
            bytes: Vec::new(),
            cursor: 0,
            frames: 0,
            mono: true,
            done: false,
        })
    }

    /// Unread bytes of the current block, refilled on demand.
    fn pending(&mut self) -> Result<&[u8]> {
        while self.cursor == self.bytes.len() && !self.done {
            match self.source.next_block()? {
                Some(block) => {
                    if self.mono && self.channels == 2 {
                        self.mono = block.chunks_exact(2).all(|f| f[0] == f[1]);
                    }
                    self.frames += (block.len() / self.channels) as u64;
                    sample_bytes(block, &mut self.bytes);
                    self.cursor = 0;
                }
                None => self.done = true,
            }
        }
        Ok(&self.bytes[self.cursor..])
    }
}

/// Compare two sources over their little-endian 16-bit sample images.
///
/// Both sources are rewound first and read to the end.
///
/// # Errors
///
/// Returns `ChannelMismatch` if the channel layouts differ, or any error
/// from reading the sources.
pub fn compare<A, B>(a: &mut A, b: &mut B) -> Result<Diff>
where
    A: SampleSource + ?Sized,
    B: SampleSource + ?Sized,
{
    if a.channels() != b.channels() {
        return Err(Error::ChannelMismatch {
            expected: a.channels(),
            found: b.channels(),
        });
    }

    let mut left = Reader::new(a)?;
    let mut right = Reader::new(b)?;
    let mut differing = 0u64;

    loop {
        let n = {
            let x = left.pending()?.len();
            let y = right.pending()?.len();
            if x == 0 && y == 0 {
                break;
            }
            if x == 0 || y == 0 {
                // One stream ended: the rest of the other counts in full
                differing += (x + y) as u64;
                left.cursor += x;
                right.cursor += y;
                continue;
            }
            x.min(y)
        };
        let x = &left.bytes[left.cursor..left.cursor + n];
        let y = &right.bytes[right.cursor..right.cursor + n];
        differing += x.iter().zip(y).filter(|(p, q)| p != q).count() as u64;
        left.cursor += n;
        right.cursor += n;
    }

    let diff = Diff {
        differing_bytes: differing,
        frames_a: left.frames,
        frames_b: right.frames,
        mono_a: left.mono,
        mono_b: right.mono,
    };
    debug!(
        differing = diff.differing_bytes,
        frames_a = diff.frames_a,
        frames_b = diff.frames_b,
        "compared streams"
    );
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    #[test]
    fn test_identical_streams() {
        let samples: Vec<i16> = (0..1000).collect();
        let mut a = MemorySource::new(samples.clone(), 2).with_block_size(64);
        let mut b = MemorySource::new(samples, 2).with_block_size(100);
        let diff = compare(&mut a, &mut b).unwrap();
        assert!(diff.is_identical());
        assert_eq!(diff.frames_a, 500);
        assert!(!diff.mono_a);
    }

    #[test]
    fn test_single_sample_difference() {
        let samples = vec![0x0101i16; 200];
        let mut changed = samples.clone();
        changed[77] = 0x0102;
        let mut a = MemorySource::new(samples, 2).with_block_size(30);
        let mut b = MemorySource::new(changed, 2);
        let diff = compare(&mut a, &mut b).unwrap();
        assert_eq!(diff.differing_bytes, 1);
        assert!(diff.mono_a);
        assert!(!diff.mono_b);
    }

    #[test]
    fn test_length_difference_counts_remainder() {
        let mut a = MemorySource::new(vec![5; 100], 1);
        let mut b = MemorySource::new(vec![5; 130], 1).with_block_size(7);
        let diff = compare(&mut a, &mut b).unwrap();
        assert_eq!(diff.differing_bytes, 60);
        assert_eq!((diff.frames_a, diff.frames_b), (100, 130));
        assert!(!diff.is_identical());
        assert!(diff.mono_a && diff.mono_b);
    }

    #[test]
    fn test_rewinds_before_reading() {
        let mut a = MemorySource::new(vec![1; 50], 1);
        a.next_block().unwrap();
        let mut b = MemorySource::new(vec![1; 50], 1);
        assert!(compare(&mut a, &mut b).unwrap().is_identical());
    }

    #[test]
    fn test_channel_mismatch() {
        let mut a = MemorySource::new(vec![0; 4], 1);
        let mut b = MemorySource::new(vec![0; 4], 2);
        assert!(matches!(
            compare(&mut a, &mut b),
            Err(Error::ChannelMismatch { expected: 1, found: 2 })
        ));
    }
}
