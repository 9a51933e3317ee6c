//! Boundary windows of raw track audio.
//!
//! The first and last `WINDOW_FRAMES` frames of every track are kept
//! verbatim. A neighboring track borrows from them when it is finalized
//! at a non-zero offset, so neither track has to be decoded again.

use crate::{constants::WINDOW_FRAMES, error::Result};

/// Contiguous run of raw frames starting at a fixed frame position.
#[derive(Debug, Clone)]
pub struct FrameWindow {
    /// Interleaved samples
    pub vector: Vec<i16>,
    /// Position of the first frame (0-based, from track start)
    pub begin: u64,
    /// Interleaved channel count
    channels: usize,
    /// Maximum number of frames retained
    limit: usize,
}

impl FrameWindow {
    /// Create an empty window starting at frame `begin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample buffer cannot be reserved.
    pub fn new(begin: u64, limit: usize, channels: usize) -> Result<Self> {
        let mut vector = Vec::new();
        vector.try_reserve_exact(limit * channels)?;
        Ok(Self {
            vector,
            begin,
            channels,
            limit,
        })
    }

    /// Number of frames held.
    #[inline]
    pub fn len(&self) -> usize {
        self.vector.len() / self.channels
    }

    /// Check if the window is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    /// Ending frame position (exclusive).
    #[inline]
    pub fn end(&self) -> u64 {
        self.begin + self.len() as u64
    }

    /// Check if a frame position falls within this window.
    #[inline]
    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.begin && pos < self.end()
    }

    /// Interleaved samples of `count` frames starting at `pos`.
    pub fn frames(&self, pos: u64, count: usize) -> Option<&[i16]> {
        if count == 0 {
            return Some(&[]);
        }
        let last = pos + count as u64 - 1;
        if self.contains(pos) && self.contains(last) {
            let start = (pos - self.begin) as usize * self.channels;
            Some(&self.vector[start..start + count * self.channels])
        } else {
            None
        }
    }

    /// Copy the frames of a block that belong in this window.
    ///
    /// `start` is the position of the first frame in `block`. Blocks must
    /// arrive in stream order.
    pub fn capture(&mut self, start: u64, block: &[i16]) {
        let frames = (block.len() / self.channels) as u64;
        let want_from = self.end().max(start);
        let want_to = (self.begin + self.limit as u64).min(start + frames);
        if want_from >= want_to || want_from != self.end() {
            return;
        }
        let from = (want_from - start) as usize * self.channels;
        let to = (want_to - start) as usize * self.channels;
        self.vector.extend_from_slice(&block[from..to]);
    }

    /// Forget all captured frames.
    pub fn clear(&mut self) {
        self.vector.clear();
    }
}

/// Head and tail windows of one track.
#[derive(Debug, Clone)]
pub struct BoundaryWindows {
    /// First frames of the track
    pub head: FrameWindow,
    /// Last frames of the track
    pub tail: FrameWindow,
}

impl BoundaryWindows {
    /// Size the windows for a track of `total` frames.
    ///
    /// Tracks shorter than a window keep the whole track in both.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample buffers cannot be reserved.
    pub fn new(total: u64, channels: usize) -> Result<Self> {
        let limit = (WINDOW_FRAMES as u64).min(total) as usize;
        Ok(Self {
            head: FrameWindow::new(0, limit, channels)?,
            tail: FrameWindow::new(total - limit as u64, limit, channels)?,
        })
    }

    /// Feed a block whose first frame sits at position `start`.
    pub fn capture(&mut self, start: u64, block: &[i16]) {
        self.head.capture(start, block);
        self.tail.capture(start, block);
    }

    /// Forget all captured frames.
    pub fn clear(&mut self) {
        self.head.clear();
        self.tail.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_capture_across_blocks() {
        let mut window = FrameWindow::new(3, 4, 2).unwrap();
        let block1: Vec<i16> = (0..8).collect(); // frames 0..4
        let block2: Vec<i16> = (8..16).collect(); // frames 4..8
        window.capture(0, &block1);
        window.capture(4, &block2);

        assert_eq!(window.len(), 4);
        assert_eq!(window.len(), window.limit);
        assert_eq!(window.begin, 3);
        assert_eq!(window.end(), 7);
        assert_eq!(window.frames(3, 1), Some(&[6, 7][..]));
        assert_eq!(window.frames(6, 1), Some(&[12, 13][..]));
        assert_eq!(window.frames(7, 1), None);
        assert_eq!(window.frames(4, 2), Some(&[8, 9, 10, 11][..]));
        assert_eq!(window.frames(6, 2), None);
    }

    #[test]
    fn test_boundary_windows_long_track() {
        let total = (WINDOW_FRAMES * 3) as u64;
        let samples: Vec<i16> = (0..total).map(|i| (i % 30_000) as i16).collect();
        let mut windows = BoundaryWindows::new(total, 1).unwrap();
        for (i, block) in samples.chunks(1000).enumerate() {
            windows.capture((i * 1000) as u64, block);
        }

        assert_eq!(windows.head.len(), WINDOW_FRAMES);
        assert_eq!(windows.tail.len(), WINDOW_FRAMES);
        assert_eq!(windows.head.frames(0, 1), Some(&[0][..]));
        assert_eq!(windows.tail.begin, total - WINDOW_FRAMES as u64);
        assert_eq!(
            windows.tail.frames(total - 1, 1),
            Some(&[((total - 1) % 30_000) as i16][..])
        );
    }

    #[test]
    fn test_boundary_windows_short_track() {
        let mut windows = BoundaryWindows::new(10, 1).unwrap();
        windows.capture(0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(windows.head.vector, windows.tail.vector);
        assert_eq!(windows.tail.begin, 0);

        windows.clear();
        assert!(windows.head.is_empty());
        assert!(windows.tail.is_empty());
    }
}
