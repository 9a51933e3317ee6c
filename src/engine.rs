//! Checksum and offset engine.
//!
//! An [`Engine`] consumes one track exactly once and, in that single pass,
//! keeps for every registered read offset the AccurateRip v1/v2 sums and
//! CRC32s of the offset-shifted track, split into lead-in, middle and
//! lead-out regions. It also fills the offset-search tables and keeps the
//! raw boundary windows that neighboring tracks borrow from.
//!
//! For offset `o` the shifted track is `T'[l] = X[l + o]`, `l = 1..=N`,
//! where `X` is the raw track. A positive offset drops the first `o` raw
//! frames and borrows the first `o` frames of the next track; a negative
//! offset borrows the last `|o|` frames of the previous track and drops
//! the last `|o|` raw frames. Frames that would come from a missing
//! neighbor are digital silence.

use std::fmt;

use tracing::{debug, trace};

use crate::{
    config::EngineConfig,
    constants::{SECTOR_FRAMES, WINDOW_FRAMES},
    crc::{sample_bytes, CrcAccumulator, CrcPiece},
    error::{Error, Result},
    fingerprint::Fingerprinter,
    search::{ChecksumSearch, CrcSearch},
    source::SampleSource,
    types::{frame_value, weigh, Checksums, Metadata, Offset, Region},
    window::BoundaryWindows,
};

/// Partial checksums over a contiguous run of the shifted track.
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    v1: u64,
    v2: u64,
    crc: CrcPiece,
    crc_skip_zero: CrcPiece,
}

impl Tally {
    /// Tally frames taken verbatim, the first one at shifted index `first`.
    fn of_frames(samples: &[i16], channels: usize, first: u64, bytes: &mut Vec<u8>) -> Self {
        let mut tally = Self::default();
        for (i, frame) in samples.chunks_exact(channels).enumerate() {
            let (v1, v2) = weigh(first + i as u64, frame_value(frame));
            tally.v1 = tally.v1.wrapping_add(v1);
            tally.v2 = tally.v2.wrapping_add(v2);
        }
        sample_bytes(samples, bytes);
        tally.crc = CrcPiece::of(bytes);
        let mut skip_zero = CrcAccumulator::new();
        skip_zero.update_skip_zero(bytes);
        tally.crc_skip_zero = skip_zero.piece();
        tally
    }

    /// Tally `frames` frames of silence.
    fn silence(frames: u64, bytes_per_frame: usize) -> Self {
        Self {
            crc: CrcPiece::zeroes(frames * bytes_per_frame as u64),
            ..Self::default()
        }
    }

    /// Append the run that follows this one.
    fn append(&mut self, next: Tally) {
        self.v1 = self.v1.wrapping_add(next.v1);
        self.v2 = self.v2.wrapping_add(next.v2);
        self.crc = self.crc.concat(next.crc);
        self.crc_skip_zero = self.crc_skip_zero.concat(next.crc_skip_zero);
    }
}

/// Accumulators of one registered offset, indexed by [`Region`].
#[derive(Debug, Clone)]
struct OffsetState {
    offset: Offset,
    v1: [u64; 3],
    v2: [u64; 3],
    crc: [CrcAccumulator; 3],
    crc_skip_zero: [CrcAccumulator; 3],
}

impl OffsetState {
    fn new(offset: Offset) -> Self {
        Self {
            offset,
            v1: [0; 3],
            v2: [0; 3],
            crc: Default::default(),
            crc_skip_zero: Default::default(),
        }
    }

    fn clear(&mut self) {
        *self = Self::new(self.offset);
    }

    /// Add the raw frames of a block whose first frame sits at `start`.
    ///
    /// Only frames whose shifted index lands inside the track count.
    fn feed(&mut self, total: u64, start: u64, values: &[u32], bytes: &[u8], bytes_per_frame: usize) {
        let offset = i64::from(self.offset);
        let start = start as i64;
        let end = start + values.len() as i64;
        let total_i = total as i64;

        // Shifted indices whose raw frame l + o - 1 lies in this block and in the track
        let lo = (start + 1 - offset).max(1);
        let hi = (end - offset).min(total_i - offset).min(total_i);
        if lo > hi {
            return;
        }

        for region in Region::ALL {
            let Some((first, last)) = region.span(total) else {
                continue;
            };
            let from = lo.max(first as i64);
            let to = hi.min(last as i64);
            if from > to {
                continue;
            }
            let r = region as usize;
            for index in from..=to {
                let raw = (index + offset - 1 - start) as usize;
                let (v1, v2) = weigh(index as u64, values[raw]);
                self.v1[r] = self.v1[r].wrapping_add(v1);
                self.v2[r] = self.v2[r].wrapping_add(v2);
            }
            let a = (from + offset - 1 - start) as usize * bytes_per_frame;
            let b = (to + offset - start) as usize * bytes_per_frame;
            self.crc[r].update(&bytes[a..b]);
            self.crc_skip_zero[r].update_skip_zero(&bytes[a..b]);
        }
    }

    /// Tally of everything this track contributes itself.
    fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        for r in 0..3 {
            tally.append(Tally {
                v1: self.v1[r],
                v2: self.v2[r],
                crc: self.crc[r].piece(),
                crc_skip_zero: self.crc_skip_zero[r].piece(),
            });
        }
        tally
    }
}

/// Fingerprinter plus its progress through the sample budget.
struct PrintState {
    printer: Box<dyn Fingerprinter>,
    /// Samples to feed per pass
    budget: u64,
    /// Samples still to feed in this pass
    remaining: u64,
    started: bool,
    /// Finished fingerprint or failure message
    result: Option<std::result::Result<String, String>>,
}

fn fingerprint_message(err: Error) -> String {
    match err {
        Error::Fingerprint(message) => message,
        other => other.to_string(),
    }
}

impl PrintState {
    fn new(printer: Box<dyn Fingerprinter>, budget: u64) -> Self {
        Self {
            printer,
            budget,
            remaining: budget,
            started: false,
            result: None,
        }
    }

    fn begin(&mut self, sample_rate: u32, channels: u16) -> bool {
        if !self.started {
            if let Err(e) = self.printer.start(sample_rate, channels) {
                self.result = Some(Err(fingerprint_message(e)));
                return false;
            }
            self.started = true;
        }
        true
    }

    fn feed(&mut self, block: &[i16], sample_rate: u32, channels: u16) {
        if self.result.is_some() || self.remaining == 0 || !self.begin(sample_rate, channels) {
            return;
        }
        let n = (block.len() as u64).min(self.remaining) as usize;
        if let Err(e) = self.printer.feed(&block[..n]) {
            self.result = Some(Err(fingerprint_message(e)));
            return;
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.complete();
        }
    }

    fn complete(&mut self) {
        if self.result.is_none() {
            self.result = Some(self.printer.finish().map_err(fingerprint_message));
        }
    }

    fn end_of_stream(&mut self, sample_rate: u32, channels: u16) {
        if self.result.is_none() && self.begin(sample_rate, channels) {
            self.complete();
        }
    }

    /// Drop a partial pass. A finished fingerprint is kept.
    fn reset(&mut self) {
        if matches!(self.result, Some(Ok(_))) {
            return;
        }
        self.remaining = self.budget;
        self.started = false;
        self.result = None;
    }
}

/// Everything the engine accumulates, kept apart from the source so a
/// borrowed block can be consumed without copying.
struct Core {
    config: EngineConfig,
    channels: u16,
    sample_rate: u32,
    /// Frames the source announced
    total: u64,
    /// Frames consumed so far
    position: u64,
    /// Source reported end of stream
    finished: bool,
    offsets: Vec<OffsetState>,
    windows: BoundaryWindows,
    checksum_search: ChecksumSearch,
    /// Absent for tracks too short for the CRC search
    crc_search: Option<CrcSearch>,
    print: Option<PrintState>,
    /// Frame values of the current block
    values: Vec<u32>,
    /// Byte image of the current block
    bytes: Vec<u8>,
}

impl Core {
    #[inline]
    fn bytes_per_frame(&self) -> usize {
        2 * usize::from(self.channels)
    }

    fn consume(&mut self, block: &[i16]) -> Result<()> {
        let width = usize::from(self.channels);
        if block.len() % width != 0 {
            return Err(Error::PartialFrame(block.len()));
        }
        let frames = (block.len() / width) as u64;
        if self.finished || self.position + frames > self.total {
            return Err(Error::LengthMismatch {
                expected: self.total,
                actual: self.position + frames,
            });
        }

        let start = self.position;
        let bytes_per_frame = self.bytes_per_frame();
        self.values.clear();
        self.values.try_reserve(block.len() / width)?;
        self.values
            .extend(block.chunks_exact(width).map(frame_value));
        sample_bytes(block, &mut self.bytes);

        for state in &mut self.offsets {
            state.feed(self.total, start, &self.values, &self.bytes, bytes_per_frame);
        }
        self.checksum_search.feed(start, &self.values);
        if let Some(search) = &mut self.crc_search {
            search.feed(start, &self.bytes, bytes_per_frame);
        }
        self.windows.capture(start, block);
        if let Some(print) = &mut self.print {
            print.feed(block, self.sample_rate, self.channels);
        }

        self.position += frames;
        trace!(start, frames, "consumed block");
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<()> {
        if self.position != self.total {
            return Err(Error::LengthMismatch {
                expected: self.total,
                actual: self.position,
            });
        }
        if let Some(print) = &mut self.print {
            print.end_of_stream(self.sample_rate, self.channels);
        }
        self.finished = true;
        debug!(frames = self.total, offsets = self.offsets.len(), "stream complete");
        Ok(())
    }

    fn reset(&mut self) {
        self.position = 0;
        self.finished = false;
        for state in &mut self.offsets {
            state.clear();
        }
        self.windows.clear();
        self.checksum_search.clear();
        if let Some(search) = &mut self.crc_search {
            search.clear();
        }
        if let Some(print) = &mut self.print {
            print.reset();
        }
    }

    fn print_done(&self) -> bool {
        self.print.as_ref().map_or(true, |p| p.result.is_some())
    }
}

/// Checksum and offset engine for one track.
///
/// The engine is not internally synchronized; concurrency comes from
/// giving every track its own engine.
pub struct Engine {
    source: Box<dyn SampleSource>,
    core: Core,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("channels", &self.core.channels)
            .field("sample_rate", &self.core.sample_rate)
            .field("total", &self.core.total)
            .field("position", &self.core.position)
            .field("offsets", &self.registered_offsets())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine with the default configuration.
    ///
    /// Offset 0 is registered.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedChannels` for anything but mono or stereo, or an
    /// allocation error.
    pub fn new<S: SampleSource + 'static>(source: S) -> Result<Self> {
        Self::with_config(source, EngineConfig::default())
    }

    /// Create an engine with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig`, `UnsupportedChannels` or an allocation error.
    pub fn with_config<S: SampleSource + 'static>(source: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let channels = source.channels();
        if !(1..=2).contains(&channels) {
            return Err(Error::UnsupportedChannels(channels));
        }
        let total = source.total_frames();
        let width = usize::from(channels);

        let crc_search = if total >= config.crc_search_min_frames() {
            Some(CrcSearch::new(config.max_crc_offset(), 2 * width)?)
        } else {
            debug!(frames = total, "track too short for CRC offset search");
            None
        };

        let core = Core {
            config,
            channels,
            sample_rate: source.sample_rate(),
            total,
            position: 0,
            finished: false,
            offsets: vec![OffsetState::new(0)],
            windows: BoundaryWindows::new(total, width)?,
            checksum_search: ChecksumSearch::new(config.max_checksum_offset())?,
            crc_search,
            print: None,
            values: Vec::new(),
            bytes: Vec::new(),
        };
        Ok(Self {
            source: Box::new(source),
            core,
        })
    }

    /// Attach a fingerprinter.
    ///
    /// If samples were already consumed the stream is rewound.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be rewound.
    pub fn set_fingerprinter<F: Fingerprinter + 'static>(&mut self, printer: F) -> Result<()> {
        let core = &mut self.core;
        let budget = u64::from(core.config.fingerprint_seconds())
            * u64::from(core.sample_rate)
            * u64::from(core.channels);
        core.print = Some(PrintState::new(Box::new(printer), budget));
        if core.position > 0 || core.finished {
            self.rewind()?;
        }
        Ok(())
    }

    /// Register an offset candidate and rewind the stream.
    ///
    /// Registering an offset that is already known is a no-op. Otherwise
    /// every accumulator is cleared, because all offsets must cover the
    /// whole stream.
    ///
    /// # Errors
    ///
    /// Returns `OffsetOutOfRange` if `|offset|` exceeds the boundary window,
    /// an allocation error, or an error from rewinding the source.
    pub fn register_offset(&mut self, offset: Offset) -> Result<()> {
        if offset.unsigned_abs() as usize > WINDOW_FRAMES {
            return Err(Error::OffsetOutOfRange {
                offset,
                limit: WINDOW_FRAMES,
            });
        }
        if self.core.offsets.iter().any(|s| s.offset == offset) {
            return Ok(());
        }
        self.core.offsets.try_reserve(1)?;
        self.core.offsets.push(OffsetState::new(offset));
        debug!(offset, "registered offset");
        self.rewind()
    }

    /// Offsets registered so far, in registration order.
    pub fn registered_offsets(&self) -> Vec<Offset> {
        self.core.offsets.iter().map(|s| s.offset).collect()
    }

    /// Restart the stream and clear everything accumulated.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be rewound.
    pub fn rewind(&mut self) -> Result<()> {
        self.source.rewind()?;
        self.core.reset();
        trace!("rewound stream");
        Ok(())
    }

    /// Consume a block of interleaved samples by hand.
    ///
    /// [`process`](Self::process) pulls blocks from the source instead;
    /// mixing the two is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns `PartialFrame` or `LengthMismatch`.
    pub fn feed(&mut self, block: &[i16]) -> Result<()> {
        self.core.consume(block)
    }

    /// Mark the end of a stream driven through [`feed`](Self::feed).
    ///
    /// # Errors
    ///
    /// Returns `LengthMismatch` if fewer frames than announced were fed.
    pub fn finish(&mut self) -> Result<()> {
        self.core.end_of_stream()
    }

    fn step(&mut self) -> Result<()> {
        match self.source.next_block()? {
            Some(block) => self.core.consume(block),
            None => self.core.end_of_stream(),
        }
    }

    /// Consume the rest of the stream.
    ///
    /// # Errors
    ///
    /// Propagates source errors and length mismatches. The stream position
    /// is undefined afterwards.
    pub fn process(&mut self) -> Result<()> {
        while !self.core.finished {
            self.step()?;
        }
        Ok(())
    }

    /// Consume at least `frames` more frames, or up to the end of the stream.
    ///
    /// # Errors
    ///
    /// Same as [`process`](Self::process).
    pub fn process_frames(&mut self, frames: u64) -> Result<()> {
        let target = self.core.position.saturating_add(frames);
        while !self.core.finished && self.core.position < target {
            self.step()?;
        }
        Ok(())
    }

    /// Check if the whole stream has been consumed.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.core.finished
    }

    /// Frames consumed so far.
    #[inline]
    pub fn position(&self) -> u64 {
        self.core.position
    }

    /// Frames in the track.
    #[inline]
    pub fn total_frames(&self) -> u64 {
        self.core.total
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.core.channels
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.core.sample_rate
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Track length in seconds.
    pub fn duration(&self) -> f64 {
        if self.core.sample_rate == 0 {
            return 0.0;
        }
        self.core.total as f64 / f64::from(self.core.sample_rate)
    }

    /// Track length in whole seconds, rounded down.
    pub fn duration_secs(&self) -> u64 {
        if self.core.sample_rate == 0 {
            return 0;
        }
        self.core.total / u64::from(self.core.sample_rate)
    }

    /// Number of CD sectors in the track.
    ///
    /// # Errors
    ///
    /// Returns `NotSectorAligned` if the track is not a whole number of sectors.
    pub fn sector_count(&self) -> Result<u64> {
        let total = self.core.total;
        if total % SECTOR_FRAMES as u64 != 0 {
            return Err(Error::NotSectorAligned(total));
        }
        Ok(total / SECTOR_FRAMES as u64)
    }

    /// Tags reported by the source.
    pub fn metadata(&self) -> Metadata {
        self.source.metadata()
    }

    /// Acoustic fingerprint of the track, consuming more of the stream if
    /// the fingerprint budget has not been filled yet.
    ///
    /// # Errors
    ///
    /// Returns `Fingerprint` if no fingerprinter is attached or it failed,
    /// or any error from consuming the stream.
    pub fn fingerprint(&mut self) -> Result<String> {
        if self.core.print.is_none() {
            return Err(Error::Fingerprint("no fingerprinter attached".to_string()));
        }
        while !self.core.print_done() {
            if self.core.finished {
                self.rewind()?;
            }
            self.step()?;
        }
        match self.core.print.as_ref().and_then(|p| p.result.clone()) {
            Some(Ok(fingerprint)) => Ok(fingerprint),
            Some(Err(message)) => Err(Error::Fingerprint(message)),
            None => Err(Error::Fingerprint("fingerprint not computed".to_string())),
        }
    }

    fn check_neighbor(&self, neighbor: Option<&Engine>) -> Result<()> {
        if let Some(neighbor) = neighbor {
            if neighbor.core.channels != self.core.channels {
                return Err(Error::ChannelMismatch {
                    expected: self.core.channels,
                    found: neighbor.core.channels,
                });
            }
            if !neighbor.is_complete() {
                return Err(Error::Incomplete);
            }
        }
        Ok(())
    }

    /// Final checksums of the track read at `offset`.
    ///
    /// `leader` is the previous track on the disc and `trailer` the next
    /// one; pass `None` for the first or last track. Only their boundary
    /// windows are used, so their own registered offsets do not matter.
    ///
    /// # Errors
    ///
    /// Returns `Incomplete` if any involved stream is not fully consumed,
    /// `ChannelMismatch`, `OffsetNotRegistered`, or `WindowTooShort` if a
    /// neighbor holds fewer frames than the offset borrows.
    pub fn finalize_checksums(
        &self,
        offset: Offset,
        leader: Option<&Engine>,
        trailer: Option<&Engine>,
    ) -> Result<Checksums> {
        if !self.is_complete() {
            return Err(Error::Incomplete);
        }
        self.check_neighbor(leader)?;
        self.check_neighbor(trailer)?;
        let state = self
            .core
            .offsets
            .iter()
            .find(|s| s.offset == offset)
            .ok_or(Error::OffsetNotRegistered(offset))?;

        let total = self.core.total;
        let width = usize::from(self.core.channels);
        let bytes_per_frame = self.core.bytes_per_frame();
        let borrow = u64::from(offset.unsigned_abs());
        let mut scratch = Vec::new();
        let mut tally = Tally::default();

        // Shifted indices 1..=count come from before the raw track
        if offset < 0 {
            let count = borrow.min(total);
            let part = match leader {
                Some(leader) => {
                    let tail = &leader.core.windows.tail;
                    let too_short = || Error::WindowTooShort {
                        needed: borrow as usize,
                        available: tail.len(),
                    };
                    let first = leader.core.total.checked_sub(borrow).ok_or_else(too_short)?;
                    let frames = tail.frames(first, count as usize).ok_or_else(too_short)?;
                    Tally::of_frames(frames, width, 1, &mut scratch)
                }
                None => Tally::silence(count, bytes_per_frame),
            };
            tally.append(part);
        }

        tally.append(state.tally());

        // Shifted indices first..=total come from after the raw track
        if offset > 0 {
            let first = total.saturating_sub(borrow) + 1;
            let count = total + 1 - first;
            let part = match trailer {
                Some(trailer) => {
                    let head = &trailer.core.windows.head;
                    let frames = head
                        .frames(first + borrow - total - 1, count as usize)
                        .ok_or(Error::WindowTooShort {
                            needed: borrow as usize,
                            available: head.len(),
                        })?;
                    Tally::of_frames(frames, width, first, &mut scratch)
                }
                None => Tally::silence(count, bytes_per_frame),
            };
            tally.append(part);
        }

        Ok(Checksums {
            offset,
            v1: tally.v1 as u32,
            v2: tally.v2 as u32,
            crc32: tally.crc.crc,
            crc32_skip_zero: tally.crc_skip_zero.crc,
        })
    }

    /// Final checksums for every registered offset, in registration order.
    ///
    /// # Errors
    ///
    /// Same as [`finalize_checksums`](Self::finalize_checksums).
    pub fn finalize_all(
        &self,
        leader: Option<&Engine>,
        trailer: Option<&Engine>,
    ) -> Result<Vec<Checksums>> {
        self.core
            .offsets
            .iter()
            .map(|s| self.finalize_checksums(s.offset, leader, trailer))
            .collect()
    }

    /// Offsets at which the AccurateRip sum of the search sector equals
    /// `reference`, ascending. A zero reference never matches.
    pub fn find_offset_by_checksum(&self, reference: u32) -> Vec<Offset> {
        self.core.checksum_search.find(reference)
    }

    /// Offsets at which the CRC32 of the search sector equals `reference`,
    /// ascending. Always empty for tracks too short for the CRC search.
    pub fn find_offset_by_crc(&self, reference: u32) -> Vec<Offset> {
        self.core
            .crc_search
            .as_ref()
            .map_or_else(Vec::new, |search| search.find(reference))
    }
}

/// Final checksums for every registered offset of every track of a disc.
///
/// `tracks` lists the disc in order, with `None` for a track that could
/// not be processed. The ends of the slice are the disc edges and read as
/// silence. An offset that borrows from a failed neighbor yields
/// `NeighborFailed`: negative offsets need the previous track, positive
/// ones the next. A failed track gets an empty list.
pub fn finalize_disc(tracks: &[Option<&Engine>]) -> Vec<Vec<Result<Checksums>>> {
    tracks
        .iter()
        .enumerate()
        .map(|(index, track)| {
            let Some(engine) = track else {
                return Vec::new();
            };
            // Outer `None` is a disc edge, inner `None` a failed track
            let leader = index.checked_sub(1).map(|i| tracks[i]);
            let trailer = tracks.get(index + 1).copied();
            engine
                .core
                .offsets
                .iter()
                .map(|state| match (state.offset.signum(), leader, trailer) {
                    (-1, Some(None), _) | (1, _, Some(None)) => {
                        Err(Error::NeighborFailed(state.offset))
                    }
                    _ => engine.finalize_checksums(
                        state.offset,
                        leader.flatten(),
                        trailer.flatten(),
                    ),
                })
                .collect()
        })
        .collect()
}
