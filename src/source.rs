//! Sample stream sources.
//!
//! The engine consumes a track through the [`SampleSource`] trait. An
//! in-memory source is always available; decoding audio files through
//! symphonia is enabled with the `symphonia` feature.

use crate::{
    constants::{CD_SAMPLE_RATE, DEFAULT_BLOCK_SAMPLES},
    error::Result,
    types::Metadata,
};

#[cfg(feature = "symphonia")]
pub use decode::FileSource;

/// A rewindable stream of interleaved 16-bit samples for one track.
pub trait SampleSource: Send {
    /// Number of interleaved channels.
    fn channels(&self) -> u16;

    /// Sample rate in Hz.
    fn sample_rate(&self) -> u32 {
        CD_SAMPLE_RATE
    }

    /// Number of frames the stream will deliver in total.
    fn total_frames(&self) -> u64;

    /// Next block of interleaved samples, or `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream cannot be read or decoded.
    fn next_block(&mut self) -> Result<Option<&[i16]>>;

    /// Restart the stream from its first frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be reopened.
    fn rewind(&mut self) -> Result<()>;

    /// Tags attached to the stream.
    fn metadata(&self) -> Metadata {
        Metadata::new()
    }
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn channels(&self) -> u16 {
        (**self).channels()
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn total_frames(&self) -> u64 {
        (**self).total_frames()
    }

    fn next_block(&mut self) -> Result<Option<&[i16]>> {
        (**self).next_block()
    }

    fn rewind(&mut self) -> Result<()> {
        (**self).rewind()
    }

    fn metadata(&self) -> Metadata {
        (**self).metadata()
    }
}

/// Sample source over samples held in memory.
///
/// Hands out fixed-size blocks of whole frames.
#[derive(Debug, Clone)]
pub struct MemorySource {
    /// Interleaved samples
    samples: Vec<i16>,
    /// Interleaved channel count
    channels: u16,
    /// Sample rate in Hz
    sample_rate: u32,
    /// Samples per block, a multiple of `channels`
    block_samples: usize,
    /// Index of the next sample to hand out
    cursor: usize,
    /// Tags reported to the engine
    metadata: Metadata,
}

impl MemorySource {
    /// Create a source over interleaved samples.
    ///
    /// Trailing samples that do not make up a whole frame are dropped.
    pub fn new(mut samples: Vec<i16>, channels: u16) -> Self {
        let width = usize::from(channels.max(1));
        samples.truncate(samples.len() - samples.len() % width);
        Self {
            samples,
            channels,
            sample_rate: CD_SAMPLE_RATE,
            block_samples: DEFAULT_BLOCK_SAMPLES,
            cursor: 0,
            metadata: Metadata::new(),
        }
    }

    /// Set the number of samples per block (rounded down to whole frames).
    #[must_use]
    pub fn with_block_size(mut self, samples: usize) -> Self {
        let width = usize::from(self.channels.max(1));
        self.block_samples = (samples - samples % width).max(width);
        self
    }

    /// Set the reported sample rate.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Attach tags.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Interleaved samples of the whole stream.
    #[inline]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }
}

impl SampleSource for MemorySource {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> u64 {
        (self.samples.len() / usize::from(self.channels.max(1))) as u64
    }

    fn next_block(&mut self) -> Result<Option<&[i16]>> {
        if self.cursor >= self.samples.len() {
            return Ok(None);
        }
        let start = self.cursor;
        let end = (start + self.block_samples).min(self.samples.len());
        self.cursor = end;
        Ok(Some(&self.samples[start..end]))
    }

    fn rewind(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }
}

#[cfg(feature = "symphonia")]
mod decode {
    //! Audio file decoding through symphonia.

    use std::{
        fs::File,
        io::ErrorKind,
        path::{Path, PathBuf},
    };

    use symphonia::core::{
        audio::SampleBuffer,
        codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
        errors::Error as SymphoniaError,
        formats::{FormatOptions, FormatReader},
        io::MediaSourceStream,
        meta::{MetadataOptions, StandardTagKey, Tag},
        probe::Hint,
    };
    use tracing::debug;

    use super::SampleSource;
    use crate::{
        error::{Error, Result},
        types::Metadata,
    };

    /// Sample source decoding an audio file with symphonia.
    ///
    /// Rewinding reopens the file, which is cheaper and more predictable
    /// than seeking for formats without an index.
    pub struct FileSource {
        path: PathBuf,
        format: Box<dyn FormatReader>,
        decoder: Box<dyn Decoder>,
        track_id: u32,
        channels: u16,
        sample_rate: u32,
        total_frames: u64,
        metadata: Metadata,
        buffer: Option<SampleBuffer<i16>>,
        buffer_frames: usize,
    }

    impl std::fmt::Debug for FileSource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FileSource")
                .field("path", &self.path)
                .field("channels", &self.channels)
                .field("sample_rate", &self.sample_rate)
                .field("total_frames", &self.total_frames)
                .finish_non_exhaustive()
        }
    }

    struct Opened {
        format: Box<dyn FormatReader>,
        decoder: Box<dyn Decoder>,
        track_id: u32,
        channels: u16,
        sample_rate: u32,
        frames: Option<u64>,
        metadata: Metadata,
    }

    fn decode_error(err: SymphoniaError) -> Error {
        Error::Decode(err.to_string())
    }

    fn tag_key(tag: &Tag) -> &str {
        match tag.std_key {
            Some(StandardTagKey::Album) => "album",
            Some(StandardTagKey::AlbumArtist) => "album_artist",
            Some(StandardTagKey::Artist) => "artist",
            Some(StandardTagKey::Compilation) => "compilation",
            Some(StandardTagKey::Composer) => "composer",
            Some(StandardTagKey::Date) => "date",
            Some(StandardTagKey::DiscNumber) => "disc",
            Some(StandardTagKey::SortAlbumArtist) => "sort_album_artist",
            Some(StandardTagKey::SortArtist) => "sort_artist",
            Some(StandardTagKey::SortComposer) => "sort_composer",
            Some(StandardTagKey::TrackTitle) => "title",
            Some(StandardTagKey::TrackNumber) => "track",
            _ => &tag.key,
        }
    }

    fn open_stream(path: &Path) -> Result<Opened> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(decode_error)?;

        let mut metadata = Metadata::new();
        if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            for tag in revision.tags() {
                metadata.insert(tag_key(tag), tag.value.to_string());
            }
        }
        let mut format = probed.format;
        if let Some(revision) = format.metadata().current() {
            for tag in revision.tags() {
                metadata.insert(tag_key(tag), tag.value.to_string());
            }
        }

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("no audio track".to_string()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let channels = params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| Error::Decode("channel layout not specified".to_string()))?;
        let channels =
            u16::try_from(channels).map_err(|_| Error::Decode(format!("{channels} channels")))?;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::Decode("sample rate not specified".to_string()))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(decode_error)?;

        Ok(Opened {
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            frames: params.n_frames,
            metadata,
        })
    }

    impl FileSource {
        /// Open and probe an audio file.
        ///
        /// Files whose container does not announce a frame count are
        /// decoded once up front to count them.
        ///
        /// # Errors
        ///
        /// Returns an error if the file cannot be opened, probed or decoded.
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            let opened = open_stream(&path)?;
            let known = opened.frames;

            let mut source = Self {
                path,
                format: opened.format,
                decoder: opened.decoder,
                track_id: opened.track_id,
                channels: opened.channels,
                sample_rate: opened.sample_rate,
                total_frames: known.unwrap_or(0),
                metadata: opened.metadata,
                buffer: None,
                buffer_frames: 0,
            };

            if known.is_none() {
                let mut samples = 0u64;
                while let Some(block) = source.next_block()? {
                    samples += block.len() as u64;
                }
                source.total_frames = samples / u64::from(source.channels.max(1));
                source.rewind()?;
            }

            debug!(
                path = %source.path.display(),
                channels = source.channels,
                sample_rate = source.sample_rate,
                frames = source.total_frames,
                "opened audio file"
            );
            Ok(source)
        }

        /// Path of the decoded file.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl SampleSource for FileSource {
        fn channels(&self) -> u16 {
            self.channels
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn total_frames(&self) -> u64 {
            self.total_frames
        }

        fn next_block(&mut self) -> Result<Option<&[i16]>> {
            loop {
                let packet = match self.format.next_packet() {
                    Ok(packet) => packet,
                    Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                        return Ok(None);
                    }
                    Err(SymphoniaError::ResetRequired) => return Ok(None),
                    Err(e) => return Err(decode_error(e)),
                };
                if packet.track_id() != self.track_id {
                    continue;
                }

                let decoded = self.decoder.decode(&packet).map_err(decode_error)?;
                if decoded.frames() == 0 {
                    continue;
                }

                let spec = *decoded.spec();
                let capacity = decoded.capacity();
                if self.buffer_frames < capacity {
                    self.buffer = None;
                    self.buffer_frames = capacity;
                }
                let buffer = self
                    .buffer
                    .get_or_insert_with(|| SampleBuffer::new(capacity as u64, spec));
                buffer.copy_interleaved_ref(decoded);
                return Ok(Some(buffer.samples()));
            }
        }

        fn rewind(&mut self) -> Result<()> {
            let opened = open_stream(&self.path)?;
            self.format = opened.format;
            self.decoder = opened.decoder;
            self.track_id = opened.track_id;
            Ok(())
        }

        fn metadata(&self) -> Metadata {
            self.metadata.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_blocks() {
        let samples: Vec<i16> = (0..10).collect();
        let mut source = MemorySource::new(samples, 2).with_block_size(5);

        assert_eq!(source.total_frames(), 5);
        assert_eq!(source.next_block().unwrap(), Some(&[0, 1, 2, 3][..]));
        assert_eq!(source.next_block().unwrap(), Some(&[4, 5, 6, 7][..]));
        assert_eq!(source.next_block().unwrap(), Some(&[8, 9][..]));
        assert_eq!(source.next_block().unwrap(), None);

        source.rewind().unwrap();
        assert_eq!(source.next_block().unwrap(), Some(&[0, 1, 2, 3][..]));
    }

    #[test]
    fn test_memory_source_drops_partial_frame() {
        let source = MemorySource::new(vec![1, 2, 3], 2);
        assert_eq!(source.samples(), &[1, 2]);
        assert_eq!(source.total_frames(), 1);
    }

    #[test]
    fn test_boxed_source() {
        let mut source: Box<dyn SampleSource> =
            Box::new(MemorySource::new(vec![7; 8], 1).with_sample_rate(22050));
        assert_eq!(source.channels(), 1);
        assert_eq!(source.sample_rate(), 22050);
        assert_eq!(source.total_frames(), 8);
        assert!(source.next_block().unwrap().is_some());
        assert!(source.metadata().is_empty());
    }
}
