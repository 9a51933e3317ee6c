//! Constants used throughout the library.
//!
//! These values follow the CD audio geometry and the AccurateRip
//! conventions for track boundaries and offset detection.

/// Number of 16-bit samples per CD sector (2352 / 2 = 1176)
pub const CD_FRAMEWORDS: usize = 1176;

/// Number of frames (stereo sample pairs) per sector
pub const SECTOR_FRAMES: usize = 588;

/// Sectors at each end of a track that get special treatment
pub const BOUNDARY_SECTORS: usize = 5;

/// Frames at each end of a track that get special treatment (5 sectors)
pub const BOUNDARY_FRAMES: usize = BOUNDARY_SECTORS * SECTOR_FRAMES;

/// Length of the retained head and tail windows in frames.
///
/// Large enough to serve any offset in `[-BOUNDARY_FRAMES, BOUNDARY_FRAMES]`
/// on either side of a track boundary.
pub const WINDOW_FRAMES: usize = 2 * BOUNDARY_FRAMES + 1;

/// Sector index (from the start of the track) used for offset detection
pub const SEARCH_SECTOR: usize = 450;

/// Default search range of the rolling-sum offset search, in frames
pub const MAX_CHECKSUM_SEARCH_OFFSET: u32 = 1024;

/// Default search range of the CRC32 offset search, in frames
pub const MAX_CRC_SEARCH_OFFSET: u32 = BOUNDARY_FRAMES as u32;

/// Tracks shorter than this many frames skip the CRC32 search table
pub const MIN_CRC_SEARCH_FRAMES: u64 = 501 * SECTOR_FRAMES as u64;

/// Seconds of audio fed to the fingerprinter
pub const FINGERPRINT_SECONDS: u32 = 120;

/// Sample rate for CD audio (44.1 kHz)
pub const CD_SAMPLE_RATE: u32 = 44100;

/// Default number of samples per block handed out by in-memory sources
pub const DEFAULT_BLOCK_SAMPLES: usize = 16 * CD_FRAMEWORDS;

/// Version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
