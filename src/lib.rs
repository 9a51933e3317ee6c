//! # fingersum
//!
//! AccurateRip checksums, CRC32 read-offset detection and acoustic
//! fingerprints for ripped CD audio, with a shared worker pool to process
//! whole discs in parallel.
//!
//! ## Features
//!
//! - AccurateRip v1 and v2 checksums plus whole-track CRC32, for any number
//!   of read offsets in a single pass over the audio
//! - Offset search over a bounded range by rolling sum or CRC32
//! - Boundary windows so neighboring tracks lend their samples without
//!   being decoded again
//! - Chromaprint fingerprints (`chromaprint` feature)
//! - Audio file decoding through symphonia (`symphonia` feature)
//! - Process-wide FIFO worker pool shared by independent contexts
//!
//! ## Example
//!
//! ```no_run
//! use fingersum::{Engine, MemorySource};
//!
//! # fn main() -> fingersum::Result<()> {
//! let samples = vec![0i16; 2 * 588 * 10];
//! let mut engine = Engine::new(MemorySource::new(samples, 2))?;
//! engine.register_offset(6)?;
//! engine.process()?;
//!
//! for sums in engine.finalize_all(None, None)? {
//!     println!("{:+5} v1 {:08x} v2 {:08x} crc {:08x}", sums.offset, sums.v1, sums.v2, sums.crc32);
//! }
//! # Ok(())
//! # }
//! ```

pub mod compare;
pub mod config;
pub mod constants;
pub mod error;
pub mod fingerprint;
pub mod scheduler;
pub mod source;
pub mod types;

mod crc;
mod engine;
mod search;
mod window;

pub use compare::{compare, Diff};
pub use config::EngineConfig;
pub use constants::*;
pub use crc::{crc32_combine, CrcAccumulator, CrcPiece};
pub use engine::{finalize_disc, Engine};
pub use error::{Error, Result};
#[cfg(feature = "chromaprint")]
pub use fingerprint::ChromaprintFingerprinter;
pub use fingerprint::{encode_fingerprint, Fingerprinter};
pub use scheduler::{Context, Job};
pub use search::{ChecksumSearch, CrcSearch, OffsetTable};
#[cfg(feature = "symphonia")]
pub use source::FileSource;
pub use source::{MemorySource, SampleSource};
pub use types::*;
pub use window::{BoundaryWindows, FrameWindow};
