//! Error types for the library.

use std::collections::TryReserveError;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while checksumming, fingerprinting or scheduling
#[derive(Error, Debug)]
pub enum Error {
    /// Growing an accumulator or table failed
    #[error("Allocation failed: {0}")]
    Allocation(#[from] TryReserveError),

    /// Only mono and stereo streams are supported
    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    /// The sample source failed to open or decode
    #[error("Decode error: {0}")]
    Decode(String),

    /// The fingerprint adapter failed
    #[error("Fingerprint error: {0}")]
    Fingerprint(String),

    /// Two engines or sources with different channel layouts were combined
    #[error("Channel layout mismatch: {expected} vs {found}")]
    ChannelMismatch { expected: u16, found: u16 },

    /// The stream has not been consumed to the end
    #[error("Stream not fully processed")]
    Incomplete,

    /// The stream delivered a different number of frames than announced
    #[error("Stream length mismatch: expected {expected} frames, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// A block ended in the middle of a frame
    #[error("Block of {0} samples does not hold whole frames")]
    PartialFrame(usize),

    /// The offset was never registered with the engine
    #[error("Offset {0} is not registered")]
    OffsetNotRegistered(i32),

    /// The offset exceeds the boundary window
    #[error("Offset {offset} out of range (limit {limit})")]
    OffsetOutOfRange { offset: i32, limit: usize },

    /// A neighboring track is too short to lend the requested frames
    #[error("Boundary window too short: need {needed} frames, have {available}")]
    WindowTooShort { needed: usize, available: usize },

    /// The offset borrows from a neighboring track that failed
    #[error("Offset {0} needs a neighboring track that failed")]
    NeighborFailed(i32),

    /// The track length is not a whole number of sectors
    #[error("Track of {0} frames is not sector aligned")]
    NotSectorAligned(u64),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The submission context is shutting down
    #[error("Context cancelled")]
    Cancelled,

    /// No jobs are in flight for this context
    #[error("No more results")]
    NoMoreResults,

    /// A scheduler lock was poisoned by a panicking thread
    #[error("Scheduler lock poisoned")]
    Poisoned,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
