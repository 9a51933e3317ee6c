//! Engine configuration.
//!
//! Every field has a default matching the AccurateRip conventions, so most
//! callers use [`EngineConfig::default`] and only tweak the fingerprint
//! duration or shrink the search ranges for short test tracks.

use crate::{
    constants::{
        FINGERPRINT_SECONDS, MAX_CHECKSUM_SEARCH_OFFSET, MAX_CRC_SEARCH_OFFSET,
        MIN_CRC_SEARCH_FRAMES,
    },
    error::{Error, Result},
    search::MAX_SEARCH_RANGE,
};

/// Tunables of a checksum engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Frames searched on each side by `find_offset_by_checksum`
    max_checksum_offset: u32,
    /// Frames searched on each side by `find_offset_by_crc`
    max_crc_offset: u32,
    /// Tracks shorter than this skip the CRC search table
    crc_search_min_frames: u64,
    /// Seconds of audio fed to the fingerprinter
    fingerprint_seconds: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self {
            max_checksum_offset: MAX_CHECKSUM_SEARCH_OFFSET,
            max_crc_offset: MAX_CRC_SEARCH_OFFSET,
            crc_search_min_frames: MIN_CRC_SEARCH_FRAMES,
            fingerprint_seconds: FINGERPRINT_SECONDS,
        }
    }

    /// Create a configuration with custom settings.
    pub fn with_settings(
        max_checksum_offset: u32,
        max_crc_offset: u32,
        crc_search_min_frames: u64,
        fingerprint_seconds: u32,
    ) -> Self {
        Self {
            max_checksum_offset,
            max_crc_offset,
            crc_search_min_frames,
            fingerprint_seconds,
        }
    }

    /// Search range of the rolling-sum offset search.
    #[inline]
    pub fn max_checksum_offset(&self) -> u32 {
        self.max_checksum_offset
    }

    /// Search range of the CRC32 offset search.
    #[inline]
    pub fn max_crc_offset(&self) -> u32 {
        self.max_crc_offset
    }

    /// Minimum track length for the CRC32 offset search.
    #[inline]
    pub fn crc_search_min_frames(&self) -> u64 {
        self.crc_search_min_frames
    }

    /// Seconds of audio fed to the fingerprinter.
    #[inline]
    pub fn fingerprint_seconds(&self) -> u32 {
        self.fingerprint_seconds
    }

    pub fn set_max_checksum_offset(&mut self, frames: u32) {
        self.max_checksum_offset = frames;
    }

    pub fn set_max_crc_offset(&mut self, frames: u32) {
        self.max_crc_offset = frames;
    }

    pub fn set_crc_search_min_frames(&mut self, frames: u64) {
        self.crc_search_min_frames = frames;
    }

    pub fn set_fingerprint_seconds(&mut self, seconds: u32) {
        self.fingerprint_seconds = seconds;
    }

    /// Check that the search ranges fit in front of the search sector.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.max_checksum_offset > MAX_SEARCH_RANGE {
            return Err(Error::InvalidConfig(format!(
                "max_checksum_offset {} exceeds {MAX_SEARCH_RANGE}",
                self.max_checksum_offset
            )));
        }
        if self.max_crc_offset > MAX_SEARCH_RANGE {
            return Err(Error::InvalidConfig(format!(
                "max_crc_offset {} exceeds {MAX_SEARCH_RANGE}",
                self.max_crc_offset
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_checksum_offset(), 1024);
        assert_eq!(config.max_crc_offset(), 2940);
        assert_eq!(config.crc_search_min_frames(), 501 * 588);
        assert_eq!(config.fingerprint_seconds(), 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_huge_range() {
        let mut config = EngineConfig::with_settings(16, 16, 0, 1);
        assert!(config.validate().is_ok());
        config.set_max_crc_offset(MAX_SEARCH_RANGE + 1);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
