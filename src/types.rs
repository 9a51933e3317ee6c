//! Core type definitions.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::constants::BOUNDARY_FRAMES;

/// Signed frame offset of a drive read relative to the nominal position
pub type Offset = i32;

bitflags! {
    /// Work requested for a scheduled job, and the work that succeeded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct Actions: u32 {
        /// Consume the whole stream and accumulate checksums
        const CHECKSUM = 0x01;
        /// Compute the acoustic fingerprint
        const FINGERPRINT = 0x02;
    }
}

impl Default for Actions {
    fn default() -> Self {
        Actions::CHECKSUM
    }
}

/// Track region a shifted frame index falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Region {
    /// First five sectors
    LeadIn = 0,
    /// Everything between lead-in and lead-out
    Middle = 1,
    /// Last five sectors
    LeadOut = 2,
}

impl Region {
    /// All regions in stream order
    pub const ALL: [Region; 3] = [Region::LeadIn, Region::Middle, Region::LeadOut];

    /// Classify a 1-based shifted frame index of a track with `total` frames.
    ///
    /// Lead-in takes precedence on tracks shorter than two boundaries.
    pub fn classify(index: u64, total: u64) -> Region {
        let boundary = BOUNDARY_FRAMES as u64;
        if index < boundary {
            Region::LeadIn
        } else if index + boundary > total {
            Region::LeadOut
        } else {
            Region::Middle
        }
    }

    /// Inclusive range of 1-based shifted indices covered by this region.
    ///
    /// Returns `None` if the region is empty for a track of `total` frames.
    pub fn span(&self, total: u64) -> Option<(u64, u64)> {
        let boundary = BOUNDARY_FRAMES as u64;
        let lead_in_end = total.min(boundary - 1);
        let (first, last) = match self {
            Region::LeadIn => (1, lead_in_end),
            Region::Middle => (boundary, total.saturating_sub(boundary)),
            Region::LeadOut => (
                (lead_in_end + 1).max(total.saturating_sub(boundary) + 1),
                total,
            ),
        };
        (first <= last).then_some((first, last))
    }
}

/// Final checksums of one track at one offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Checksums {
    /// Offset the checksums were computed for
    pub offset: Offset,
    /// AccurateRip v1 checksum
    pub v1: u32,
    /// AccurateRip v2 checksum
    pub v2: u32,
    /// CRC32 over the whole shifted track
    pub crc32: u32,
    /// CRC32 with zero-valued samples left out
    pub crc32_skip_zero: u32,
}

/// Pack one frame of interleaved samples into its checksum value.
///
/// Stereo frames put the left channel in the low half word.
#[inline]
pub fn frame_value(frame: &[i16]) -> u32 {
    match frame {
        [mono] => u32::from(*mono as u16),
        [left, right, ..] => u32::from(*left as u16) | (u32::from(*right as u16) << 16),
        [] => 0,
    }
}

/// Weighted contributions of a frame at 1-based index `index` to the
/// v1 and v2 accumulators.
#[inline]
pub fn weigh(index: u64, value: u32) -> (u64, u64) {
    let product = index.wrapping_mul(u64::from(value));
    (product, (product >> 32) + (product & 0xffff_ffff))
}

/// Tag dictionary read from a sample source.
///
/// Well-known keys get their own fields; everything else lands in
/// `other` under the key the container used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub artist: Option<String>,
    pub compilation: Option<String>,
    pub composer: Option<String>,
    pub date: Option<String>,
    pub disc: Option<String>,
    pub sort_album_artist: Option<String>,
    pub sort_artist: Option<String>,
    pub sort_composer: Option<String>,
    pub title: Option<String>,
    pub track: Option<String>,
    /// Tags without a dedicated field
    pub other: BTreeMap<String, String>,
}

impl Metadata {
    /// Create an empty tag dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dictionary from key/value pairs, later keys overriding.
    pub fn from_tags<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut metadata = Self::new();
        for (key, value) in tags {
            metadata.insert(key.as_ref(), value);
        }
        metadata
    }

    /// Insert a tag. Keys are matched case-insensitively.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let slot = match key.to_ascii_lowercase().as_str() {
            "album" => &mut self.album,
            "album_artist" | "albumartist" | "album artist" => &mut self.album_artist,
            "artist" => &mut self.artist,
            "compilation" => &mut self.compilation,
            "composer" => &mut self.composer,
            "date" | "year" => &mut self.date,
            "disc" | "discnumber" => &mut self.disc,
            "sort_album_artist" | "albumartistsort" => &mut self.sort_album_artist,
            "sort_artist" | "artistsort" => &mut self.sort_artist,
            "sort_composer" | "composersort" => &mut self.sort_composer,
            "title" => &mut self.title,
            "track" | "tracknumber" => &mut self.track,
            _ => {
                self.other.insert(key.to_string(), value);
                return;
            }
        };
        *slot = Some(value);
    }

    /// Look up a tag by key, well-known or not.
    pub fn get(&self, key: &str) -> Option<&str> {
        let field = match key.to_ascii_lowercase().as_str() {
            "album" => &self.album,
            "album_artist" => &self.album_artist,
            "artist" => &self.artist,
            "compilation" => &self.compilation,
            "composer" => &self.composer,
            "date" => &self.date,
            "disc" => &self.disc,
            "sort_album_artist" => &self.sort_album_artist,
            "sort_artist" => &self.sort_artist,
            "sort_composer" => &self.sort_composer,
            "title" => &self.title,
            "track" => &self.track,
            _ => return self.other.get(key).map(String::as_str),
        };
        field.as_deref()
    }

    /// Check if no tag is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_value() {
        assert_eq!(frame_value(&[1, 2]), 0x0002_0001);
        assert_eq!(frame_value(&[-1, 0]), 0x0000_ffff);
        assert_eq!(frame_value(&[0, -1]), 0xffff_0000);
        assert_eq!(frame_value(&[-2]), 0xfffe);
    }

    #[test]
    fn test_weigh_v2_folds_high_word() {
        let (v1, v2) = weigh(3, 0xffff_ffff);
        assert_eq!(v1, 3 * 0xffff_ffff);
        assert_eq!(v2, 2 + 0xffff_fffd);
    }

    #[test]
    fn test_region_classify() {
        let total = 10_000;
        assert_eq!(Region::classify(1, total), Region::LeadIn);
        assert_eq!(Region::classify(2939, total), Region::LeadIn);
        assert_eq!(Region::classify(2940, total), Region::Middle);
        assert_eq!(Region::classify(7060, total), Region::Middle);
        assert_eq!(Region::classify(7061, total), Region::LeadOut);

        // Short track: lead-in wins
        assert_eq!(Region::classify(100, 1000), Region::LeadIn);
    }

    #[test]
    fn test_region_span_matches_classify() {
        for total in [0u64, 1, 2939, 2940, 5000, 5880, 5881, 12_000] {
            let mut covered = 0;
            for region in Region::ALL {
                if let Some((first, last)) = region.span(total) {
                    for index in first..=last {
                        assert_eq!(Region::classify(index, total), region, "{total} {index}");
                    }
                    covered += last - first + 1;
                }
            }
            assert_eq!(covered, total);
        }
    }

    #[test]
    fn test_metadata_keys() {
        let metadata = Metadata::from_tags([
            ("TITLE", "Liquid insects"),
            ("album_artist", "Amorphous androgynous"),
            ("encoder", "iTunes 11.1.3"),
        ]);
        assert_eq!(metadata.title.as_deref(), Some("Liquid insects"));
        assert_eq!(metadata.get("album_artist"), Some("Amorphous androgynous"));
        assert_eq!(metadata.get("encoder"), Some("iTunes 11.1.3"));
        assert!(!metadata.is_empty());
        assert!(Metadata::new().is_empty());
    }

    #[test]
    fn test_actions_bits() {
        assert_eq!(Actions::CHECKSUM.bits(), 0x1);
        assert_eq!(Actions::FINGERPRINT.bits(), 0x2);
        assert_eq!(Actions::all(), Actions::CHECKSUM | Actions::FINGERPRINT);
    }
}
