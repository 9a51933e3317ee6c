//! Acoustic fingerprints.
//!
//! The engine feeds the first `fingerprint_seconds` of a track to a
//! [`Fingerprinter`] and stores the finished, base64url-encoded
//! fingerprint. With the `chromaprint` feature a pure Rust Chromaprint
//! port provides the raw fingerprint; [`encode_fingerprint`] turns raw
//! sub-fingerprints into the compressed string AcoustID expects.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::error::Result;

/// Chromaprint algorithm identifier of the default (`TEST2`) configuration
pub const ALGORITHM_TEST2: u8 = 1;

/// Largest bit distance stored in the 3-bit section
const MAX_NORMAL_VALUE: u8 = 7;

/// Consumer of interleaved PCM producing an acoustic fingerprint.
pub trait Fingerprinter: Send {
    /// Prepare for a new stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream parameters are not supported.
    fn start(&mut self, sample_rate: u32, channels: u16) -> Result<()>;

    /// Consume interleaved samples.
    ///
    /// # Errors
    ///
    /// Returns an error if the fingerprinter rejects the audio.
    fn feed(&mut self, samples: &[i16]) -> Result<()>;

    /// Finish the stream and return the encoded fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if no fingerprint could be computed.
    fn finish(&mut self) -> Result<String>;
}

/// Append the set-bit distances of one sub-fingerprint, then a terminator.
fn push_bit_distances(mut x: u32, bits: &mut Vec<u8>) {
    let mut bit = 1u8;
    let mut last = 0u8;
    while x != 0 {
        if x & 1 != 0 {
            bits.push(bit - last);
            last = bit;
        }
        x >>= 1;
        bit += 1;
    }
    bits.push(0);
}

/// Pack `width`-bit values least significant bit first.
fn pack_bits(values: impl IntoIterator<Item = u8>, width: u32, out: &mut Vec<u8>) {
    let mut acc = 0u32;
    let mut held = 0u32;
    for value in values {
        acc |= (u32::from(value) & ((1 << width) - 1)) << held;
        held += width;
        while held >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            held -= 8;
        }
    }
    if held > 0 {
        out.push(acc as u8);
    }
}

/// Compress raw sub-fingerprints into the Chromaprint binary format.
pub fn compress_fingerprint(raw: &[u32], algorithm: u8) -> Vec<u8> {
    let mut bits = Vec::new();
    let mut previous = 0u32;
    for &sub in raw {
        push_bit_distances(sub ^ previous, &mut bits);
        previous = sub;
    }

    let size = raw.len() as u32;
    let mut out = vec![
        algorithm,
        (size >> 16) as u8,
        (size >> 8) as u8,
        size as u8,
    ];
    pack_bits(bits.iter().map(|b| (*b).min(MAX_NORMAL_VALUE)), 3, &mut out);
    pack_bits(
        bits.iter()
            .filter(|b| **b >= MAX_NORMAL_VALUE)
            .map(|b| b - MAX_NORMAL_VALUE),
        5,
        &mut out,
    );
    out
}

/// Compress and base64url-encode raw sub-fingerprints.
pub fn encode_fingerprint(raw: &[u32], algorithm: u8) -> String {
    URL_SAFE_NO_PAD.encode(compress_fingerprint(raw, algorithm))
}

#[cfg(feature = "chromaprint")]
pub use chromaprint::ChromaprintFingerprinter;

#[cfg(feature = "chromaprint")]
mod chromaprint {
    use rusty_chromaprint::{Configuration, Fingerprinter as Printer};

    use super::{encode_fingerprint, Fingerprinter, ALGORITHM_TEST2};
    use crate::error::{Error, Result};

    /// Chromaprint `TEST2` fingerprints computed by `rusty-chromaprint`.
    pub struct ChromaprintFingerprinter {
        config: Configuration,
        printer: Printer,
    }

    impl ChromaprintFingerprinter {
        /// Create a fingerprinter with the default Chromaprint configuration.
        pub fn new() -> Self {
            let config = Configuration::preset_test2();
            let printer = Printer::new(&config);
            Self { config, printer }
        }
    }

    impl Default for ChromaprintFingerprinter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Fingerprinter for ChromaprintFingerprinter {
        fn start(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
            self.printer = Printer::new(&self.config);
            self.printer
                .start(sample_rate, u32::from(channels))
                .map_err(|e| Error::Fingerprint(format!("{e:?}")))
        }

        fn feed(&mut self, samples: &[i16]) -> Result<()> {
            self.printer.consume(samples);
            Ok(())
        }

        fn finish(&mut self) -> Result<String> {
            self.printer.finish();
            let raw = self.printer.fingerprint();
            if raw.is_empty() {
                return Err(Error::Fingerprint("stream too short".to_string()));
            }
            Ok(encode_fingerprint(raw, ALGORITHM_TEST2))
        }
    }
}

/// Deterministic fingerprinter for tests: encodes a rolling hash of the
/// samples it was fed, one sub-fingerprint per 4096 samples.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct HashFingerprinter {
    /// Samples fed since the last `start`, shared with the test
    pub fed: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    hash: u32,
    raw: Vec<u32>,
}

#[cfg(test)]
impl Fingerprinter for HashFingerprinter {
    fn start(&mut self, _sample_rate: u32, _channels: u16) -> Result<()> {
        self.fed.store(0, std::sync::atomic::Ordering::SeqCst);
        self.hash = 0;
        self.raw.clear();
        Ok(())
    }

    fn feed(&mut self, samples: &[i16]) -> Result<()> {
        for sample in samples {
            self.hash = self.hash.rotate_left(5) ^ u32::from(*sample as u16);
            let fed = self.fed.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if fed % 4096 == 0 {
                self.raw.push(self.hash);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<String> {
        self.raw.push(self.hash);
        Ok(encode_fingerprint(&self.raw, ALGORITHM_TEST2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_one_bit() {
        assert_eq!(compress_fingerprint(&[1], 0), vec![0, 0, 0, 1, 0x01]);
    }

    #[test]
    fn test_compress_three_bits() {
        assert_eq!(compress_fingerprint(&[7], 0), vec![0, 0, 0, 1, 0x49, 0x00]);
    }

    #[test]
    fn test_compress_exceptional_bit() {
        // Bit 7 overflows the 3-bit section into the 5-bit one
        assert_eq!(compress_fingerprint(&[1 << 6], 0), vec![0, 0, 0, 1, 0x07, 0x00]);
    }

    #[test]
    fn test_compress_xor_delta() {
        // Identical sub-fingerprints only add a terminator each
        let single = compress_fingerprint(&[5], 1);
        let twice = compress_fingerprint(&[5, 5], 1);
        assert_eq!(twice[3], 2);
        assert_eq!(single[4..], twice[4..]);
    }

    #[test]
    fn test_encode_is_url_safe() {
        let encoded = encode_fingerprint(&[0xffff_ffff, 0x1234_5678, 0], ALGORITHM_TEST2);
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(encoded.starts_with("AQAAA"));
    }

    #[test]
    fn test_hash_fingerprinter() {
        let mut printer = HashFingerprinter::default();
        printer.start(44100, 2).unwrap();
        printer.feed(&[1, 2, 3]).unwrap();
        let first = printer.finish().unwrap();

        printer.start(44100, 2).unwrap();
        printer.feed(&[1, 2, 3]).unwrap();
        assert_eq!(printer.finish().unwrap(), first);
        assert_eq!(printer.fed.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
