//! Payload codec registry.
//!
//! A PHAR entry records its compression in two bits of the per-entry flags
//! word.  Only three kinds exist and they are frozen by the container format:
//!
//! | kind | entry flag | payload stream |
//! |------|-----------|----------------|
//! | `None` | none | stored verbatim |
//! | `GZ` | `0x1000` | raw DEFLATE (no zlib/gzip header) |
//! | `BZ2` | `0x2000` | bzip2 stream |
//!
//! An entry with both bits set is malformed and rejected by the reader.

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Entry flag bit: payload is raw DEFLATE.
pub const ENTRY_FLAG_GZ:  u32 = 0x0000_1000;
/// Entry flag bit: payload is bzip2.
pub const ENTRY_FLAG_BZ2: u32 = 0x0000_2000;
/// Mask covering both compression bits.
pub const ENTRY_FLAG_COMPRESSION_MASK: u32 = ENTRY_FLAG_GZ | ENTRY_FLAG_BZ2;

// ── CompressionKind ──────────────────────────────────────────────────────────

/// Per-entry compression scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CompressionKind {
    #[serde(rename = "None")]
    None,
    #[serde(rename = "GZ")]
    Gz,
    #[serde(rename = "BZ2")]
    Bz2,
}

impl CompressionKind {
    pub const ALL: [CompressionKind; 3] = [CompressionKind::None, CompressionKind::Gz, CompressionKind::Bz2];

    /// Decode the compression bits of an entry flags word.
    ///
    /// Returns `None` if both GZ and BZ2 are set.
    pub fn from_entry_flags(flags: u32) -> Option<Self> {
        match flags & ENTRY_FLAG_COMPRESSION_MASK {
            0              => Some(CompressionKind::None),
            ENTRY_FLAG_GZ  => Some(CompressionKind::Gz),
            ENTRY_FLAG_BZ2 => Some(CompressionKind::Bz2),
            _              => None,
        }
    }

    /// The compression bits this kind contributes to an entry flags word.
    #[inline]
    pub fn entry_flag(self) -> u32 {
        match self {
            CompressionKind::None => 0,
            CompressionKind::Gz   => ENTRY_FLAG_GZ,
            CompressionKind::Bz2  => ENTRY_FLAG_BZ2,
        }
    }

    /// Name used in the sidecar record and in reports.
    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::None => "None",
            CompressionKind::Gz   => "GZ",
            CompressionKind::Bz2  => "BZ2",
        }
    }

    /// Parse from a CLI or sidecar string (case-insensitive).
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"         => Some(CompressionKind::None),
            "gz" | "gzip"  => Some(CompressionKind::Gz),
            "bz2" | "bzip2" => Some(CompressionKind::Bz2),
            _              => None,
        }
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{kind} compression failed: {source}")]
    Compression { kind: CompressionKind, source: io::Error },
    #[error("{kind} stream is corrupt: {source}")]
    Decompression { kind: CompressionKind, source: io::Error },
}

/// Upper bound on the output buffer reserved up front.  The recorded size
/// comes from the container and is not trusted for allocation.
const MAX_PREALLOC: usize = 1 << 20;

fn output_buffer(data: &[u8], expected: usize) -> Vec<u8> {
    Vec::with_capacity(expected.min(data.len().saturating_mul(8)).min(MAX_PREALLOC))
}

/// Stream limit: one byte more than the recorded size.
fn read_limit(expected: usize) -> u64 {
    (expected as u64).saturating_add(1)
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec {
    fn kind(&self) -> CompressionKind;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// `expected` is the uncompressed size recorded in the manifest.  Output
    /// stops one byte past it, so an overlong stream is detectable without
    /// being buffered in full.
    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn kind(&self) -> CompressionKind { CompressionKind::None }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        Ok(data[..data.len().min(expected.saturating_add(1))].to_vec())
    }
}

pub struct GzCodec;
impl Codec for GzCodec {
    fn kind(&self) -> CompressionKind { CompressionKind::Gz }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let wrap = |source| CodecError::Compression { kind: CompressionKind::Gz, source };
        let mut enc = flate2::write::DeflateEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::default(),
        );
        enc.write_all(data).map_err(wrap)?;
        enc.finish().map_err(wrap)
    }
    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = output_buffer(data, expected);
        flate2::read::DeflateDecoder::new(data)
            .take(read_limit(expected))
            .read_to_end(&mut out)
            .map_err(|source| CodecError::Decompression { kind: CompressionKind::Gz, source })?;
        Ok(out)
    }
}

pub struct Bz2Codec;
impl Codec for Bz2Codec {
    fn kind(&self) -> CompressionKind { CompressionKind::Bz2 }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let wrap = |source| CodecError::Compression { kind: CompressionKind::Bz2, source };
        let mut enc = bzip2::write::BzEncoder::new(
            Vec::with_capacity(data.len() / 2),
            bzip2::Compression::default(),
        );
        enc.write_all(data).map_err(wrap)?;
        enc.finish().map_err(wrap)
    }
    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = output_buffer(data, expected);
        bzip2::read::BzDecoder::new(data)
            .take(read_limit(expected))
            .read_to_end(&mut out)
            .map_err(|source| CodecError::Decompression { kind: CompressionKind::Bz2, source })?;
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a [`CompressionKind`] to its codec.
pub fn get_codec(kind: CompressionKind) -> Box<dyn Codec> {
    match kind {
        CompressionKind::None => Box::new(NoneCodec),
        CompressionKind::Gz   => Box::new(GzCodec),
        CompressionKind::Bz2  => Box::new(Bz2Codec),
    }
}
