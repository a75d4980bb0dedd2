//! Read-side [`Archive`] view, the primary embedding surface.
//!
//! ```no_run
//! use pharkit::archive::Archive;
//! use pharkit::codec::CompressionKind;
//! use pharkit::io_stream::ArchiveBuilder;
//! use pharkit::signature::SignatureAlgorithm;
//!
//! // Write
//! let mut b = ArchiveBuilder::new(SignatureAlgorithm::Sha1)?;
//! b.add_entry("index.php", b"<?php echo 'hi';".to_vec(), CompressionKind::Gz)?;
//! b.finalize("out.phar")?;
//!
//! // Read
//! let ar = Archive::open("out.phar")?;
//! assert_eq!(ar.read_file("index.php")?, b"<?php echo 'hi';");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{get_codec, CompressionKind};
use crate::error::{PharError, Result};
use crate::metadata::Metadata;
use crate::signature::SignatureAlgorithm;

// ── Entry ─────────────────────────────────────────────────────────────────────

/// One logical file inside an archive.
///
/// Sizes and the checksum are the values recorded in the manifest; they are
/// never set independently of the payload.  The payload itself stays in the
/// container until [`Archive::decompress_payload`] asks for it.
#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) name:              String,
    pub(crate) uncompressed_size: u32,
    pub(crate) compressed_size:   u32,
    pub(crate) crc32:             u32,
    pub(crate) compression:       CompressionKind,
    pub(crate) timestamp:         u32,
    pub(crate) permissions:       u32,
    pub(crate) metadata:          Metadata,
    /// Absolute offset of the stored payload in the container.
    pub(crate) offset:            u64,
}

impl Entry {
    pub fn name(&self)              -> &str { &self.name }
    pub fn uncompressed_size(&self) -> u32 { self.uncompressed_size }
    pub fn compressed_size(&self)   -> u32 { self.compressed_size }
    pub fn crc32(&self)             -> u32 { self.crc32 }
    pub fn compression(&self)       -> CompressionKind { self.compression }
    pub fn timestamp(&self)         -> u32 { self.timestamp }
    /// Unix permission bits (`0o777` mask).
    pub fn permissions(&self)       -> u32 { self.permissions }
    pub fn metadata(&self)          -> &Metadata { &self.metadata }
    pub fn offset(&self)            -> u64 { self.offset }

    /// Directory entries end with `/` and carry no payload.
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Decompress a stored payload and check it against the recorded size
    /// and crc32.  Any mismatch is a [`PharError::Decompression`].
    fn decode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let fail = |reason: String| PharError::Decompression { name: self.name.clone(), reason };

        let data = get_codec(self.compression)
            .decompress(payload, self.uncompressed_size as usize)
            .map_err(|e| fail(e.to_string()))?;

        if data.len() != self.uncompressed_size as usize {
            return Err(fail(format!(
                "expected {} bytes, stream produced {}{}",
                self.uncompressed_size,
                data.len(),
                if data.len() > self.uncompressed_size as usize { " or more" } else { "" },
            )));
        }
        let crc = crc32fast::hash(&data);
        if crc != self.crc32 {
            return Err(fail(format!("crc32 mismatch: manifest {:08x}, payload {crc:08x}", self.crc32)));
        }
        Ok(data)
    }
}

// ── Payload source ───────────────────────────────────────────────────────────

/// Where stored payloads are fetched from after the manifest is parsed.
#[derive(Debug, Clone)]
pub(crate) enum PayloadSource {
    Memory(Arc<[u8]>),
    File { file: Arc<File>, path: PathBuf },
}

impl PayloadSource {
    fn read(&self, entry: &Entry) -> Result<Vec<u8>> {
        let len = entry.compressed_size as usize;
        match self {
            PayloadSource::Memory(bytes) => {
                let start = entry.offset as usize;
                start.checked_add(len)
                    .and_then(|end| bytes.get(start..end))
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| PharError::format(start, format!("payload of '{}' is out of range", entry.name)))
            }
            PayloadSource::File { file, path } => {
                // Extents were checked against the file length during parse.
                let mut f: &File = file;
                let mut buf = Vec::with_capacity(len);
                f.seek(SeekFrom::Start(entry.offset))
                    .and_then(|_| f.take(len as u64).read_to_end(&mut buf))
                    .map_err(PharError::io(path))?;
                if buf.len() != len {
                    return Err(PharError::Io {
                        path: path.clone(),
                        source: io::Error::new(io::ErrorKind::UnexpectedEof, "archive shrank after it was opened"),
                    });
                }
                Ok(buf)
            }
        }
    }
}

// ── Signature ─────────────────────────────────────────────────────────────────

/// Trailing signature block as found in a container.
#[derive(Debug, Clone)]
pub struct Signature {
    pub algorithm: SignatureAlgorithm,
    pub bytes:     Vec<u8>,
    /// Whether the recomputed hash matched.  `None` for OpenSSL signatures,
    /// which are not checked.
    pub intact:    Option<bool>,
}

// ── CompressionProfile ───────────────────────────────────────────────────────

/// Histogram of compression kinds over an archive's file entries.
///
/// Persists as `{"GZ": 3, "None": 1}`.  Unknown kind names are dropped on
/// load, and an empty JSON array (how PHP encodes an empty map) reads as an
/// empty profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawProfile", into = "BTreeMap<String, u64>")]
pub struct CompressionProfile {
    counts: BTreeMap<CompressionKind, u64>,
}

impl CompressionProfile {
    pub fn new() -> Self { Self::default() }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut p = Self::new();
        for e in entries.into_iter().filter(|e| !e.is_dir()) {
            p.record(e.compression, 1);
        }
        p
    }

    pub fn record(&mut self, kind: CompressionKind, count: u64) {
        if count > 0 {
            *self.counts.entry(kind).or_insert(0) += count;
        }
    }

    pub fn count(&self, kind: CompressionKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn contains(&self, kind: CompressionKind) -> bool {
        self.count(kind) > 0
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CompressionKind, u64)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }
}

impl<const N: usize> From<[(CompressionKind, u64); N]> for CompressionProfile {
    fn from(pairs: [(CompressionKind, u64); N]) -> Self {
        let mut p = Self::new();
        for (kind, count) in pairs {
            p.record(kind, count);
        }
        p
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawProfile {
    Counts(BTreeMap<String, u64>),
    Empty(Vec<serde::de::IgnoredAny>),
}

impl From<RawProfile> for CompressionProfile {
    fn from(raw: RawProfile) -> Self {
        let mut p = Self::new();
        if let RawProfile::Counts(map) = raw {
            for (name, count) in map {
                if let Some(kind) = CompressionKind::from_name(&name) {
                    p.record(kind, count);
                }
            }
        }
        p
    }
}

impl From<CompressionProfile> for BTreeMap<String, u64> {
    fn from(p: CompressionProfile) -> Self {
        p.counts.into_iter().map(|(k, v)| (k.name().to_owned(), v)).collect()
    }
}

// ── Archive ───────────────────────────────────────────────────────────────────

/// Immutable, fully parsed container.
#[derive(Debug, Clone)]
pub struct Archive {
    pub(crate) stub:        Vec<u8>,
    pub(crate) alias:       String,
    pub(crate) api_version: u16,
    pub(crate) metadata:    Metadata,
    pub(crate) entries:     Vec<Entry>,
    pub(crate) signature:   Option<Signature>,
    pub(crate) source:      PayloadSource,
}

impl Archive {
    /// Parse container bytes.  See [`crate::io_stream::parse`].
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        crate::io_stream::parse(bytes)
    }

    /// Parse the container at `path`.  Only the stub, manifest and footer
    /// are loaded; payloads are read one at a time on demand.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        crate::io_stream::open(path.as_ref())
    }

    pub fn stub(&self)        -> &[u8] { &self.stub }
    pub fn alias(&self)       -> &str { &self.alias }
    pub fn api_version(&self) -> u16 { self.api_version }
    pub fn metadata(&self)    -> &Metadata { &self.metadata }
    pub fn entries(&self)     -> &[Entry] { &self.entries }
    pub fn signature(&self)   -> Option<&Signature> { self.signature.as_ref() }

    pub fn signature_algorithm(&self) -> Option<SignatureAlgorithm> {
        self.signature.as_ref().map(|s| s.algorithm)
    }

    /// File entries, directories excluded.
    pub fn files(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| !e.is_dir())
    }

    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn compression_profile(&self) -> CompressionProfile {
        CompressionProfile::from_entries(&self.entries)
    }

    /// The stored (still compressed) bytes of `entry`.
    pub fn raw_payload(&self, entry: &Entry) -> Result<Vec<u8>> {
        self.source.read(entry)
    }

    /// Fetch, decompress and verify one entry of this archive.
    pub fn decompress_payload(&self, entry: &Entry) -> Result<Vec<u8>> {
        entry.decode(&self.source.read(entry)?)
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self.entry(name).ok_or_else(|| PharError::Io {
            path: name.into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such entry in archive"),
        })?;
        self.decompress_payload(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_json_uses_kind_names() {
        let p = CompressionProfile::from([(CompressionKind::Bz2, 3), (CompressionKind::Gz, 1)]);
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"BZ2":3,"GZ":1}"#);
    }

    #[test]
    fn profile_load_ignores_unknown_kinds() {
        let p: CompressionProfile = serde_json::from_str(r#"{"GZ":2,"LZ4":9}"#).unwrap();
        assert_eq!(p, CompressionProfile::from([(CompressionKind::Gz, 2)]));
    }

    #[test]
    fn php_empty_array_is_empty_profile() {
        let p: CompressionProfile = serde_json::from_str("[]").unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn zero_counts_are_not_recorded() {
        let p = CompressionProfile::from([(CompressionKind::Bz2, 0), (CompressionKind::None, 5)]);
        assert!(!p.contains(CompressionKind::Bz2));
        assert_eq!(p.total(), 5);
    }
}
