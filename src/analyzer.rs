//! Read-only archive summary.
//!
//! The same [`summarize`] backs `analyze`, the report printed before
//! extraction, and the verification pass after a repack, so all three agree
//! on what a "file" is and how compression is counted.

use std::fmt;

use crate::archive::{Archive, CompressionProfile};
use crate::signature::SignatureAlgorithm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub file_count:               usize,
    pub total_uncompressed_size:  u64,
    pub total_compressed_size:    u64,
    pub compression_profile:      CompressionProfile,
    pub signature_algorithm:      Option<SignatureAlgorithm>,
    /// `None` when there is no signature or it is not a plain hash.
    pub signature_intact:         Option<bool>,
}

impl ArchiveSummary {
    pub fn signature_algorithm_name(&self) -> &'static str {
        self.signature_algorithm.map(|a| a.name()).unwrap_or("none")
    }
}

pub fn summarize(archive: &Archive) -> ArchiveSummary {
    let (count, raw, packed) = archive.files().fold((0usize, 0u64, 0u64), |(n, raw, packed), e| {
        (n + 1, raw + e.uncompressed_size() as u64, packed + e.compressed_size() as u64)
    });
    ArchiveSummary {
        file_count:              count,
        total_uncompressed_size: raw,
        total_compressed_size:   packed,
        compression_profile:     archive.compression_profile(),
        signature_algorithm:     archive.signature_algorithm(),
        signature_intact:        archive.signature().and_then(|s| s.intact),
    }
}

impl fmt::Display for ArchiveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Files          {}", self.file_count)?;
        writeln!(f, "  Uncompressed   {} B", self.total_uncompressed_size)?;
        writeln!(f, "  Stored         {} B", self.total_compressed_size)?;
        let histogram: Vec<String> = self.compression_profile.iter()
            .map(|(kind, n)| format!("{kind}: {n} files"))
            .collect();
        writeln!(f, "  Compression    {}", if histogram.is_empty() { "none".into() } else { histogram.join(", ") })?;
        let state = match self.signature_intact {
            Some(true)  => " (intact)",
            Some(false) => " (MISMATCH)",
            None        => "",
        };
        write!(f, "  Signature      {}{}", self.signature_algorithm_name(), state)
    }
}
