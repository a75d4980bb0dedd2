//! Sidecar record carried across an extract → repack boundary.
//!
//! Stored as JSON in a hidden file at the root of the extracted tree:
//!
//! ```json
//! { "metadata": {"version": "1.0"}, "compression": {"GZ": 3},
//!   "signature": "SHA-1", "stub": "<?php … __HALT_COMPILER(); ?>\r\n" }
//! ```
//!
//! `signature` and `stub` are optional.  A missing or unreadable record is
//! never fatal: [`load`] reports it and returns `None`, and the caller falls
//! back to the default compression policy.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::archive::{Archive, CompressionProfile};
use crate::error::{PharError, Result};
use crate::metadata::Metadata;
use crate::signature::SignatureAlgorithm;

/// File name of the record inside the extraction root.
pub const SIDECAR_FILE_NAME: &str = ".pharinfo";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    #[serde(default)]
    pub metadata:    Metadata,
    #[serde(default)]
    pub compression: Option<CompressionProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature:   Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stub:        Option<String>,
}

impl SidecarRecord {
    /// Recorded signature algorithm, if it names one this crate can write.
    pub fn signature_algorithm(&self) -> Option<SignatureAlgorithm> {
        self.signature.as_deref()
            .and_then(SignatureAlgorithm::from_name)
            .filter(|alg| alg.is_hash())
    }
}

/// Derive the record from a parsed archive.
pub fn capture(archive: &Archive) -> SidecarRecord {
    let stub = match std::str::from_utf8(archive.stub()) {
        Ok(s) if !s.is_empty() => Some(s.to_owned()),
        Ok(_) => None,
        Err(_) => {
            warn!("stub is not UTF-8; it will not be carried to the rebuilt archive");
            None
        }
    };
    SidecarRecord {
        metadata:    archive.metadata().clone(),
        compression: Some(archive.compression_profile()),
        signature:   archive.signature_algorithm().map(|a| a.name().to_owned()),
        stub,
    }
}

pub fn sidecar_path(dir: &Path) -> PathBuf {
    dir.join(SIDECAR_FILE_NAME)
}

/// True if `path` names a sidecar file, wherever it sits in the tree.
pub fn is_sidecar(path: &Path) -> bool {
    path.file_name().is_some_and(|n| n == SIDECAR_FILE_NAME)
}

/// Write `record` into `dir`, replacing any existing record.
pub fn persist(record: &SidecarRecord, dir: &Path) -> Result<PathBuf> {
    let path = sidecar_path(dir);
    let json = serde_json::to_vec(record).map_err(|e| PharError::Io {
        path: path.clone(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;
    fs::write(&path, json).map_err(PharError::io(&path))?;
    debug!(path = %path.display(), "sidecar written");
    Ok(path)
}

/// Strict loader: `Ok(None)` when absent, [`PharError::Sidecar`] when the
/// file exists but cannot be used.
pub fn try_load(dir: &Path) -> Result<Option<SidecarRecord>> {
    let path = sidecar_path(dir);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PharError::Sidecar { path, reason: e.to_string() }),
    };
    // A literal `null` is what gets written when the source archive could not be
    // analysed; treat it as absent.
    serde_json::from_slice::<Option<SidecarRecord>>(&bytes)
        .map_err(|e| PharError::Sidecar { path, reason: e.to_string() })
}

/// Lenient loader used by repack.  Problems are logged, never returned.
pub fn load(dir: &Path) -> Option<SidecarRecord> {
    match try_load(dir) {
        Ok(Some(record)) => Some(record),
        Ok(None) => {
            debug!(dir = %dir.display(), "no sidecar record");
            None
        }
        Err(e) => {
            warn!(error = %e, "ignoring sidecar record, using default policy");
            None
        }
    }
}
