use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;
use crate::signature::SignatureAlgorithm;

/// Every failure the codec and the extract/repack operations can report.
///
/// Only [`PharError::Sidecar`] is recoverable: callers treat it as "no
/// sidecar" and fall back to the default compression policy.  Everything else
/// aborts the operation it came from.
#[derive(Error, Debug)]
pub enum PharError {
    /// Malformed container on read.  No partial archive is returned.
    #[error("malformed archive at byte {offset}: {reason}")]
    Format { offset: u64, reason: String },

    /// Corrupt entry payload; aborts the whole read.
    #[error("cannot decompress entry '{name}': {reason}")]
    Decompression { name: String, reason: String },

    #[error("cannot compress entry '{name}': {source}")]
    Compression { name: String, #[source] source: CodecError },

    /// Writing a compressed payload to the builder's spool file failed.
    #[error("cannot spool entry '{name}': {source}")]
    Spool { name: String, #[source] source: io::Error },

    #[error("entry '{name}' is already staged")]
    DuplicateEntry { name: String },

    #[error("invalid entry path '{name}': {reason}")]
    InvalidPath { name: String, reason: &'static str },

    #[error("entry '{name}' is too large for the container ({size} bytes)")]
    EntryTooLarge { name: String, size: u64 },

    #[error("refusing to write an archive with no entries")]
    EmptyArchive,

    #[error("signature algorithm {0} cannot be produced without a private key")]
    UnsupportedSignature(SignatureAlgorithm),

    /// Write-environment precondition failed before any work started.
    #[error("cannot create archive at '{path}': {reason}")]
    ReadOnlyDestination { path: PathBuf, reason: String },

    #[error("unusable sidecar '{path}': {reason}")]
    Sidecar { path: PathBuf, reason: String },

    #[error("I/O error on '{path}': {source}")]
    Io { path: PathBuf, #[source] source: io::Error },
}

impl PharError {
    pub fn format(offset: usize, reason: impl Into<String>) -> Self {
        PharError::Format { offset: offset as u64, reason: reason.into() }
    }

    /// Adapter for `map_err` on I/O calls against `path`.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| PharError::Io { path, source }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, PharError::Sidecar { .. })
    }
}

pub type Result<T, E = PharError> = std::result::Result<T, E>;
