//! Entry name rules shared by the reader and the builder.
//!
//! A local name is relative, `/`-separated, and every segment is a plain
//! file name.  The same rule guards both directions: the builder refuses to
//! stage an unsafe name, and the reader refuses a container that carries
//! one, so an extracted entry can never land outside the extraction root.

use std::path::{Path, PathBuf};

use crate::error::{PharError, Result};

/// Check `name` and return the reason it is unsafe, if any.
pub fn check_local_name(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("empty name");
    }
    if name.starts_with('/') {
        return Some("absolute path");
    }
    if name.contains('\\') {
        return Some("backslash separator");
    }
    if name.contains('\0') {
        return Some("contains NUL byte");
    }
    for segment in name.split('/') {
        match segment {
            ""   => return Some("empty path segment"),
            "."  => return Some("'.' segment"),
            ".." => return Some("'..' segment"),
            s if s.len() == 2 && s.as_bytes()[1] == b':' && s.as_bytes()[0].is_ascii_alphabetic() => {
                return Some("drive prefix");
            }
            _ => {}
        }
    }
    None
}

/// Validate a local name, yielding [`PharError::InvalidPath`] on failure.
pub fn validate_local_name(name: &str) -> Result<()> {
    match check_local_name(name) {
        None         => Ok(()),
        Some(reason) => Err(PharError::InvalidPath { name: name.to_owned(), reason }),
    }
}

/// Resolve an already-validated local name under `root`.
pub fn resolve(root: &Path, name: &str) -> PathBuf {
    name.split('/').fold(root.to_path_buf(), |acc, seg| acc.join(seg))
}

/// Build the local name of `path` relative to `root`, `/`-joined.
pub fn local_name_of(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| PharError::InvalidPath {
        name: path.display().to_string(),
        reason: "outside of the source tree",
    })?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        let part = comp.as_os_str().to_str().ok_or_else(|| PharError::InvalidPath {
            name: rel.display().to_string(),
            reason: "not valid UTF-8",
        })?;
        parts.push(part);
    }
    let name = parts.join("/");
    validate_local_name(&name)?;
    Ok(name)
}
