//! Extract and repack operations.
//!
//! Each call takes an immutable request value; nothing is kept between
//! calls.  Callers must not run an extract and a repack against the same
//! directory at the same time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::analyzer::{summarize, ArchiveSummary};
use crate::archive::Archive;
use crate::codec::CompressionKind;
use crate::error::{PharError, Result};
use crate::io_stream::ArchiveBuilder;
use crate::path::{local_name_of, resolve};
use crate::policy;
use crate::sidecar::{self, is_sidecar};
use crate::signature::SignatureAlgorithm;

/// Signature used for rebuilt archives when neither the request nor the
/// sidecar names one.
pub const DEFAULT_SIGNATURE: SignatureAlgorithm = SignatureAlgorithm::Sha1;

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub summary: ArchiveSummary,
    pub sidecar: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RepackRequest {
    pub source:      PathBuf,
    pub target:      PathBuf,
    /// Overrides the sidecar's algorithm and the default.
    pub signature:   Option<SignatureAlgorithm>,
    /// Overrides the compression policy.
    pub compression: Option<CompressionKind>,
}

#[derive(Debug, Clone)]
pub struct RepackOutcome {
    pub summary:         ArchiveSummary,
    pub files_processed: usize,
    pub archive_size:    u64,
    pub compression:     CompressionKind,
    pub signature:       SignatureAlgorithm,
    pub used_sidecar:    bool,
}

// ── Extract ──────────────────────────────────────────────────────────────────

/// Unpack `req.source` into `req.target` and leave a sidecar record there.
///
/// The manifest is parsed before the filesystem is touched.  Entries are
/// then decompressed one at a time into a staging directory beside the
/// target, which only moves into place once every entry has verified.
pub fn extract(req: &ExtractRequest) -> Result<ExtractOutcome> {
    let archive = Archive::open(&req.source)?;

    let summary = summarize(&archive);
    info!(
        source = %req.source.display(),
        files = summary.file_count,
        signature = summary.signature_algorithm_name(),
        "extracting archive"
    );

    let parent = staging_parent(&req.target);
    fs::create_dir_all(parent).map_err(PharError::io(parent))?;
    let staging = tempfile::Builder::new()
        .prefix(".pharkit-extract-")
        .tempdir_in(parent)
        .map_err(PharError::io(parent))?;

    for entry in archive.entries() {
        let dest = resolve(staging.path(), entry.name().trim_end_matches('/'));
        if entry.is_dir() {
            fs::create_dir_all(&dest).map_err(PharError::io(&dest))?;
            continue;
        }
        let data = archive.decompress_payload(entry)?;
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir).map_err(PharError::io(dir))?;
        }
        fs::write(&dest, &data).map_err(PharError::io(&dest))?;
        apply_permissions(&dest, entry.permissions())?;
        debug!(name = entry.name(), bytes = data.len(), "extracted entry");
    }
    sidecar::persist(&sidecar::capture(&archive), staging.path())?;
    // Temp dirs are created 0700; the target should look like a normal mkdir.
    apply_permissions(staging.path(), 0o755)?;

    move_tree(staging.path(), &req.target)?;
    info!(target = %req.target.display(), "extraction complete");
    Ok(ExtractOutcome {
        summary,
        sidecar: sidecar::sidecar_path(&req.target),
    })
}

// ── Repack ───────────────────────────────────────────────────────────────────

/// Build `req.target` from the tree at `req.source`.
pub fn repack(req: &RepackRequest) -> Result<RepackOutcome> {
    check_write_environment(&req.target)?;
    if !req.source.is_dir() {
        return Err(PharError::Io {
            path: req.source.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "source directory does not exist"),
        });
    }

    let record = sidecar::load(&req.source);
    let compression = req.compression.unwrap_or_else(|| {
        policy::decide(record.as_ref().and_then(|r| r.compression.as_ref()))
    });
    let signature = req.signature
        .or_else(|| record.as_ref().and_then(|r| r.signature_algorithm()))
        .unwrap_or(DEFAULT_SIGNATURE);
    info!(
        source = %req.source.display(),
        compression = %compression,
        signature = signature.name(),
        sidecar = record.is_some(),
        "repacking directory"
    );

    let mut builder = ArchiveBuilder::new(signature)?;
    let files = collect_tree(&req.source)?;
    for (name, path) in &files {
        builder.add_file(name, path, compression)?;
    }
    if let Some(record) = &record {
        builder.set_metadata(record.metadata.clone());
        if let Some(stub) = &record.stub {
            builder.set_stub(stub.as_bytes());
        }
    }

    let committed = builder.finalize(&req.target)?;
    let summary = summarize(&Archive::open(&req.target)?);
    if summary.file_count != files.len() {
        warn!(expected = files.len(), found = summary.file_count, "rebuilt archive file count differs");
    }
    Ok(RepackOutcome {
        summary,
        files_processed: files.len(),
        archive_size: committed.size,
        compression,
        signature,
        used_sidecar: record.is_some(),
    })
}

/// Fail fast if an archive cannot be created at `target`.
///
/// Checks that the parent directory exists and accepts a new file, and that
/// an existing target is a writable regular file.  Nothing is left behind.
pub fn check_write_environment(target: &Path) -> Result<()> {
    let denied = |path: &Path, reason: String| PharError::ReadOnlyDestination { path: path.to_path_buf(), reason };

    let parent = staging_parent(target);
    if !parent.is_dir() {
        return Err(denied(parent, "directory does not exist".into()));
    }
    if let Ok(meta) = fs::metadata(target) {
        if meta.is_dir() {
            return Err(denied(target, "target is a directory".into()));
        }
        if meta.permissions().readonly() {
            return Err(denied(target, "target file is read-only".into()));
        }
    }
    tempfile::NamedTempFile::new_in(parent)
        .map(drop)
        .map_err(|e| denied(parent, e.to_string()))
}

// ── Tree helpers ─────────────────────────────────────────────────────────────

/// Every regular file under `root` as `(local name, path)`, sorted by name.
///
/// Sidecar files are skipped.  Symlinks to files are packed with the
/// target's contents; symlinked directories are not descended into, and
/// dangling links are skipped.
pub fn collect_tree(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for item in fs::read_dir(&dir).map_err(PharError::io(&dir))? {
            let item = item.map_err(PharError::io(&dir))?;
            let path = item.path();
            let file_type = item.file_type().map_err(PharError::io(&path))?;

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            let is_file = if file_type.is_symlink() {
                match fs::metadata(&path) {
                    Ok(meta) if meta.is_dir() => {
                        warn!(path = %path.display(), "not following symlinked directory");
                        false
                    }
                    Ok(meta) => meta.is_file(),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping dangling symlink");
                        false
                    }
                }
            } else {
                file_type.is_file()
            };
            if is_file && !is_sidecar(&path) {
                out.push((local_name_of(root, &path)?, path));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn staging_parent(target: &Path) -> &Path {
    crate::io_stream::target_parent(target)
}

/// Move the contents of `src` into `dst`, merging into existing directories
/// and replacing existing files.
fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        // Common case: one rename puts the whole tree in place.
        if fs::rename(src, dst).is_ok() {
            return Ok(());
        }
    }
    fs::create_dir_all(dst).map_err(PharError::io(dst))?;
    for item in fs::read_dir(src).map_err(PharError::io(src))? {
        let from = item.map_err(PharError::io(src))?.path();
        let Some(name) = from.file_name() else { continue };
        let to = dst.join(name);
        if from.is_dir() {
            move_tree(&from, &to)?;
        } else {
            if to.is_dir() {
                fs::remove_dir_all(&to).map_err(PharError::io(&to))?;
            }
            fs::rename(&from, &to).map_err(PharError::io(&to))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn apply_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    // Keep files readable and writable by the owner whatever the archive says.
    let mode = mode | 0o600;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(PharError::io(path))
}

#[cfg(not(unix))]
fn apply_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
