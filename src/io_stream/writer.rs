use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::codec::{get_codec, CompressionKind};
use crate::error::{PharError, Result};
use crate::manifest::{
    normalize_stub, EntryHeader, ManifestHeader, API_VERSION, DEFAULT_STUB, ENTRY_PERM_MASK,
    MANIFEST_FLAG_BZ2, MANIFEST_FLAG_GZ, MANIFEST_FLAG_SIGNATURE,
};
use crate::metadata::Metadata;
use crate::path::validate_local_name;
use crate::signature::{encode_footer, SignatureAlgorithm, SignatureHasher};

/// Permission bits for entries that do not come from a file on disk.
pub const DEFAULT_PERMISSIONS: u32 = 0o644;

/// Where a staged entry's bytes come from.
#[derive(Debug, Clone)]
pub enum EntrySource {
    Memory(Vec<u8>),
    /// Read during `finalize`, not when staged.
    File(PathBuf),
}

#[derive(Debug)]
struct StagedEntry {
    name:        String,
    source:      EntrySource,
    compression: CompressionKind,
}

/// Result of a successful [`ArchiveBuilder::finalize`].
#[derive(Debug, Clone)]
pub struct Committed {
    pub path:        PathBuf,
    pub size:        u64,
    pub entry_count: usize,
    pub signature:   Vec<u8>,
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Accumulates entries for a new container.
///
/// Nothing touches the filesystem until [`finalize`](Self::finalize), which
/// consumes the builder: once committed, the archive cannot be changed.
#[derive(Debug)]
pub struct ArchiveBuilder {
    signature: SignatureAlgorithm,
    stub:      Vec<u8>,
    alias:     String,
    metadata:  Metadata,
    staged:    Vec<StagedEntry>,
    names:     HashSet<String>,
}

impl ArchiveBuilder {
    /// Only hash algorithms can be produced; OpenSSL variants are rejected.
    pub fn new(signature: SignatureAlgorithm) -> Result<Self> {
        if !signature.is_hash() {
            return Err(PharError::UnsupportedSignature(signature));
        }
        Ok(Self {
            signature,
            stub:     DEFAULT_STUB.to_vec(),
            alias:    String::new(),
            metadata: Metadata::Null,
            staged:   Vec::new(),
            names:    HashSet::new(),
        })
    }

    /// Stage an in-memory payload.
    ///
    /// Fails with [`PharError::InvalidPath`] or [`PharError::DuplicateEntry`]
    /// and stages nothing in that case; the builder stays usable.
    pub fn add_entry(&mut self, name: &str, payload: impl Into<Vec<u8>>, compression: CompressionKind) -> Result<()> {
        self.stage(name, EntrySource::Memory(payload.into()), compression)
    }

    /// Stage a file on disk.  Its bytes, mtime and mode are read at
    /// finalize time.
    pub fn add_file(&mut self, name: &str, path: impl AsRef<Path>, compression: CompressionKind) -> Result<()> {
        self.stage(name, EntrySource::File(path.as_ref().to_path_buf()), compression)
    }

    fn stage(&mut self, name: &str, source: EntrySource, compression: CompressionKind) -> Result<()> {
        validate_local_name(name)?;
        if self.names.contains(name) {
            return Err(PharError::DuplicateEntry { name: name.to_owned() });
        }
        self.names.insert(name.to_owned());
        self.staged.push(StagedEntry { name: name.to_owned(), source, compression });
        Ok(())
    }

    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    /// Replace the bootstrap stub.  The halt token is appended when missing.
    pub fn set_stub(&mut self, stub: &[u8]) {
        self.stub = normalize_stub(stub);
    }

    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = alias.into();
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm { self.signature }
    pub fn len(&self) -> usize { self.staged.len() }
    pub fn is_empty(&self) -> bool { self.staged.is_empty() }

    // ── Finalization ─────────────────────────────────────────────────────────

    /// Compress, serialize, sign and atomically commit to `target`.
    ///
    /// On any error `target` is left as it was (or absent).  On success a
    /// stale `<target>.gz` sibling is removed as well; if that removal fails
    /// it is logged and the commit still stands.
    pub fn finalize<P: AsRef<Path>>(self, target: P) -> Result<Committed> {
        let target = target.as_ref();
        if self.staged.is_empty() {
            return Err(PharError::EmptyArchive);
        }

        // Pass 1: compress every payload into an anonymous spool file.
        let mut spool = tempfile::tempfile().map_err(PharError::io(target))?;
        let mut headers = Vec::with_capacity(self.staged.len());
        let mut flags = MANIFEST_FLAG_SIGNATURE;
        for staged in &self.staged {
            let header = spool_entry(staged, &mut spool)?;
            flags |= match staged.compression {
                CompressionKind::None => 0,
                CompressionKind::Gz   => MANIFEST_FLAG_GZ,
                CompressionKind::Bz2  => MANIFEST_FLAG_BZ2,
            };
            headers.push(header);
        }

        // Pass 2: manifest body.
        let mut body = Vec::new();
        ManifestHeader {
            entry_count: headers.len() as u32,
            api_version: API_VERSION,
            flags,
            alias:       self.alias.clone().into_bytes(),
            metadata:    self.metadata.to_php_bytes(),
        }.write(&mut body).map_err(PharError::io(target))?;
        for h in &headers {
            h.write(&mut body).map_err(PharError::io(target))?;
        }
        let body_len = u32::try_from(body.len()).map_err(|_| PharError::EntryTooLarge {
            name: "<manifest>".into(),
            size: body.len() as u64,
        })?;

        // Pass 3: stream everything into a temp file beside the target.
        let dir = parent_dir(target);
        let mut tmp = NamedTempFile::new_in(dir).map_err(PharError::io(dir))?;
        let hash = {
            let hasher = SignatureHasher::new(self.signature)
                .ok_or(PharError::UnsupportedSignature(self.signature))?;
            let mut out = HashingWriter { inner: BufWriter::new(tmp.as_file_mut()), hasher };
            let io_err = PharError::io(tmp_path_hint(target));
            let result: io::Result<Vec<u8>> = (|| {
                out.write_all(&self.stub)?;
                out.write_all(&body_len.to_le_bytes())?;
                out.write_all(&body)?;
                spool.seek(SeekFrom::Start(0))?;
                io::copy(&mut spool, &mut out)?;
                let HashingWriter { mut inner, hasher } = out;
                let hash = hasher.finalize();
                inner.write_all(&encode_footer(self.signature, &hash))?;
                inner.flush()?;
                Ok(hash)
            })();
            result.map_err(io_err)?
        };
        tmp.as_file().sync_all().map_err(PharError::io(tmp.path()))?;

        let size = tmp.as_file().metadata().map_err(PharError::io(tmp.path()))?.len();
        tmp.persist(target).map_err(|e| PharError::Io { path: target.to_path_buf(), source: e.error })?;
        // The archive is committed at this point; a leftover sibling is not
        // worth failing over.
        remove_compressed_sibling(target);

        info!(
            path = %target.display(),
            entries = headers.len(),
            bytes = size,
            signature = self.signature.name(),
            "archive committed"
        );
        Ok(Committed {
            path: target.to_path_buf(),
            size,
            entry_count: headers.len(),
            signature: hash,
        })
    }
}

/// Compress one staged entry, append it to `spool` and describe it.
fn spool_entry<W: Write>(staged: &StagedEntry, spool: &mut W) -> Result<EntryHeader> {
    let from_disk;
    let (data, timestamp, permissions): (&[u8], u32, u32) = match &staged.source {
        EntrySource::Memory(bytes) => (bytes, now_timestamp(), DEFAULT_PERMISSIONS),
        EntrySource::File(path) => {
            let mut buf = Vec::new();
            File::open(path)
                .and_then(|mut f| f.read_to_end(&mut buf))
                .map_err(PharError::io(path))?;
            let meta = fs::metadata(path).map_err(PharError::io(path))?;
            let timestamp = meta.modified()
                .map(|t| clamp_timestamp(DateTime::<Utc>::from(t).timestamp()))
                .unwrap_or_else(|_| now_timestamp());
            from_disk = buf;
            (&from_disk, timestamp, file_permissions(&meta))
        }
    };

    let too_large = |size: usize| PharError::EntryTooLarge { name: staged.name.clone(), size: size as u64 };
    let uncompressed_size = u32::try_from(data.len()).map_err(|_| too_large(data.len()))?;
    let crc32 = crc32fast::hash(&data);
    let payload = get_codec(staged.compression)
        .compress(&data)
        .map_err(|source| PharError::Compression { name: staged.name.clone(), source })?;
    let compressed_size = u32::try_from(payload.len()).map_err(|_| too_large(payload.len()))?;
    spool
        .write_all(&payload)
        .map_err(|source| PharError::Spool { name: staged.name.clone(), source })?;

    debug!(
        name = %staged.name,
        compression = %staged.compression,
        uncompressed_size,
        compressed_size,
        "staged entry compressed"
    );
    Ok(EntryHeader {
        name: staged.name.clone().into_bytes(),
        uncompressed_size,
        timestamp,
        compressed_size,
        crc32,
        flags: staged.compression.entry_flag() | (permissions & ENTRY_PERM_MASK),
        metadata: Vec::new(),
    })
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Feeds every byte written through it into the signature hash.
struct HashingWriter<W: Write> {
    inner:  W,
    hasher: SignatureHasher,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn parent_dir(target: &Path) -> &Path {
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn tmp_path_hint(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(" (temporary)");
    PathBuf::from(name)
}

fn compressed_sibling(target: &Path) -> PathBuf {
    let mut sibling = target.as_os_str().to_owned();
    sibling.push(".gz");
    PathBuf::from(sibling)
}

fn remove_compressed_sibling(target: &Path) {
    let sibling = compressed_sibling(target);
    match fs::remove_file(&sibling) {
        Ok(()) => debug!(path = %sibling.display(), "removed stale compressed sibling"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %sibling.display(), error = %e, "could not remove stale compressed sibling"),
    }
}

fn now_timestamp() -> u32 {
    clamp_timestamp(Utc::now().timestamp())
}

fn clamp_timestamp(secs: i64) -> u32 {
    secs.clamp(0, u32::MAX as i64) as u32
}

#[cfg(unix)]
fn file_permissions(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & ENTRY_PERM_MASK
}

#[cfg(not(unix))]
fn file_permissions(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { DEFAULT_PERMISSIONS }
}

pub(crate) fn target_parent(target: &Path) -> &Path {
    parent_dir(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_and_duplicate_names_leave_builder_usable() {
        let mut b = ArchiveBuilder::new(SignatureAlgorithm::Sha1).unwrap();
        assert!(matches!(
            b.add_entry("../evil", b"x".to_vec(), CompressionKind::Gz),
            Err(PharError::InvalidPath { .. })
        ));
        b.add_entry("a/b", b"one".to_vec(), CompressionKind::Gz).unwrap();
        assert!(matches!(
            b.add_entry("a/b", b"two".to_vec(), CompressionKind::None),
            Err(PharError::DuplicateEntry { .. })
        ));
        assert_eq!(b.len(), 1);
        b.add_entry("a/c", b"three".to_vec(), CompressionKind::None).unwrap();
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn openssl_cannot_be_built() {
        assert!(matches!(
            ArchiveBuilder::new(SignatureAlgorithm::OpenSsl),
            Err(PharError::UnsupportedSignature(_))
        ));
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "no space left"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn spool_failure_names_the_entry_not_a_path() {
        let staged = StagedEntry {
            name:        "lib/a.php".into(),
            source:      EntrySource::Memory(b"<?php echo 1;".to_vec()),
            compression: CompressionKind::None,
        };
        match spool_entry(&staged, &mut FullDisk) {
            Err(PharError::Spool { name, source }) => {
                assert_eq!(name, "lib/a.php");
                assert_eq!(source.to_string(), "no space left");
            }
            other => panic!("expected Spool error, got {other:?}"),
        }
    }

    #[test]
    fn sibling_that_cannot_be_removed_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.phar");
        // A non-empty directory cannot be removed with remove_file.
        let sibling = compressed_sibling(&target);
        fs::create_dir(&sibling).unwrap();
        fs::write(sibling.join("keep"), b"x").unwrap();

        let mut b = ArchiveBuilder::new(SignatureAlgorithm::Sha1).unwrap();
        b.add_entry("index.php", b"<?php".to_vec(), CompressionKind::Gz).unwrap();
        let committed = b.finalize(&target).unwrap();

        assert_eq!(committed.entry_count, 1);
        assert!(target.is_file());
        assert!(sibling.join("keep").is_file());
    }

    #[test]
    fn parent_of_bare_file_name_is_cwd() {
        assert_eq!(parent_dir(Path::new("out.phar")), Path::new("."));
        assert_eq!(parent_dir(Path::new("dist/out.phar")), Path::new("dist"));
    }
}
