use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::archive::{Archive, Entry, PayloadSource, Signature};
use crate::codec::CompressionKind;
use crate::error::{PharError, Result};
use crate::manifest::{
    find_stub_end, EntryHeader, ManifestHeader, API_MAJOR, API_MAJOR_MASK, ENTRY_PERM_MASK, HALT_TOKEN,
    MANIFEST_FLAG_SIGNATURE,
};
use crate::metadata::Metadata;
use crate::path::check_local_name;
use crate::signature::{SignatureAlgorithm, SignatureHasher, SIGNATURE_MAGIC};

/// Read size while scanning for the end of the stub.
const SCAN_CHUNK: usize = 64 * 1024;

/// Parse a complete container held in memory.
///
/// Fails with [`PharError::Format`] when the manifest length, entry headers,
/// payload extents or signature footer are inconsistent with the byte
/// stream.  No partial archive is ever returned.  A container without a
/// signature footer is accepted as long as its flags do not claim one.
pub fn parse(bytes: &[u8]) -> Result<Archive> {
    let mut input = Input { r: Cursor::new(bytes), len: bytes.len() as u64, origin: Path::new("<memory>") };
    let layout = input.layout()?;
    Ok(layout.into_archive(PayloadSource::Memory(Arc::from(bytes))))
}

/// Parse the container at `path` without loading its payloads.
///
/// The stub, manifest and footer are read and the signature is hashed in a
/// streaming pass; payloads stay on disk until an entry is decompressed.
pub fn open(path: &Path) -> Result<Archive> {
    let file = File::open(path).map_err(PharError::io(path))?;
    let len = file.metadata().map_err(PharError::io(path))?.len();
    let layout = {
        let mut input = Input { r: BufReader::new(&file), len, origin: path };
        input.layout()?
    };
    Ok(layout.into_archive(PayloadSource::File { file: Arc::new(file), path: path.to_path_buf() }))
}

/// Everything but the payload bytes.
struct Layout {
    stub:        Vec<u8>,
    alias:       String,
    api_version: u16,
    metadata:    Metadata,
    entries:     Vec<Entry>,
    signature:   Option<Signature>,
}

impl Layout {
    fn into_archive(self, source: PayloadSource) -> Archive {
        Archive {
            stub:        self.stub,
            alias:       self.alias,
            api_version: self.api_version,
            metadata:    self.metadata,
            entries:     self.entries,
            signature:   self.signature,
            source,
        }
    }
}

struct Input<'p, R> {
    r:      R,
    len:    u64,
    origin: &'p Path,
}

impl<R: Read + Seek> Input<'_, R> {
    fn layout(&mut self) -> Result<Layout> {
        let stub_end = self.locate_stub()?;
        let stub = self.bytes_at(0, stub_end, "stub")?;

        // ── Manifest ─────────────────────────────────────────────────────────
        if stub_end + 4 > self.len {
            return Err(PharError::format(stub_end as usize, "container ends before the manifest length"));
        }
        let manifest_len = self.u32_at(stub_end)? as u64;
        let body_start = stub_end + 4;
        if body_start + manifest_len > self.len {
            return Err(PharError::format(stub_end as usize, format!(
                "manifest length {manifest_len} exceeds the {} bytes that follow",
                self.len - body_start
            )));
        }
        let body_end = body_start + manifest_len;
        let body = self.bytes_at(body_start, manifest_len, "manifest")?;

        let base = body_start as usize;
        let mut cur = Cursor::new(&body[..]);
        let header = ManifestHeader::read(&mut cur, base)?;
        let mut headers = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            headers.push(EntryHeader::read(&mut cur, base)?);
        }
        if (cur.position() as usize) < body.len() {
            debug!(unused = body.len() - cur.position() as usize, "manifest has trailing bytes");
        }

        let metadata = Metadata::from_php_bytes(&header.metadata)
            .map_err(|e| PharError::format(base + e.pos, format!("archive metadata: {}", e.reason)))?;
        let alias = String::from_utf8_lossy(&header.alias).into_owned();

        // ── Payload extents ──────────────────────────────────────────────────
        let mut offset = body_end;
        let mut seen = HashSet::with_capacity(headers.len());
        let mut entries = Vec::with_capacity(headers.len());
        for h in headers {
            entries.push(entry_from_header(h, self.len, &mut offset, &mut seen)?);
        }
        let data_end = offset;

        // ── Signature ────────────────────────────────────────────────────────
        let signature = self.read_footer(data_end, header.flags & MANIFEST_FLAG_SIGNATURE != 0)?;

        debug!(
            entries = entries.len(),
            stub_len = stub_end,
            manifest_len,
            signature = signature.as_ref().map(|s| s.algorithm.name()).unwrap_or("none"),
            "parsed archive"
        );
        Ok(Layout { stub, alias, api_version: header.api_version, metadata, entries, signature })
    }

    /// Offset of the first manifest byte.
    ///
    /// A container that opens with a plausible manifest header has no stub.
    /// Otherwise the stub runs to the first halt token, which is also where
    /// PHP stops executing it.
    fn locate_stub(&mut self) -> Result<u64> {
        if self.starts_with_manifest()? {
            return Ok(0);
        }
        let Some(at) = self.find_halt_token()? else {
            return Ok(0);
        };
        let window_len = (HALT_TOKEN.len() as u64 + 5).min(self.len - at);
        let window = self.bytes_at(at, window_len, "stub")?;
        Ok(at + find_stub_end(&window).unwrap_or(HALT_TOKEN.len()) as u64)
    }

    fn starts_with_manifest(&mut self) -> Result<bool> {
        if self.len < 10 {
            return Ok(false);
        }
        let head = self.bytes_at(0, 10, "manifest header")?;
        let manifest_len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as u64;
        let api_version = u16::from_be_bytes([head[8], head[9]]);
        Ok(4 + manifest_len <= self.len && api_version & API_MAJOR_MASK == API_MAJOR)
    }

    fn find_halt_token(&mut self) -> Result<Option<u64>> {
        let origin = self.origin;
        self.r.seek(SeekFrom::Start(0)).map_err(PharError::io(origin))?;
        let mut window: Vec<u8> = Vec::with_capacity(SCAN_CHUNK + HALT_TOKEN.len());
        let mut chunk = vec![0u8; SCAN_CHUNK];
        let mut window_start = 0u64;
        loop {
            let n = self.r.read(&mut chunk).map_err(PharError::io(origin))?;
            if n == 0 {
                return Ok(None);
            }
            window.extend_from_slice(&chunk[..n]);
            if let Some(i) = window.windows(HALT_TOKEN.len()).position(|w| w == HALT_TOKEN) {
                return Ok(Some(window_start + i as u64));
            }
            // Keep a token-sized tail so a match across reads is not missed.
            let keep = window.len().min(HALT_TOKEN.len() - 1);
            let drop = window.len() - keep;
            window.drain(..drop);
            window_start += drop as u64;
        }
    }

    /// Parse the footer that occupies `[data_end, len)`, if there is one.
    fn read_footer(&mut self, data_end: u64, flagged: bool) -> Result<Option<Signature>> {
        let tail_len = self.len - data_end;
        let trailer = if tail_len >= 8 { Some(self.bytes_at(self.len - 8, 8, "signature footer")?) } else { None };
        let Some(trailer) = trailer.filter(|t| t[4..] == SIGNATURE_MAGIC[..]) else {
            if flagged {
                return Err(PharError::format(data_end as usize, "signature flag set but no signature footer found"));
            }
            if tail_len > 0 {
                debug!(bytes = tail_len, "ignoring trailing bytes after payloads");
            }
            return Ok(None);
        };

        let id = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let algorithm = SignatureAlgorithm::from_id(id).ok_or_else(|| {
            PharError::format((self.len - 8) as usize, format!("unknown signature algorithm id {id:#x}"))
        })?;

        let (sig_len, footer_len) = match algorithm.digest_len() {
            Some(n) => (n as u64, n as u64 + 8),
            None => {
                if tail_len < 12 {
                    return Err(PharError::format(data_end as usize, "signature footer too short"));
                }
                let n = self.u32_at(self.len - 12)? as u64;
                (n, n + 12)
            }
        };
        // The footer must start exactly where the payloads end.
        if footer_len != tail_len {
            return Err(PharError::format(data_end as usize, format!(
                "{} signature footer does not line up with the payloads ({} trailing bytes)",
                algorithm.name(),
                tail_len
            )));
        }

        let sig = self.bytes_at(data_end, sig_len, "signature")?;
        let intact = match SignatureHasher::new(algorithm) {
            Some(mut hasher) => {
                let origin = self.origin;
                self.r.seek(SeekFrom::Start(0)).map_err(PharError::io(origin))?;
                io::copy(&mut (&mut self.r).take(data_end), &mut hasher).map_err(PharError::io(origin))?;
                Some(hasher.finalize() == sig)
            }
            None => None,
        };
        if intact == Some(false) {
            warn!(algorithm = algorithm.name(), "signature does not match archive contents");
        }
        Ok(Some(Signature { algorithm, bytes: sig, intact }))
    }

    /// Exactly `len` bytes at `offset`.  Callers check the extent first;
    /// running off the end here is still reported as a format error.
    fn bytes_at(&mut self, offset: u64, len: u64, what: &str) -> Result<Vec<u8>> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(PharError::format(offset as usize, format!("container ends inside the {what}")));
        }
        let origin = self.origin;
        let mut buf = vec![0u8; len as usize];
        self.r.seek(SeekFrom::Start(offset))
            .and_then(|_| self.r.read_exact(&mut buf))
            .map_err(PharError::io(origin))?;
        Ok(buf)
    }

    fn u32_at(&mut self, offset: u64) -> Result<u32> {
        let b = self.bytes_at(offset, 4, "length field")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn entry_from_header(
    h:      EntryHeader,
    len:    u64,
    offset: &mut u64,
    seen:   &mut HashSet<String>,
) -> Result<Entry> {
    let at = *offset;
    let pos = at as usize;
    let name = String::from_utf8(h.name)
        .map_err(|_| PharError::format(pos, "entry name is not valid UTF-8"))?;

    if let Some(reason) = check_local_name(name.strip_suffix('/').unwrap_or(&name)) {
        return Err(PharError::format(pos, format!("unsafe entry name '{name}': {reason}")));
    }
    if !seen.insert(name.clone()) {
        return Err(PharError::format(pos, format!("duplicate entry name '{name}'")));
    }

    let compression = CompressionKind::from_entry_flags(h.flags)
        .ok_or_else(|| PharError::format(pos, format!("entry '{name}' claims both GZ and BZ2")))?;

    let end = at + h.compressed_size as u64;
    if end > len {
        return Err(PharError::format(pos, format!(
            "payload of '{name}' ({} bytes) runs past the end of the container",
            h.compressed_size
        )));
    }

    let metadata = Metadata::from_php_bytes(&h.metadata)
        .map_err(|e| PharError::format(pos, format!("metadata of '{name}': {e}")))?;

    *offset = end;
    Ok(Entry {
        name,
        uncompressed_size: h.uncompressed_size,
        compressed_size:   h.compressed_size,
        crc32:             h.crc32,
        compression,
        timestamp:         h.timestamp,
        permissions:       h.flags & ENTRY_PERM_MASK,
        metadata,
        offset:            at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{API_VERSION, DEFAULT_STUB};
    use crate::signature::{digest, encode_footer};

    /// Hand-assembled single-entry container, independent of the builder.
    fn sample(signed: bool) -> Vec<u8> {
        let payload = b"<?php echo 1;";
        let mut body = Vec::new();
        ManifestHeader {
            entry_count: 1,
            api_version: API_VERSION,
            flags: if signed { MANIFEST_FLAG_SIGNATURE } else { 0 },
            alias: b"app.phar".to_vec(),
            metadata: br#"a:1:{s:7:"version";s:3:"1.0";}"#.to_vec(),
        }.write(&mut body).unwrap();
        EntryHeader {
            name: b"index.php".to_vec(),
            uncompressed_size: payload.len() as u32,
            timestamp: 1_600_000_000,
            compressed_size: payload.len() as u32,
            crc32: crc32fast::hash(payload),
            flags: 0o644,
            metadata: Vec::new(),
        }.write(&mut body).unwrap();

        let mut out = DEFAULT_STUB.to_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(payload);
        if signed {
            let hash = digest(SignatureAlgorithm::Sha256, &out).unwrap();
            out.extend_from_slice(&encode_footer(SignatureAlgorithm::Sha256, &hash));
        }
        out
    }

    #[test]
    fn parses_hand_built_container() {
        let ar = parse(&sample(true)).unwrap();
        assert_eq!(ar.stub(), DEFAULT_STUB);
        assert_eq!(ar.alias(), "app.phar");
        assert_eq!(ar.entries().len(), 1);
        assert_eq!(ar.entries()[0].permissions(), 0o644);
        assert_eq!(ar.read_file("index.php").unwrap(), b"<?php echo 1;");
        let sig = ar.signature().unwrap();
        assert_eq!(sig.algorithm, SignatureAlgorithm::Sha256);
        assert_eq!(sig.intact, Some(true));
    }

    #[test]
    fn unsigned_container_is_accepted() {
        let ar = parse(&sample(false)).unwrap();
        assert!(ar.signature().is_none());
    }

    #[test]
    fn tampered_payload_breaks_signature_not_parse() {
        let mut bytes = sample(true);
        let at = bytes.len() - 40 - 1; // last payload byte, before the 40-byte footer
        bytes[at] ^= 0x20;
        let ar = parse(&bytes).unwrap();
        assert_eq!(ar.signature().unwrap().intact, Some(false));
        assert!(matches!(ar.decompress_payload(&ar.entries()[0]), Err(PharError::Decompression { .. })));
    }

    #[test]
    fn stubless_container_ignores_halt_token_in_payload() {
        let payload = b"<?php __HALT_COMPILER(); ?>\r\n";
        let mut body = Vec::new();
        ManifestHeader { entry_count: 1, api_version: API_VERSION, ..Default::default() }
            .write(&mut body).unwrap();
        EntryHeader {
            name: b"inner.phar".to_vec(),
            uncompressed_size: payload.len() as u32,
            compressed_size: payload.len() as u32,
            crc32: crc32fast::hash(payload),
            ..Default::default()
        }.write(&mut body).unwrap();
        let mut bytes = (body.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(payload);

        let ar = parse(&bytes).unwrap();
        assert!(ar.stub().is_empty());
        assert_eq!(ar.read_file("inner.phar").unwrap(), payload);
    }

    #[test]
    fn halt_token_split_across_scan_reads_is_found() {
        let mut stub = b"<?php /*".to_vec();
        stub.resize(SCAN_CHUNK - 5, b'x');
        stub.extend_from_slice(b"*/ __HALT_COMPILER(); ?>\r\n");
        let mut bytes = sample(true);
        bytes.splice(..DEFAULT_STUB.len(), stub.iter().copied());
        // Re-sign: the stub is covered by the hash.
        let data_end = bytes.len() - 40;
        bytes.truncate(data_end);
        let hash = digest(SignatureAlgorithm::Sha256, &bytes).unwrap();
        bytes.extend_from_slice(&encode_footer(SignatureAlgorithm::Sha256, &hash));

        let ar = parse(&bytes).unwrap();
        assert_eq!(ar.stub(), &stub[..]);
        assert_eq!(ar.signature().unwrap().intact, Some(true));
    }

    #[test]
    fn manifest_length_beyond_input_is_format_error() {
        let mut bytes = sample(true);
        let at = DEFAULT_STUB.len();
        bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(parse(&bytes), Err(PharError::Format { .. })));
    }

    #[test]
    fn missing_footer_with_flag_is_format_error() {
        let mut bytes = sample(true);
        bytes.truncate(bytes.len() - 40);
        assert!(matches!(parse(&bytes), Err(PharError::Format { .. })));
    }

    #[test]
    fn truncated_container_is_format_error() {
        let bytes = sample(false);
        for cut in [DEFAULT_STUB.len() + 2, DEFAULT_STUB.len() + 20, bytes.len() - 3] {
            assert!(matches!(parse(&bytes[..cut]), Err(PharError::Format { .. })), "cut at {cut}");
        }
    }
}
