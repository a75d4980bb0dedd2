//! Manifest and stub layout.
//!
//! ```text
//! stub … "__HALT_COMPILER();" [" "] ["?>"] ["\r\n" | "\n"]
//! u32  manifest length (bytes that follow this field)
//! u32  entry count
//! u16  API version (big-endian nibbles, 0x1110 = 1.1.0)
//! u32  global flags
//! u32  alias length,    alias bytes
//! u32  metadata length, metadata bytes
//! per entry:
//!   u32 name length, name bytes
//!   u32 uncompressed size
//!   u32 timestamp
//!   u32 compressed size
//!   u32 crc32 (of uncompressed bytes)
//!   u32 entry flags
//!   u32 metadata length, metadata bytes
//! ```
//!
//! Integers are little-endian except the API version.

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{PharError, Result};

pub const HALT_TOKEN: &[u8] = b"__HALT_COMPILER();";
/// Stub written when the caller supplies none.
pub const DEFAULT_STUB: &[u8] = b"<?php __HALT_COMPILER(); ?>\r\n";

/// API version written by the builder.
pub const API_VERSION: u16 = 0x1110;
/// Readers accept any 1.x manifest.
pub const API_MAJOR_MASK: u16 = 0xF000;
pub const API_MAJOR: u16 = 0x1000;

pub const MANIFEST_FLAG_GZ:        u32 = 0x0000_1000;
pub const MANIFEST_FLAG_BZ2:       u32 = 0x0000_2000;
pub const MANIFEST_FLAG_SIGNATURE: u32 = 0x0001_0000;

/// Permission bits kept in the low end of the entry flags.
pub const ENTRY_PERM_MASK: u32 = 0x0000_01FF;

/// Smallest possible entry header: empty name and metadata blobs.
const ENTRY_FIXED_LEN: usize = 7 * 4;

// ── Stub ─────────────────────────────────────────────────────────────────────

/// End of the stub in `bytes`, counting the optional ` ?>` and line break
/// after the first halt token.  `None` when the token is absent.
///
/// The first token ends the stub even if payloads contain the token again.
/// Containers without a stub are recognised by the reader before this is
/// called: they open with a manifest length that fits the file and an
/// API version whose major nibble is 1, which no text stub does.
pub fn find_stub_end(bytes: &[u8]) -> Option<usize> {
    let at = bytes.windows(HALT_TOKEN.len()).position(|w| w == HALT_TOKEN)?;
    let mut end = at + HALT_TOKEN.len();
    let rest = |end: usize| &bytes[end.min(bytes.len())..];
    if rest(end).starts_with(b" ") && rest(end + 1).starts_with(b"?>") {
        end += 1;
    }
    if rest(end).starts_with(b"?>") {
        end += 2;
        if rest(end).starts_with(b"\r\n") {
            end += 2;
        } else if rest(end).starts_with(b"\n") {
            end += 1;
        }
    }
    Some(end)
}

/// Make `stub` terminate with the halt token so the reader can find the
/// manifest after it.
pub fn normalize_stub(stub: &[u8]) -> Vec<u8> {
    match find_stub_end(stub) {
        // Anything after the token would be read as manifest.
        Some(end) => stub[..end].to_vec(),
        None => {
            let mut out = stub.to_vec();
            out.extend_from_slice(b" __HALT_COMPILER(); ?>\r\n");
            out
        }
    }
}

// ── Manifest header ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ManifestHeader {
    pub entry_count: u32,
    pub api_version: u16,
    pub flags:       u32,
    pub alias:       Vec<u8>,
    pub metadata:    Vec<u8>,
}

impl ManifestHeader {
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.entry_count)?;
        w.write_u16::<BigEndian>(self.api_version)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        write_blob(&mut w, &self.alias)?;
        write_blob(&mut w, &self.metadata)?;
        Ok(())
    }

    /// Read from the manifest body.  `base` is the absolute offset of the
    /// body, used only for error positions.
    pub fn read(r: &mut Cursor<&[u8]>, base: usize) -> Result<Self> {
        let entry_count = r.read_u32::<LittleEndian>().map_err(eof(r, base, "entry count"))?;
        let api_version = r.read_u16::<BigEndian>().map_err(eof(r, base, "API version"))?;
        if api_version & API_MAJOR_MASK != API_MAJOR {
            return Err(PharError::format(base + 4, format!("unsupported manifest API version {api_version:#06x}")));
        }
        let flags    = r.read_u32::<LittleEndian>().map_err(eof(r, base, "global flags"))?;
        let alias    = read_blob(r, base, "alias")?;
        let metadata = read_blob(r, base, "archive metadata")?;

        let remaining = r.get_ref().len().saturating_sub(r.position() as usize);
        if (entry_count as usize).saturating_mul(ENTRY_FIXED_LEN) > remaining {
            return Err(PharError::format(
                base + r.position() as usize,
                format!("manifest declares {entry_count} entries but only {remaining} bytes remain"),
            ));
        }
        Ok(Self { entry_count, api_version, flags, alias, metadata })
    }
}

// ── Entry header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct EntryHeader {
    pub name:              Vec<u8>,
    pub uncompressed_size: u32,
    pub timestamp:         u32,
    pub compressed_size:   u32,
    pub crc32:             u32,
    pub flags:             u32,
    pub metadata:          Vec<u8>,
}

impl EntryHeader {
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        write_blob(&mut w, &self.name)?;
        w.write_u32::<LittleEndian>(self.uncompressed_size)?;
        w.write_u32::<LittleEndian>(self.timestamp)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        write_blob(&mut w, &self.metadata)?;
        Ok(())
    }

    pub fn read(r: &mut Cursor<&[u8]>, base: usize) -> Result<Self> {
        let name = read_blob(r, base, "entry name")?;
        Ok(Self {
            name,
            uncompressed_size: r.read_u32::<LittleEndian>().map_err(eof(r, base, "uncompressed size"))?,
            timestamp:         r.read_u32::<LittleEndian>().map_err(eof(r, base, "timestamp"))?,
            compressed_size:   r.read_u32::<LittleEndian>().map_err(eof(r, base, "compressed size"))?,
            crc32:             r.read_u32::<LittleEndian>().map_err(eof(r, base, "crc32"))?,
            flags:             r.read_u32::<LittleEndian>().map_err(eof(r, base, "entry flags"))?,
            metadata:          read_blob(r, base, "entry metadata")?,
        })
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn write_blob<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field longer than 4 GiB"))?;
    w.write_u32::<LittleEndian>(len)?;
    w.write_all(bytes)
}

fn read_blob(r: &mut Cursor<&[u8]>, base: usize, what: &'static str) -> Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>().map_err(eof(r, base, what))? as usize;
    let at = base + r.position() as usize;
    let remaining = r.get_ref().len().saturating_sub(r.position() as usize);
    if len > remaining {
        return Err(PharError::format(at, format!("{what} length {len} exceeds the {remaining} manifest bytes left")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(eof(r, base, what))?;
    Ok(buf)
}

fn eof<'a>(r: &Cursor<&'a [u8]>, base: usize, what: &'static str) -> impl FnOnce(io::Error) -> PharError {
    let at = base + r.position() as usize;
    move |_| PharError::format(at, format!("manifest truncated while reading {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_end_variants() {
        assert_eq!(find_stub_end(b"<?php __HALT_COMPILER(); ?>\r\nXX"), Some(29));
        assert_eq!(find_stub_end(b"<?php __HALT_COMPILER(); ?>\nXX"), Some(28));
        assert_eq!(find_stub_end(b"<?php __HALT_COMPILER();?>XX"), Some(26));
        assert_eq!(find_stub_end(b"<?php __HALT_COMPILER();XX"), Some(24));
        assert_eq!(find_stub_end(b"no token here"), None);
    }

    #[test]
    fn normalize_appends_token() {
        let stub = normalize_stub(b"#!/usr/bin/env php\n<?php require 'x';");
        assert_eq!(find_stub_end(&stub), Some(stub.len()));
        assert_eq!(normalize_stub(DEFAULT_STUB), DEFAULT_STUB);
    }

    #[test]
    fn entry_header_layout() {
        let h = EntryHeader {
            name: b"a.php".to_vec(),
            uncompressed_size: 10,
            timestamp: 1_700_000_000,
            compressed_size: 8,
            crc32: 0xDEADBEEF,
            flags: 0x1000 | 0o644,
            metadata: Vec::new(),
        };
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 4 + 5 + 6 * 4);
        let back = EntryHeader::read(&mut Cursor::new(&buf[..]), 0).unwrap();
        assert_eq!(back.name, b"a.php");
        assert_eq!(back.crc32, 0xDEADBEEF);
    }

    #[test]
    fn oversized_blob_is_format_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(b"short");
        let err = EntryHeader::read(&mut Cursor::new(&buf[..]), 40).unwrap_err();
        assert!(matches!(err, PharError::Format { offset: 44, .. }));
    }

    #[test]
    fn rejects_future_api_major() {
        let mut buf = Vec::new();
        ManifestHeader { api_version: 0x2000, ..Default::default() }.write(&mut buf).unwrap();
        assert!(ManifestHeader::read(&mut Cursor::new(&buf[..]), 0).is_err());
    }
}
