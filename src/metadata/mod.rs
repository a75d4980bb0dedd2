//! Archive metadata tree and its PHP `serialize()` encoding.
//!
//! The container stores archive-level (and per-entry) metadata as a
//! length-prefixed blob in PHP serialization syntax.  Only the data subset is
//! supported:
//!
//! ```text
//! N;            null
//! b:1;          bool
//! i:-5;         integer
//! d:0.5;        float (INF, -INF and NAN included)
//! s:3:"abc";    byte string, length in bytes
//! a:2:{k;v;…}   array, keys are i: or s:
//! ```
//!
//! Objects, enums and references are rejected.  A PHP array whose keys are
//! exactly `0, 1, …, n-1` in order becomes a [`Metadata::Sequence`]; anything
//! else becomes a [`Metadata::Mapping`] with integer keys rendered in decimal.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed metadata at byte {pos}: {reason}")]
pub struct MetadataError {
    pub pos:    usize,
    pub reason: String,
}

/// A closed, serializable tree of scalars, sequences and string-keyed maps.
///
/// Serializes to and from the natural JSON value, which is how the sidecar
/// stores it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metadata {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Metadata>),
    Mapping(BTreeMap<String, Metadata>),
}

impl Metadata {
    pub fn is_null(&self) -> bool {
        matches!(self, Metadata::Null)
    }

    /// Encode in PHP serialization syntax.  `Null` encodes to an empty blob,
    /// which the container reads as "no metadata".
    pub fn to_php_bytes(&self) -> Vec<u8> {
        if self.is_null() {
            return Vec::new();
        }
        let mut out = Vec::new();
        encode(self, &mut out);
        out
    }

    /// Decode a metadata blob.  An empty blob yields `Null`.
    pub fn from_php_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        if bytes.is_empty() {
            return Ok(Metadata::Null);
        }
        let mut p = Parser { buf: bytes, pos: 0 };
        let value = p.value(0)?;
        if p.pos != bytes.len() {
            return Err(p.err("trailing bytes after value"));
        }
        Ok(value)
    }
}

impl From<&str> for Metadata {
    fn from(s: &str) -> Self { Metadata::String(s.to_owned()) }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

fn encode(value: &Metadata, out: &mut Vec<u8>) {
    match value {
        Metadata::Null      => out.extend_from_slice(b"N;"),
        Metadata::Bool(b)   => out.extend_from_slice(if *b { b"b:1;" } else { b"b:0;" }),
        Metadata::Int(i)    => out.extend_from_slice(format!("i:{i};").as_bytes()),
        Metadata::Float(f)  => out.extend_from_slice(format!("d:{};", format_float(*f)).as_bytes()),
        Metadata::String(s) => encode_str(s, out),
        Metadata::Sequence(items) => {
            out.extend_from_slice(format!("a:{}:{{", items.len()).as_bytes());
            for (i, item) in items.iter().enumerate() {
                out.extend_from_slice(format!("i:{i};").as_bytes());
                encode(item, out);
            }
            out.push(b'}');
        }
        Metadata::Mapping(map) => {
            out.extend_from_slice(format!("a:{}:{{", map.len()).as_bytes());
            for (key, item) in map {
                match canonical_int(key) {
                    Some(i) => out.extend_from_slice(format!("i:{i};").as_bytes()),
                    None    => encode_str(key, out),
                }
                encode(item, out);
            }
            out.push(b'}');
        }
    }
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(format!("s:{}:\"", s.len()).as_bytes());
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\";");
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NAN".into()
    } else if f.is_infinite() {
        if f > 0.0 { "INF".into() } else { "-INF".into() }
    } else {
        let mut s = String::new();
        let _ = write!(s, "{f:?}");
        s
    }
}

/// PHP turns decimal-integer string keys into integer keys; mirror that so
/// a decoded mapping re-encodes the same way.
fn canonical_int(key: &str) -> Option<i64> {
    let i: i64 = key.parse().ok()?;
    (i.to_string() == key).then_some(i)
}

// ── Decoder ──────────────────────────────────────────────────────────────────

const MAX_DEPTH: usize = 128;

enum Key {
    Int(i64),
    Str(String),
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, reason: impl Into<String>) -> MetadataError {
        MetadataError { pos: self.pos, reason: reason.into() }
    }

    fn expect(&mut self, byte: u8) -> Result<(), MetadataError> {
        match self.buf.get(self.pos) {
            Some(&b) if b == byte => { self.pos += 1; Ok(()) }
            Some(&b) => Err(self.err(format!("expected '{}', found '{}'", byte as char, b as char))),
            None     => Err(self.err(format!("expected '{}', found end of input", byte as char))),
        }
    }

    /// Bytes up to (not including) `end`; consumes the terminator.
    fn until(&mut self, end: u8) -> Result<&'a str, MetadataError> {
        let buf = self.buf;
        let rest = &buf[self.pos..];
        let n = rest.iter().position(|&b| b == end)
            .ok_or_else(|| self.err(format!("unterminated token, missing '{}'", end as char)))?;
        let token = std::str::from_utf8(&rest[..n]).map_err(|_| self.err("non-ASCII token"))?;
        self.pos += n + 1;
        Ok(token)
    }

    fn int(&mut self, end: u8) -> Result<i64, MetadataError> {
        let start = self.pos;
        let token = self.until(end)?;
        token.parse().map_err(|_| MetadataError { pos: start, reason: format!("bad integer '{token}'") })
    }

    fn string_body(&mut self) -> Result<String, MetadataError> {
        let len = self.int(b':')?;
        let len = usize::try_from(len).map_err(|_| self.err("negative string length"))?;
        self.expect(b'"')?;
        let end = self.pos.checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| self.err("string runs past end of input"))?;
        let s = String::from_utf8_lossy(&self.buf[self.pos..end]).into_owned();
        self.pos = end;
        self.expect(b'"')?;
        self.expect(b';')?;
        Ok(s)
    }

    fn tag(&mut self) -> Result<u8, MetadataError> {
        let t = *self.buf.get(self.pos).ok_or_else(|| self.err("unexpected end of input"))?;
        self.pos += 1;
        Ok(t)
    }

    fn key(&mut self) -> Result<Key, MetadataError> {
        match self.tag()? {
            b'i' => { self.expect(b':')?; Ok(Key::Int(self.int(b';')?)) }
            b's' => { self.expect(b':')?; Ok(Key::Str(self.string_body()?)) }
            t    => { self.pos -= 1; Err(self.err(format!("array key cannot start with '{}'", t as char))) }
        }
    }

    fn value(&mut self, depth: usize) -> Result<Metadata, MetadataError> {
        if depth > MAX_DEPTH {
            return Err(self.err("nesting too deep"));
        }
        let tag = self.tag()?;
        if tag == b'N' {
            self.expect(b';')?;
            return Ok(Metadata::Null);
        }
        self.expect(b':')?;
        match tag {
            b'b' => match self.int(b';')? {
                0 => Ok(Metadata::Bool(false)),
                1 => Ok(Metadata::Bool(true)),
                v => Err(self.err(format!("bad boolean {v}"))),
            },
            b'i' => Ok(Metadata::Int(self.int(b';')?)),
            b'd' => {
                let start = self.pos;
                let token = self.until(b';')?;
                let f = match token {
                    "INF"  => f64::INFINITY,
                    "-INF" => f64::NEG_INFINITY,
                    "NAN"  => f64::NAN,
                    t      => t.parse().map_err(|_| MetadataError {
                        pos: start, reason: format!("bad float '{t}'"),
                    })?,
                };
                Ok(Metadata::Float(f))
            }
            b's' => Ok(Metadata::String(self.string_body()?)),
            b'a' => {
                let count = self.int(b':')?;
                let count = usize::try_from(count).map_err(|_| self.err("negative array length"))?;
                self.expect(b'{')?;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let key = self.key()?;
                    let item = self.value(depth + 1)?;
                    entries.push((key, item));
                }
                self.expect(b'}')?;
                Ok(array_to_metadata(entries))
            }
            t => {
                self.pos -= 2;
                Err(self.err(format!("unsupported type tag '{}'", t as char)))
            }
        }
    }
}

fn array_to_metadata(entries: Vec<(Key, Metadata)>) -> Metadata {
    let is_list = entries.iter().enumerate()
        .all(|(i, (k, _))| matches!(k, Key::Int(n) if *n == i as i64));
    if is_list {
        return Metadata::Sequence(entries.into_iter().map(|(_, v)| v).collect());
    }
    Metadata::Mapping(entries.into_iter().map(|(k, v)| {
        let key = match k {
            Key::Int(i) => i.to_string(),
            Key::Str(s) => s,
        };
        (key, v)
    }).collect())
}
