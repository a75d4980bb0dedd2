//! Signature footer: algorithm ids and incremental hashing.
//!
//! Footer layout for hash algorithms:
//!
//! ```text
//! [ hash bytes ] [ algorithm id: u32 LE ] [ "GBMB" ]
//! ```
//!
//! OpenSSL-signed archives insert a `u32 LE` signature length between the
//! signature bytes and the algorithm id.  Those archives are read and
//! reported, but this crate never produces them: the private key is not part
//! of the container.
//!
//! The hash always covers every byte in front of the footer, stub included.

use std::fmt;
use std::io;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Trailing magic of a signature footer.
pub const SIGNATURE_MAGIC: &[u8; 4] = b"GBMB";

/// Hash or signature scheme recorded in the footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    OpenSsl,
    OpenSslSha256,
    OpenSslSha512,
}

impl SignatureAlgorithm {
    /// Footer id as written on disk.
    pub fn id(self) -> u32 {
        match self {
            SignatureAlgorithm::Md5           => 0x0001,
            SignatureAlgorithm::Sha1          => 0x0002,
            SignatureAlgorithm::Sha256        => 0x0003,
            SignatureAlgorithm::Sha512        => 0x0004,
            SignatureAlgorithm::OpenSsl       => 0x0010,
            SignatureAlgorithm::OpenSslSha256 => 0x0011,
            SignatureAlgorithm::OpenSslSha512 => 0x0012,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0x0001 => Some(SignatureAlgorithm::Md5),
            0x0002 => Some(SignatureAlgorithm::Sha1),
            0x0003 => Some(SignatureAlgorithm::Sha256),
            0x0004 => Some(SignatureAlgorithm::Sha512),
            0x0010 => Some(SignatureAlgorithm::OpenSsl),
            0x0011 => Some(SignatureAlgorithm::OpenSslSha256),
            0x0012 => Some(SignatureAlgorithm::OpenSslSha512),
            _      => None,
        }
    }

    /// Digest length for hash algorithms; `None` for the OpenSSL family,
    /// whose length is stored explicitly in the footer.
    pub fn digest_len(self) -> Option<usize> {
        match self {
            SignatureAlgorithm::Md5    => Some(16),
            SignatureAlgorithm::Sha1   => Some(20),
            SignatureAlgorithm::Sha256 => Some(32),
            SignatureAlgorithm::Sha512 => Some(64),
            _                          => None,
        }
    }

    /// True for algorithms this crate can compute and write.
    pub fn is_hash(self) -> bool {
        self.digest_len().is_some()
    }

    pub fn name(self) -> &'static str {
        match self {
            SignatureAlgorithm::Md5           => "MD5",
            SignatureAlgorithm::Sha1          => "SHA-1",
            SignatureAlgorithm::Sha256        => "SHA-256",
            SignatureAlgorithm::Sha512        => "SHA-512",
            SignatureAlgorithm::OpenSsl       => "OpenSSL",
            SignatureAlgorithm::OpenSslSha256 => "OpenSSL/SHA-256",
            SignatureAlgorithm::OpenSslSha512 => "OpenSSL/SHA-512",
        }
    }

    /// Parse from a CLI or sidecar string.  Accepts the display name as well
    /// as the bare lowercase form (`sha256`).
    pub fn from_name(s: &str) -> Option<Self> {
        let norm: String = s.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        match norm.to_lowercase().as_str() {
            "md5"           => Some(SignatureAlgorithm::Md5),
            "sha1"          => Some(SignatureAlgorithm::Sha1),
            "sha256"        => Some(SignatureAlgorithm::Sha256),
            "sha512"        => Some(SignatureAlgorithm::Sha512),
            "openssl"       => Some(SignatureAlgorithm::OpenSsl),
            "opensslsha256" => Some(SignatureAlgorithm::OpenSslSha256),
            "opensslsha512" => Some(SignatureAlgorithm::OpenSslSha512),
            _               => None,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Incremental hasher ───────────────────────────────────────────────────────

/// Running digest over the bytes of a container being written or checked.
pub enum SignatureHasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl SignatureHasher {
    /// Returns `None` for algorithms that are not plain hashes.
    pub fn new(algorithm: SignatureAlgorithm) -> Option<Self> {
        Some(match algorithm {
            SignatureAlgorithm::Md5    => SignatureHasher::Md5(Md5::new()),
            SignatureAlgorithm::Sha1   => SignatureHasher::Sha1(Sha1::new()),
            SignatureAlgorithm::Sha256 => SignatureHasher::Sha256(Sha256::new()),
            SignatureAlgorithm::Sha512 => SignatureHasher::Sha512(Sha512::new()),
            _                          => return None,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            SignatureHasher::Md5(h)    => h.update(data),
            SignatureHasher::Sha1(h)   => h.update(data),
            SignatureHasher::Sha256(h) => h.update(data),
            SignatureHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            SignatureHasher::Md5(h)    => h.finalize().to_vec(),
            SignatureHasher::Sha1(h)   => h.finalize().to_vec(),
            SignatureHasher::Sha256(h) => h.finalize().to_vec(),
            SignatureHasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Lets a hasher sit at the end of `io::copy`.
impl io::Write for SignatureHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One-shot digest of `data`.  `None` for non-hash algorithms.
pub fn digest(algorithm: SignatureAlgorithm, data: &[u8]) -> Option<Vec<u8>> {
    let mut h = SignatureHasher::new(algorithm)?;
    h.update(data);
    Some(h.finalize())
}

/// Serialize a hash footer for `hash`.
pub fn encode_footer(algorithm: SignatureAlgorithm, hash: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hash.len() + 8);
    out.extend_from_slice(hash);
    out.extend_from_slice(&algorithm.id().to_le_bytes());
    out.extend_from_slice(SIGNATURE_MAGIC);
    out
}
