//! Compression policy for rebuilt archives.
//!
//! Extraction loses which entry used which scheme, so a rebuild applies one
//! kind to every entry, picked from the profile observed on the original:
//!
//! 1. any BZ2 entry → BZ2
//! 2. else any GZ entry → GZ
//! 3. else a profile exists (only `None` or empty) → None
//! 4. no profile at all → GZ

use crate::archive::CompressionProfile;
use crate::codec::CompressionKind;

/// Kind used when nothing is known about the original archive.
pub const DEFAULT_COMPRESSION: CompressionKind = CompressionKind::Gz;

pub fn decide(profile: Option<&CompressionProfile>) -> CompressionKind {
    match profile {
        None => DEFAULT_COMPRESSION,
        Some(p) if p.contains(CompressionKind::Bz2) => CompressionKind::Bz2,
        Some(p) if p.contains(CompressionKind::Gz)  => CompressionKind::Gz,
        Some(_) => CompressionKind::None,
    }
}
