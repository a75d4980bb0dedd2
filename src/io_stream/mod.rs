//! Container engine: reader and writer.
//!
//! # Reader
//! [`parse`] (bytes in memory) and [`open`] (a file on disk) produce an
//! [`Archive`](crate::archive::Archive) from the stub, the manifest, the
//! payload extents and the optional signature footer.  Entries record where
//! their payload lives; each payload is fetched, decompressed and checked on
//! demand, so extraction holds one entry in memory at a time.
//!
//! # Writer
//! [`ArchiveBuilder`] stages entries, then `finalize()` compresses them one
//! at a time into a spool file, streams stub + manifest + payloads into a
//! temporary file next to the target while hashing, appends the signature
//! footer, and renames the temporary file over the target.  The target never
//! holds a partial container.
//!
//! # Endianness
//! All fixed-width fields are little-endian except the manifest API version;
//! see `manifest` for the field-level layout.

mod reader;
mod writer;

pub use reader::{open, parse};
pub use writer::{ArchiveBuilder, Committed, EntrySource, DEFAULT_PERMISSIONS};
pub(crate) use writer::target_parent;
