pub mod analyzer;
pub mod archive;
pub mod codec;
pub mod error;
pub mod io_stream;
pub mod manifest;
pub mod metadata;
pub mod ops;
pub mod path;
pub mod policy;
pub mod sidecar;
pub mod signature;

pub use analyzer::{summarize, ArchiveSummary};
pub use archive::{Archive, CompressionProfile, Entry};
pub use codec::CompressionKind;
pub use error::{PharError, Result};
pub use io_stream::{parse, ArchiveBuilder};
pub use metadata::Metadata;
pub use signature::SignatureAlgorithm;
