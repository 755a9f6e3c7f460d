//! File-side half of the chunked transfer engine.
//!
//! The sender reads chunks through [`Chunker`]; the receiver writes them
//! through [`Reassembler`] into a hidden staging file that is verified and
//! promoted once every chunk has been acknowledged.

mod ackset;
mod checksum;
mod chunked;
mod manifest;
mod reassembly;
mod validation;

pub use ackset::AckSet;
pub use checksum::{ContentHasher, calculate_file_checksum, checksum_bytes, checksums_match};
pub use chunked::{Chunk, Chunker};
pub use manifest::build_manifest;
pub use reassembly::{Accepted, Reassembler, staging_path_for};
pub use validation::validate_file_name;

use filexfer_protocol::ManifestError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("read error: {0}")]
    Read(#[source] std::io::Error),

    #[error("write error: {0}")]
    Write(#[source] std::io::Error),

    #[error("source file changed: expected {expected} bytes, found {actual}")]
    SourceChanged { expected: u64, actual: u64 },

    #[error("chunk {index} is corrupt")]
    ChunkCorrupt { index: u64 },

    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u64, total: u64 },

    #[error("whole-file hash mismatch: expected {expected}, got {actual}")]
    WholeFileIntegrity { expected: String, actual: String },

    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
