use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::TRANSFER_ID_LEN;

/// Content-derived identifier of a logical transfer.
///
/// Two manifests describing the same bytes with the same chunk size share
/// an identifier, which is what lets a receiver resume a transfer after a
/// reconnect or a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Derives the identifier from the whole-file hash, size and chunk size.
    pub fn derive(file_hash: &str, size: u64, chunk_size: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(file_hash.as_bytes());
        hasher.update(size.to_be_bytes());
        hasher.update(chunk_size.to_be_bytes());
        let mut hex = hex::encode(hasher.finalize());
        hex.truncate(TRANSFER_ID_LEN);
        Self(hex)
    }

    /// Wraps an identifier received from a peer without validation.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form used in staging file names and logs.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(16);
        &self.0[..end]
    }

    /// Returns `true` if the identifier is lowercase hex of the expected length.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == TRANSFER_ID_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashing primitive used for both chunk checksums and the whole-file hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Crc32,
}

impl HashAlgorithm {
    /// Length of a hex-encoded digest for this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Crc32 => 8,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("sha256"),
            HashAlgorithm::Crc32 => f.write_str("crc32"),
        }
    }
}
