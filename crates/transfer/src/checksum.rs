use std::io::Read;
use std::path::Path;

use filexfer_protocol::HashAlgorithm;
use sha2::{Digest, Sha256};

use crate::TransferError;

/// Incremental hasher over either supported algorithm.
pub enum ContentHasher {
    Sha256(Sha256),
    Crc32(crc32fast::Hasher),
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
            HashAlgorithm::Crc32 => ContentHasher::Crc32(crc32fast::Hasher::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Crc32(h) => h.update(data),
        }
    }

    /// Consumes the hasher and returns the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            ContentHasher::Sha256(h) => hex::encode(h.finalize()),
            ContentHasher::Crc32(h) => format!("{:08x}", h.finalize()),
        }
    }
}

/// Computes the digest of `data` and returns it hex-encoded.
pub fn checksum_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = ContentHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Computes the digest of an entire file and returns it hex-encoded.
pub fn calculate_file_checksum(
    algorithm: HashAlgorithm,
    path: &Path,
) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path).map_err(TransferError::Read)?;
    let mut hasher = ContentHasher::new(algorithm);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(TransferError::Read)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Compares two hex digests, ignoring case.
pub fn checksums_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.eq_ignore_ascii_case(b)
}
