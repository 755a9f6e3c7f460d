use std::path::Path;

use filexfer_protocol::{HashAlgorithm, Manifest, TransferId};

use crate::TransferError;
use crate::checksum::calculate_file_checksum;

/// Hashes the file at `path` and builds its manifest.
///
/// `file_name` is the name the receiver stores the file under; it may be
/// a relative path.
pub fn build_manifest(
    path: &Path,
    file_name: &str,
    chunk_size: u32,
    algorithm: HashAlgorithm,
    backup_suffix: Option<String>,
) -> Result<Manifest, TransferError> {
    let size = std::fs::metadata(path).map_err(TransferError::Read)?.len();
    let file_hash = calculate_file_checksum(algorithm, path)?;

    let manifest = Manifest {
        transfer_id: TransferId::derive(&file_hash, size, chunk_size),
        file_name: file_name.to_string(),
        size,
        chunk_size,
        total_chunks: Manifest::expected_chunk_count(size, chunk_size),
        file_hash,
        hash_algorithm: algorithm,
        backup_suffix,
    };
    manifest.validate()?;
    Ok(manifest)
}
