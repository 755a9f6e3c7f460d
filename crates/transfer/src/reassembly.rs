use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use filexfer_protocol::{Manifest, TransferId};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::ackset::AckSet;
use crate::checksum::{calculate_file_checksum, checksum_bytes, checksums_match};

/// Result of a successful [`Reassembler::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Chunk written to the staging file and marked acknowledged.
    Stored,
    /// Chunk was already acknowledged; nothing written.
    Duplicate,
}

/// Returns the hidden staging path for `file_name` under `dest_dir`.
///
/// `<dest_dir>/<subdirs>/.<name>.<short id>.part`, deterministic so a
/// restarted receiver finds the same file again.
pub fn staging_path_for(dest_dir: &Path, file_name: &str, id: &TransferId) -> PathBuf {
    let final_path = dest_dir.join(file_name);
    let parent = final_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dest_dir.to_path_buf());
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent.join(format!(".{name}.{}.part", id.short()))
}

/// Writes out-of-order chunks into a pre-sized staging file.
///
/// The acknowledged set always equals the set of chunks written to the
/// staging file; an index is added only after its bytes are on disk.
pub struct Reassembler {
    manifest: Manifest,
    final_path: PathBuf,
    staging_path: PathBuf,
    file: Option<File>,
    acked: AckSet,
    durable: bool,
}

impl Reassembler {
    /// Opens or creates the staging file for `manifest`.
    ///
    /// With `resume` set and a staging file of the right length on disk,
    /// the previously acknowledged chunks are kept. Otherwise the staging
    /// file is recreated and every chunk must be received again.
    pub fn create(
        manifest: Manifest,
        final_path: PathBuf,
        staging_path: PathBuf,
        resume: Option<AckSet>,
        durable: bool,
    ) -> Result<Self, TransferError> {
        if let Some(parent) = staging_path.parent() {
            std::fs::create_dir_all(parent).map_err(TransferError::Write)?;
        }

        let resumable = resume.filter(|acked| {
            acked.total() == manifest.total_chunks
                && std::fs::metadata(&staging_path)
                    .map(|m| m.is_file() && m.len() == manifest.size)
                    .unwrap_or(false)
        });

        let (file, acked) = match resumable {
            Some(acked) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&staging_path)
                    .map_err(TransferError::Write)?;
                debug!(
                    transfer = %manifest.transfer_id,
                    cursor = acked.cursor(),
                    acked = acked.count(),
                    "reopened staging file"
                );
                (file, acked)
            }
            None => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&staging_path)
                    .map_err(TransferError::Write)?;
                file.set_len(manifest.size).map_err(TransferError::Write)?;
                (file, AckSet::new(manifest.total_chunks))
            }
        };

        Ok(Self {
            manifest,
            final_path,
            staging_path,
            file: Some(file),
            acked,
            durable,
        })
    }

    /// Verifies and stores one chunk.
    pub fn accept(
        &mut self,
        index: u64,
        payload: &[u8],
        checksum: &str,
    ) -> Result<Accepted, TransferError> {
        let Some(expected_len) = self.manifest.chunk_len(index) else {
            return Err(TransferError::IndexOutOfRange {
                index,
                total: self.manifest.total_chunks,
            });
        };

        // Stored bytes already passed verification; retransmits skip the hash.
        if self.acked.contains(index) {
            return Ok(Accepted::Duplicate);
        }

        let actual = checksum_bytes(self.manifest.hash_algorithm, payload);
        if payload.len() != expected_len || !checksums_match(&actual, checksum) {
            return Err(TransferError::ChunkCorrupt { index });
        }

        let file = self.file.as_mut().ok_or_else(|| {
            TransferError::Write(std::io::Error::other("staging file released"))
        })?;
        file.seek(SeekFrom::Start(self.manifest.chunk_offset(index)))
            .map_err(TransferError::Write)?;
        file.write_all(payload).map_err(TransferError::Write)?;
        if self.durable {
            file.sync_data().map_err(TransferError::Write)?;
        }

        self.acked.insert(index);
        Ok(Accepted::Stored)
    }

    pub fn is_complete(&self) -> bool {
        self.acked.is_complete()
    }

    /// Count of contiguously stored chunks from index 0.
    pub fn cursor(&self) -> u64 {
        self.acked.cursor()
    }

    pub fn acked(&self) -> &AckSet {
        &self.acked
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Hashes the staging file and, on a match, renames it to the final
    /// path. On a mismatch the staging file is deleted.
    pub fn verify_and_promote(mut self) -> Result<PathBuf, TransferError> {
        if let Some(file) = self.file.take() {
            if self.durable {
                file.sync_all().map_err(TransferError::Write)?;
            }
            drop(file);
        }

        let actual = calculate_file_checksum(self.manifest.hash_algorithm, &self.staging_path)?;
        if !checksums_match(&actual, &self.manifest.file_hash) {
            warn!(
                transfer = %self.manifest.transfer_id,
                expected = %self.manifest.file_hash,
                actual = %actual,
                "whole-file hash mismatch, discarding staging file"
            );
            if let Err(e) = std::fs::remove_file(&self.staging_path) {
                warn!(path = %self.staging_path.display(), error = %e, "failed to remove staging file");
            }
            return Err(TransferError::WholeFileIntegrity {
                expected: self.manifest.file_hash.clone(),
                actual,
            });
        }

        let backup_suffix = self
            .manifest
            .backup_suffix
            .as_deref()
            .filter(|s| !s.is_empty() && self.final_path.is_file());
        if let Some(suffix) = backup_suffix {
            let mut backup: OsString = self.final_path.clone().into_os_string();
            backup.push(suffix);
            let backup = PathBuf::from(backup);
            std::fs::rename(&self.final_path, &backup).map_err(TransferError::Write)?;
            info!(
                path = %self.final_path.display(),
                backup = %backup.display(),
                "backed up existing file"
            );
        }

        if let Some(parent) = self.final_path.parent() {
            std::fs::create_dir_all(parent).map_err(TransferError::Write)?;
        }
        std::fs::rename(&self.staging_path, &self.final_path).map_err(TransferError::Write)?;
        info!(
            transfer = %self.manifest.transfer_id,
            path = %self.final_path.display(),
            "promoted staging file"
        );
        Ok(self.final_path)
    }

    /// Closes the staging file and deletes it.
    pub fn discard(mut self) -> Result<(), TransferError> {
        self.file.take();
        match std::fs::remove_file(&self.staging_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::Write(e)),
        }
    }

    /// Closes the staging file, leaving it on disk for a later resume.
    pub fn release(mut self) -> AckSet {
        self.file.take();
        self.acked
    }
}
