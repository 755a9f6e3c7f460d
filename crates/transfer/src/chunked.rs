use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use filexfer_protocol::{HashAlgorithm, Manifest};

use crate::TransferError;
use crate::checksum::checksum_bytes;

/// One indexed slice of a file plus the checksum of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    /// Byte offset within the file.
    pub offset: u64,
    pub data: Vec<u8>,
    /// Hex digest of `data` under the manifest's algorithm.
    pub checksum: String,
}

/// Produces chunks of a source file on demand.
///
/// Chunks are read lazily by index so retransmissions never keep payloads
/// in memory. Every read re-checks the file length against the manifest;
/// a file that changed mid-transfer cannot be sent.
pub struct Chunker {
    file: File,
    path: PathBuf,
    size: u64,
    chunk_size: u32,
    total: u64,
    algorithm: HashAlgorithm,
}

impl Chunker {
    /// Opens `path` for chunked reading under `manifest`'s layout.
    pub fn open(path: &Path, manifest: &Manifest) -> Result<Self, TransferError> {
        let file = File::open(path).map_err(TransferError::Read)?;
        let actual = file.metadata().map_err(TransferError::Read)?.len();
        if actual != manifest.size {
            return Err(TransferError::SourceChanged {
                expected: manifest.size,
                actual,
            });
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size: manifest.size,
            chunk_size: manifest.chunk_size,
            total: manifest.total_chunks,
            algorithm: manifest.hash_algorithm,
        })
    }

    /// Reads chunk `index` from disk.
    pub fn produce(&mut self, index: u64) -> Result<Chunk, TransferError> {
        if index >= self.total {
            return Err(TransferError::IndexOutOfRange {
                index,
                total: self.total,
            });
        }

        let actual = self.file.metadata().map_err(TransferError::Read)?.len();
        if actual != self.size {
            return Err(TransferError::SourceChanged {
                expected: self.size,
                actual,
            });
        }

        let offset = index * u64::from(self.chunk_size);
        let len = (self.size - offset).min(u64::from(self.chunk_size)) as usize;
        let mut data = vec![0u8; len];
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(TransferError::Read)?;
        self.file.read_exact(&mut data).map_err(TransferError::Read)?;

        let checksum = checksum_bytes(self.algorithm, &data);
        Ok(Chunk {
            index,
            offset,
            data,
            checksum,
        })
    }

    /// Lazily yields every chunk from `cursor` to the end of the file.
    pub fn chunks_from(&mut self, cursor: u64) -> ChunkIter<'_> {
        ChunkIter {
            chunker: self,
            next: cursor,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.total
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Iterator returned by [`Chunker::chunks_from`].
pub struct ChunkIter<'a> {
    chunker: &'a mut Chunker,
    next: u64,
}

impl Iterator for ChunkIter<'_> {
    type Item = Result<Chunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.chunker.total {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.chunker.produce(index))
    }
}
