//! Durable resume records, one JSON file per transfer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use filexfer_protocol::{Manifest, TransferId};
use filexfer_transfer::AckSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Receiver progress for one transfer, enough to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    pub manifest: Manifest,
    pub cursor: u64,
    /// Hex-encoded acknowledged bitmap.
    pub acked: String,
    pub staging_path: PathBuf,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn new(manifest: &Manifest, acked: &AckSet, staging_path: &Path) -> Self {
        Self {
            manifest: manifest.clone(),
            cursor: acked.cursor(),
            acked: acked.to_hex(),
            staging_path: staging_path.to_path_buf(),
            updated_at: Utc::now(),
        }
    }

    /// Decodes the bitmap, or `None` if it does not match the manifest.
    pub fn ack_set(&self) -> Option<AckSet> {
        AckSet::from_hex(self.manifest.total_chunks, &self.acked)
    }
}

/// Directory of [`ResumeRecord`]s.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &TransferId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Reads the record for `id`. Unreadable records are deleted.
    pub fn load(&self, id: &TransferId) -> std::io::Result<Option<ResumeRecord>> {
        let path = self.path_for(id);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<ResumeRecord>(&content) {
            Ok(record) if record.manifest.transfer_id == *id => Ok(Some(record)),
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "discarding unreadable resume record");
                remove_if_exists(&path)?;
                Ok(None)
            }
        }
    }

    /// Writes `record` atomically (temp file + rename).
    pub fn save(&self, record: &ResumeRecord) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.manifest.transfer_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)
    }

    pub fn remove(&self, id: &TransferId) -> std::io::Result<()> {
        remove_if_exists(&self.path_for(id))
    }

    /// Deletes records (and their staging files) not updated within
    /// `max_age`, skipping identifiers for which `in_use` returns `true`.
    pub fn prune(
        &self,
        max_age: Duration,
        in_use: impl Fn(&TransferId) -> bool,
    ) -> std::io::Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let now = Utc::now();

        let mut pruned = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(TransferId::from_raw)
            else {
                continue;
            };
            if in_use(&id) {
                continue;
            }
            let Some(record) = self.load(&id)? else {
                continue;
            };
            let age = now
                .signed_duration_since(record.updated_at)
                .to_std()
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }
            remove_if_exists(&record.staging_path)?;
            remove_if_exists(&path)?;
            debug!(transfer = %id, "pruned stale resume record");
            pruned += 1;
        }
        Ok(pruned)
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
