//! Client and server configuration.
//!
//! Serialised as camelCase JSON with durations in milliseconds. Missing
//! fields fall back to their defaults; out-of-range values are clamped
//! with a warning when loaded from disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use filexfer_protocol::HashAlgorithm;
use filexfer_protocol::constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SessionError;

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Retransmission timing for unacknowledged messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Timeout before the first retransmission.
    #[serde(with = "duration_ms")]
    pub retransmit_timeout: Duration,
    /// Retransmissions allowed per chunk before the transfer fails.
    pub max_retries: u32,
    /// Multiplier applied per retransmission; 1.0 keeps the interval fixed.
    pub backoff_factor: f64,
    /// Upper bound on any single timeout.
    #[serde(with = "duration_ms")]
    pub max_retransmit_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retransmit_timeout: Duration::from_millis(500),
            max_retries: 5,
            backoff_factor: 1.0,
            max_retransmit_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Timeout to wait after send number `attempt` (0 = first send).
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || (self.backoff_factor - 1.0).abs() < f64::EPSILON {
            return self.retransmit_timeout.min(self.max_retransmit_timeout);
        }
        let exp = attempt.min(63) as i32;
        let secs = self.retransmit_timeout.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_retransmit_timeout.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.001))
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.retransmit_timeout.is_zero() {
            return Err(SessionError::Config("retransmitTimeout must be > 0".into()));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(SessionError::Config("backoffFactor must be >= 1.0".into()));
        }
        if self.max_retransmit_timeout < self.retransmit_timeout {
            return Err(SessionError::Config(
                "maxRetransmitTimeout must be >= retransmitTimeout".into(),
            ));
        }
        Ok(())
    }
}

/// Sender-side configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub chunk_size: u32,
    pub hash_algorithm: HashAlgorithm,
    /// Maximum chunks in flight without acknowledgment.
    pub window_size: usize,
    pub retry: RetryPolicy,
    /// Upper bound on how long the send loop sleeps between checks.
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Wait for a `NegotiationAck` before resending the manifest.
    #[serde(with = "duration_ms")]
    pub negotiation_timeout: Duration,
    /// Cancel if no acknowledgment progress is made for this long.
    #[serde(with = "duration_ms")]
    pub inactivity_timeout: Duration,
    /// Suffix for backing up an existing file on the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_suffix: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_algorithm: HashAlgorithm::Sha256,
            window_size: 32,
            retry: RetryPolicy::default(),
            tick_interval: Duration::from_millis(50),
            negotiation_timeout: Duration::from_secs(1),
            inactivity_timeout: Duration::from_secs(30),
            backup_suffix: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(SessionError::Config(format!(
                "chunkSize must be in 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.window_size == 0 {
            return Err(SessionError::Config("windowSize must be > 0".into()));
        }
        if self.tick_interval.is_zero() || self.negotiation_timeout.is_zero() {
            return Err(SessionError::Config(
                "tickInterval and negotiationTimeout must be > 0".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Receiver-side configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Completed files are placed under this directory.
    pub destination_dir: PathBuf,
    /// Resume records are kept here, one JSON file per transfer.
    pub state_dir: PathBuf,
    /// Concurrently active sessions before new manifests are refused.
    pub max_sessions: usize,
    pub max_file_size: u64,
    /// Largest chunk count a manifest may declare. Bounds the per-session
    /// acknowledgment bitmap.
    pub max_chunks: u64,
    /// Sync every chunk to disk before acknowledging it.
    pub durable_writes: bool,
    #[serde(with = "duration_ms")]
    pub inactivity_timeout: Duration,
    /// How long finished sessions are remembered to answer late messages.
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    pub registry_shards: usize,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Per-session inbox depth; excess datagrams are dropped.
    pub inbox_capacity: usize,
    /// Minimum time between resume record writes while chunks arrive.
    /// The record is always written when a session stops.
    #[serde(with = "duration_ms")]
    pub checkpoint_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            destination_dir: PathBuf::from("received"),
            state_dir: PathBuf::from("received/.filexfer-state"),
            max_sessions: 64,
            max_file_size: 4 * 1024 * 1024 * 1024,
            max_chunks: 1 << 20,
            durable_writes: true,
            inactivity_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(10 * 60),
            registry_shards: 16,
            sweep_interval: Duration::from_secs(5),
            inbox_capacity: 256,
            checkpoint_interval: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields the defaults. A file that fails to parse is
    /// logged and ignored.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no server config, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(SessionError::Config(format!("{}: {e}", path.display()))),
        };

        match serde_json::from_str::<ServerConfig>(&content) {
            Ok(config) => Ok(config.sanitized()),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse server config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Saves configuration to `path` as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SessionError::Config(format!("{}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SessionError::Config(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "server configuration saved");
        Ok(())
    }

    /// Clamps out-of-range values back to usable ones.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_sessions == 0 {
            warn!("maxSessions must be >= 1, using {}", defaults.max_sessions);
            self.max_sessions = defaults.max_sessions;
        }
        if !(1..=256).contains(&self.registry_shards) {
            warn!(
                shards = self.registry_shards,
                "registryShards out of range, clamping to 1..=256"
            );
            self.registry_shards = self.registry_shards.clamp(1, 256);
        }
        if self.max_chunks == 0 {
            warn!("maxChunks must be >= 1, using {}", defaults.max_chunks);
            self.max_chunks = defaults.max_chunks;
        }
        if self.inbox_capacity == 0 {
            self.inbox_capacity = defaults.inbox_capacity;
        }
        if self.inactivity_timeout.is_zero() {
            warn!("inactivityTimeout must be > 0, using default");
            self.inactivity_timeout = defaults.inactivity_timeout;
        }
        if self.sweep_interval.is_zero() {
            self.sweep_interval = defaults.sweep_interval;
        }
        self
    }
}
