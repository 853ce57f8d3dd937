//! Configuration management for the delayq engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a delayq node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Directory under which per-partition queue data lives.
    pub data_dir: PathBuf,
    /// Per-queue engine tunables.
    pub queue: QueueConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::InvalidArgument(e.to_string()))
    }
}

/// Tunables for one delayed-queue engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum size of one log segment file before rollover.
    /// Default: 100 MiB.
    pub max_bytes_per_file: u64,
    /// Maximum message payload size accepted by a put.
    /// Default: 1 MiB.
    pub max_msg_size: u32,
    /// Flush every N puts. 0 disables count-driven flushing; 1 flushes on
    /// every put.
    pub sync_every: u64,
    /// Store file size at which compaction becomes eligible.
    /// Default: 16 MiB.
    pub compact_threshold_bytes: u64,
    /// Compaction is skipped while more than this many live entries remain.
    /// Default: 20000.
    pub compact_count_threshold: u64,
    /// Byte budget of one inner transaction during store compaction.
    /// Default: 64 KiB.
    pub tx_max_size: usize,
    /// Maximum entries deleted per transaction during batch emptying.
    /// Default: 10000.
    pub tx_max_batch: usize,
    /// Age-based retention horizon in days for log cleanup.
    /// Default: 7.
    pub retention_days: u32,
    /// Deadline for one store compaction run, in milliseconds.
    /// Default: 2000.
    pub compact_deadline_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_file: 100 * 1024 * 1024, // 100 MiB
            max_msg_size: 1024 * 1024,             // 1 MiB
            sync_every: 0,
            compact_threshold_bytes: 16 * 1024 * 1024, // 16 MiB
            compact_count_threshold: 20_000,
            tx_max_size: 64 * 1024, // 64 KiB
            tx_max_batch: 10_000,
            retention_days: 7,
            compact_deadline_ms: 2_000,
        }
    }
}

impl QueueConfig {
    /// Configuration optimized for maximum durability.
    /// Flushes the log and syncs the store after every put.
    #[must_use]
    pub fn durable() -> Self {
        Self { sync_every: 1, ..Default::default() }
    }

    /// Configuration optimized for throughput. Flushing is left to the
    /// periodic flush driven by the owning topic.
    #[must_use]
    pub fn fast() -> Self {
        Self { sync_every: 0, ..Default::default() }
    }
}
