//! Engine configuration.
//!
//! Every struct has sensible defaults and can be loaded from JSON; missing
//! fields fall back to their defaults.
//!
//! ```json
//! {
//!   "channels": { "type": "file", "path": "./data/channels" },
//!   "documents": { "type": "file", "path": "./data/documents", "cache_size": 5000 },
//!   "subscription": { "queue_capacity": 64 },
//!   "projection": { "failure_policy": "rewind" }
//! }
//! ```

use crate::error::{EngineError, Result};
use crate::log::LogConfig;
use crate::subscriptions::SubscriptionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_sync_interval() -> u64 {
    1
}

fn default_cache_size() -> usize {
    1000
}

/// Storage backend selection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Keep everything in memory; nothing survives the process.
    #[default]
    Memory,
    /// Durable storage rooted at `path`.
    File {
        path: PathBuf,
        /// Channel stores fsync every N appends.
        #[serde(default = "default_sync_interval")]
        sync_interval: u64,
        /// Document stores cache this many documents per binder.
        #[serde(default = "default_cache_size")]
        cache_size: usize,
    },
}

impl BackendConfig {
    /// File backend with default tuning.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        BackendConfig::File {
            path: path.into(),
            sync_interval: default_sync_interval(),
            cache_size: default_cache_size(),
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            BackendConfig::Memory => None,
            BackendConfig::File { path, .. } => Some(path),
        }
    }
}

/// What a projection does when writing its document or checkpoint fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop; the next start resumes from the durable checkpoint.
    #[default]
    Stop,
    /// Best effort: restore the previous document and move the checkpoint
    /// back before the failed event, then stop.
    Rewind,
}

/// Checkpoint handling for events a projection skips.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilteredEvents {
    /// Record skipped events as processed.
    #[default]
    Advance,
    /// Leave the checkpoint at the last applied event.
    Hold,
}

/// Projection engine configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub failure_policy: FailurePolicy,
    pub filtered_events: FilteredEvents,
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where channel events are stored.
    pub channels: BackendConfig,

    /// Where projected documents and checkpoints are stored.
    pub documents: BackendConfig,

    /// Defaults for every subscription, including projection ones.
    pub subscription: SubscriptionConfig,

    pub projection: ProjectionConfig,

    /// Appends tried before a publish gives up on conflicts.
    /// Default: 16
    pub max_publish_attempts: u32,

    /// Check payload checksums on every read.
    /// Default: false
    pub verify_checksums: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channels: BackendConfig::Memory,
            documents: BackendConfig::Memory,
            subscription: SubscriptionConfig::default(),
            projection: ProjectionConfig::default(),
            max_publish_attempts: 16,
            verify_checksums: false,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidOperation(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Both backends on disk under `root`, in `channels/` and `documents/`.
    pub fn file(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            channels: BackendConfig::file(root.join("channels")),
            documents: BackendConfig::file(root.join("documents")),
            ..Default::default()
        }
    }

    pub(crate) fn log_config(&self) -> LogConfig {
        LogConfig {
            max_publish_attempts: self.max_publish_attempts,
            verify_checksums: self.verify_checksums,
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.subscription.queue_capacity == 0 {
            return Err(EngineError::InvalidOperation(
                "subscription.queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_publish_attempts == 0 {
            return Err(EngineError::InvalidOperation(
                "max_publish_attempts must be at least 1".into(),
            ));
        }
        if let (Some(channels), Some(documents)) = (self.channels.path(), self.documents.path()) {
            if channels == documents {
                return Err(EngineError::InvalidOperation(format!(
                    "channel and document stores cannot share the root {}",
                    channels.display()
                )));
            }
        }
        Ok(())
    }
}
