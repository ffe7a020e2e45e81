//! Options for queues, buffers and dispatchers.
//!
//! Every struct deserializes with `#[serde(default)]`, so a settings file only
//! needs the keys it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Shape of a `DistributedQueue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Internal shards per distribution.
    pub nodes: usize,

    /// Bound of each shard. `None` means unbounded.
    pub node_capacity: Option<usize>,

    /// How long enqueue/dequeue wait before giving up.
    pub timeout_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            nodes: 4,
            node_capacity: None,
            timeout_ms: 100,
        }
    }
}

impl QueueOptions {
    pub fn bounded(nodes: usize, node_capacity: usize) -> Self {
        Self {
            nodes,
            node_capacity: Some(node_capacity),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes == 0 {
            return Err(ConfigError::Invalid("queue nodes must be at least 1".into()));
        }
        if self.node_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "queue node_capacity must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/// Local buffer in front of a slow backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferOptions {
    pub queue: QueueOptions,

    /// Upper bound of concurrent flush workers.
    pub flush_jobs: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            queue: QueueOptions {
                nodes: 1,
                node_capacity: Some(1024),
                timeout_ms: 100,
            },
            flush_jobs: 1,
        }
    }
}

impl BufferOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        if self.flush_jobs == 0 {
            return Err(ConfigError::Invalid("flush_jobs must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchOptions {
    /// Dispatch workers. `None` uses the host's available parallelism.
    pub workers: Option<usize>,

    /// Collect dead letters instead of notifying handlers.
    pub accumulate_dead_letters: bool,

    /// Collect successes instead of notifying handlers.
    pub accumulate_successes: bool,

    /// How long an idle worker waits before re-checking the backend.
    pub idle_poll_ms: u64,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: None,
            accumulate_dead_letters: false,
            accumulate_successes: false,
            idle_poll_ms: 10,
        }
    }
}

impl DispatchOptions {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Everything a host needs to wire a dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: QueueOptions,

    /// When present, producers go through a buffered frontend.
    pub buffer: Option<BufferOptions>,

    pub dispatch: DispatchOptions,
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend.validate()?;
        if let Some(buffer) = &self.buffer {
            buffer.validate()?;
        }
        self.dispatch.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_json_gives_defaults() {
        let settings = Settings::from_json_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.backend.nodes, 4);
        assert!(settings.buffer.is_none());
    }

    #[test]
    fn partial_json_overrides_only_given_keys() {
        let settings = Settings::from_json_str(
            r#"{
                "backend": { "timeout_ms": 250 },
                "buffer": { "flush_jobs": 3 },
                "dispatch": { "workers": 2, "accumulate_successes": true }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.backend.nodes, 4);
        assert_eq!(settings.backend.timeout(), Duration::from_millis(250));

        let buffer = settings.buffer.unwrap();
        assert_eq!(buffer.flush_jobs, 3);
        assert_eq!(buffer.queue.node_capacity, Some(1024));

        assert_eq!(settings.dispatch.worker_count(), 2);
        assert!(settings.dispatch.accumulate_successes);
        assert!(!settings.dispatch.accumulate_dead_letters);
    }

    #[rstest]
    #[case::zero_nodes(r#"{ "backend": { "nodes": 0 } }"#)]
    #[case::zero_capacity(r#"{ "backend": { "node_capacity": 0 } }"#)]
    #[case::zero_flush_jobs(r#"{ "buffer": { "flush_jobs": 0 } }"#)]
    #[case::zero_workers(r#"{ "dispatch": { "workers": 0 } }"#)]
    fn invalid_settings_are_rejected(#[case] json: &str) {
        let err = Settings::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = Settings::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Settings::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn default_worker_count_is_positive() {
        assert!(DispatchOptions::default().worker_count() >= 1);
    }
}
