//! # World Configuration
//!
//! Loaded once at startup from TOML. Every field has a default, so an empty
//! file is a valid configuration.
//!
//! ```toml
//! worker_threads = 8
//! distributed_tasks = 4
//! pending_capacity = 256
//! log_frame_timings = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{WorldError, WorldResult};

/// Runtime parameters of a [`World`](crate::World).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Upper bound on concurrently executing updates.
    pub worker_threads: usize,
    /// Sub-tasks per distributed update.
    pub distributed_tasks: usize,
    /// Pending rows reserved per collection.
    pub pending_capacity: usize,
    /// Log a timing summary after every frame.
    pub log_frame_timings: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self {
            worker_threads: cores,
            distributed_tasks: cores,
            pending_capacity: 64,
            log_frame_timings: false,
        }
    }
}

impl WorldConfig {
    /// Single worker, no distribution. Deterministic ordering for tests.
    #[must_use]
    pub const fn single_threaded() -> Self {
        Self {
            worker_threads: 1,
            distributed_tasks: 1,
            pending_capacity: 16,
            log_frame_timings: false,
        }
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::InvalidConfig`] for malformed TOML or values
    /// that fail [`validate`](Self::validate).
    pub fn from_toml(source: &str) -> WorldResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| WorldError::InvalidConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::InvalidConfig`] if the file cannot be read or
    /// does not parse.
    pub fn load(path: impl AsRef<Path>) -> WorldResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| WorldError::InvalidConfig(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&source)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::InvalidConfig`] if `worker_threads` or
    /// `distributed_tasks` is zero.
    pub fn validate(&self) -> WorldResult<()> {
        if self.worker_threads == 0 {
            return Err(WorldError::InvalidConfig("worker_threads must be at least 1".into()));
        }
        if self.distributed_tasks == 0 {
            return Err(WorldError::InvalidConfig("distributed_tasks must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = WorldConfig::from_toml("").unwrap();
        assert_eq!(config, WorldConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = WorldConfig::from_toml("worker_threads = 3\nlog_frame_timings = true").unwrap();
        assert_eq!(config.worker_threads, 3);
        assert!(config.log_frame_timings);
        assert_eq!(config.pending_capacity, 64);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            WorldConfig::from_toml("worker_threads = 0"),
            Err(WorldError::InvalidConfig(_))
        ));
        assert!(matches!(
            WorldConfig::from_toml("distributed_tasks = \"many\""),
            Err(WorldError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = WorldConfig::load("/nonexistent/cadence.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
