/// Configuration file support for HORUS collectives
///
/// Channel geometry, backend choice, placement and retry behaviour can be
/// loaded from TOML/YAML instead of being hardcoded at every call site.
/// Supports auto-detection of file format and multiple search paths.
use crate::channel::ump::AckPolicy;
use crate::channel::{QueueKind, RetryPolicy};
use crate::error::{CollectiveError, CollectiveResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default slots per channel: one 4 KiB page of cache-line slots
pub const DEFAULT_QUEUE_SLOTS: usize = 64;

/// Largest slot count the 16-bit ring indices can address
pub const MAX_QUEUE_SLOTS: usize = u16::MAX as usize;

/// How blocking operations wait for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Busy-poll until the operation succeeds
    #[default]
    Spin,
    /// Give up after `max_spins` failed attempts
    Bounded,
    /// Give up after `deadline_ms` milliseconds
    Deadline,
}

/// Retry settings for the blocking channel wrappers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub mode: RetryMode,

    /// Attempt budget for `bounded` mode
    pub max_spins: u64,

    /// Wall-clock budget for `deadline` mode
    pub deadline_ms: u64,

    /// Yield the thread every N failed attempts (0 = never)
    pub yield_every: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::Spin,
            max_spins: 1_000_000,
            deadline_ms: 1_000,
            yield_every: 0,
        }
    }
}

impl RetryConfig {
    /// Build the runtime policy described by this section.
    pub fn to_policy(&self) -> RetryPolicy {
        let policy = match self.mode {
            RetryMode::Spin => RetryPolicy::spin(),
            RetryMode::Bounded => RetryPolicy::bounded(self.max_spins),
            RetryMode::Deadline => RetryPolicy::deadline(Duration::from_millis(self.deadline_ms)),
        };
        policy.with_yield_every(self.yield_every)
    }
}

/// HORUS collective configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveConfig {
    /// Slots per channel buffer (capacity is backend dependent)
    #[serde(default = "default_queue_slots")]
    pub queue_slots: usize,

    /// Channel backend used for every queue pair
    #[serde(default)]
    pub backend: QueueKind,

    /// When receivers publish their acknowledgement word
    #[serde(default)]
    pub ack_policy: AckPolicy,

    /// Place each channel buffer on the NUMA node of its consumer
    #[serde(default = "crate::utils::default_true")]
    pub numa_aware: bool,

    /// Pin every node thread to its core
    #[serde(default = "crate::utils::default_true")]
    pub pin_threads: bool,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_queue_slots() -> usize {
    DEFAULT_QUEUE_SLOTS
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            queue_slots: DEFAULT_QUEUE_SLOTS,
            backend: QueueKind::default(),
            ack_policy: AckPolicy::default(),
            numa_aware: true,
            pin_threads: true,
            retry: RetryConfig::default(),
        }
    }
}

impl CollectiveConfig {
    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> CollectiveResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CollectiveError::config(format!("Failed to read config file: {}", e)))?;

        // Auto-detect format based on extension
        let extension = path.extension().and_then(|s| s.to_str());
        let config = match extension {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => {
                // Try both formats
                Self::from_toml(&contents).or_else(|_| Self::from_yaml(&contents))
            }
        }?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from TOML string
    pub fn from_toml(contents: &str) -> CollectiveResult<Self> {
        toml::from_str(contents)
            .map_err(|e| CollectiveError::config(format!("Failed to parse TOML: {}", e)))
    }

    /// Parse config from YAML string
    pub fn from_yaml(contents: &str) -> CollectiveResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| CollectiveError::config(format!("Failed to parse YAML: {}", e)))
    }

    /// Find and load config file from standard search paths
    ///
    /// Search order:
    /// 1. ./collective.toml or ./collective.yaml
    /// 2. ~/.horus/collective.toml or ~/.horus/collective.yaml
    /// 3. /etc/horus/collective.toml
    pub fn find_and_load() -> CollectiveResult<Self> {
        for path in Self::get_search_paths() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(CollectiveError::config(
            "No collective config file found in standard locations",
        ))
    }

    /// Get standard config file search paths
    pub fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("collective.toml"),
            PathBuf::from("collective.yaml"),
            PathBuf::from("collective.yml"),
        ];

        if let Some(home) = dirs::home_dir() {
            let horus_dir = home.join(".horus");
            paths.push(horus_dir.join("collective.toml"));
            paths.push(horus_dir.join("collective.yaml"));
        }

        paths.push(PathBuf::from("/etc/horus/collective.toml"));
        paths
    }

    /// Reject values the channel layer cannot represent.
    pub fn validate(&self) -> CollectiveResult<()> {
        if self.queue_slots < 2 || self.queue_slots > MAX_QUEUE_SLOTS {
            return Err(CollectiveError::config(format!(
                "queue_slots must be within 2..={}, got {}",
                MAX_QUEUE_SLOTS, self.queue_slots
            )));
        }
        if self.retry.mode == RetryMode::Bounded && self.retry.max_spins == 0 {
            return Err(CollectiveError::config("retry.max_spins must be non-zero"));
        }
        Ok(())
    }

    /// Runtime retry policy for blocking operations.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CollectiveConfig::default();
        assert_eq!(config.queue_slots, 64);
        assert_eq!(config.backend, QueueKind::Ump);
        assert_eq!(config.ack_policy, AckPolicy::EveryMessage);
        assert!(config.numa_aware);
        assert!(config.pin_threads);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            queue_slots = 16
            backend = "ffq"
            pin_threads = false

            [retry]
            mode = "deadline"
            deadline_ms = 250
        "#;

        let config = CollectiveConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.queue_slots, 16);
        assert_eq!(config.backend, QueueKind::Ffq);
        assert!(!config.pin_threads);
        assert!(config.numa_aware);
        assert_eq!(config.retry.mode, RetryMode::Deadline);
        assert_eq!(config.retry.deadline_ms, 250);
        assert_eq!(
            config.retry_policy().deadline_budget(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_parse_yaml() {
        let yaml_str = r#"
            queue_slots: 8
            ack_policy: on_wrap
            retry:
              mode: bounded
              max_spins: 100
        "#;

        let config = CollectiveConfig::from_yaml(yaml_str).unwrap();
        assert_eq!(config.queue_slots, 8);
        assert_eq!(config.ack_policy, AckPolicy::OnWrap);
        assert_eq!(config.retry.mode, RetryMode::Bounded);
        assert_eq!(config.retry_policy().max_attempts(), Some(100));
    }

    #[test]
    fn test_validate_rejects_slot_counts() {
        let mut config = CollectiveConfig {
            queue_slots: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CollectiveError::Config(_))));
        config.queue_slots = 70_000;
        assert!(config.validate().is_err());
        config.queue_slots = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_autodetects_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("collective.toml");
        std::fs::write(&toml_path, "queue_slots = 32\n").unwrap();
        assert_eq!(CollectiveConfig::from_file(&toml_path).unwrap().queue_slots, 32);

        // No extension: TOML is tried first, then YAML
        let mut plain = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        writeln!(plain, "queue_slots: 4").unwrap();
        assert_eq!(CollectiveConfig::from_file(plain.path()).unwrap().queue_slots, 4);

        let bad_path = dir.path().join("bad.yaml");
        std::fs::write(&bad_path, "queue_slots: 1\n").unwrap();
        assert!(CollectiveConfig::from_file(&bad_path).is_err());
    }
}
