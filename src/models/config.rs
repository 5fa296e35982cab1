use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_file_prefix() -> String {
    "ithaca_scheduler".to_string()
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_failure_backoff_secs() -> u64 {
    30 * 60
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_startup_timeout_secs() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            file_prefix: default_file_prefix(),
            default_interval_secs: default_interval_secs(),
            failure_threshold: default_failure_threshold(),
            failure_backoff_secs: default_failure_backoff_secs(),
            command_timeout_ms: default_command_timeout_ms(),
            startup_timeout_secs: default_startup_timeout_secs(),
            log_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// Directory holding the PID, status, socket and log files.
    ///
    /// Falls back to the OS temp directory when unset.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.runtime_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.runtime_dir.is_none());
        assert_eq!(config.file_prefix, "ithaca_scheduler");
        assert_eq!(config.default_interval_secs, 3600);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.failure_backoff_secs, 1800);
        assert_eq!(config.command_timeout_ms, 5000);
        assert_eq!(config.startup_timeout_secs, 10);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_scheduler_config_partial_deserialization_empty() {
        let config: SchedulerConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config.file_prefix, "ithaca_scheduler");
        assert_eq!(config.default_interval_secs, 3600);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.failure_backoff_secs, 1800);
    }

    #[test]
    fn test_scheduler_config_partial_deserialization_some_fields() {
        let json = r#"{"failure_threshold": 5, "runtime_dir": "/run/ithaca"}"#;
        let config: SchedulerConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.failure_threshold, 5); // overridden
        assert_eq!(config.runtime_dir, Some(PathBuf::from("/run/ithaca")));
        assert_eq!(config.failure_backoff_secs, 1800); // default
        assert_eq!(config.file_prefix, "ithaca_scheduler"); // default
    }

    #[test]
    fn test_runtime_dir_falls_back_to_temp_dir() {
        let config = SchedulerConfig::default();
        assert_eq!(config.runtime_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_log_dir_follows_runtime_dir() {
        let config = SchedulerConfig {
            runtime_dir: Some(PathBuf::from("/run/ithaca")),
            ..Default::default()
        };
        assert_eq!(config.log_dir(), PathBuf::from("/run/ithaca"));

        let config = SchedulerConfig {
            runtime_dir: Some(PathBuf::from("/run/ithaca")),
            log_dir: Some(PathBuf::from("/var/log/ithaca")),
            ..Default::default()
        };
        assert_eq!(config.log_dir(), PathBuf::from("/var/log/ithaca"));
    }
}
