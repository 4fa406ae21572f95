use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for a sync session, loadable from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_token_ttl_ms")]
    pub token_ttl_ms: u64,
    #[serde(default = "default_mtime_tolerance_ms")]
    pub mtime_tolerance_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_native_latency_ms")]
    pub native_latency_ms: u64,
    #[serde(default)]
    pub force_polling: bool,
    #[serde(default = "default_stat_cache_limit")]
    pub stat_cache_limit: usize,
    #[serde(default = "default_stat_max_age_ms")]
    pub stat_max_age_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_token_ttl_ms() -> u64 {
    3000
}

fn default_mtime_tolerance_ms() -> u64 {
    25
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_native_latency_ms() -> u64 {
    50
}

fn default_stat_cache_limit() -> usize {
    64
}

fn default_stat_max_age_ms() -> u64 {
    1000
}

fn default_history_limit() -> usize {
    100
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            token_ttl_ms: default_token_ttl_ms(),
            mtime_tolerance_ms: default_mtime_tolerance_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            native_latency_ms: default_native_latency_ms(),
            force_polling: false,
            stat_cache_limit: default_stat_cache_limit(),
            stat_max_age_ms: default_stat_max_age_ms(),
            history_limit: default_history_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.token_ttl_ms)
    }

    pub fn mtime_tolerance(&self) -> Duration {
        Duration::from_millis(self.mtime_tolerance_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.token_ttl(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_partial_config() {
        let json = r#"{
            "poll_interval_ms": 250,
            "force_polling": true,
            "history_limit": 10
        }"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();
        assert!(config.force_polling);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.stat_cache_limit, 64);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{ "token_ttl_ms": 500 }"#).unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.token_ttl(), Duration::from_millis(500));

        std::fs::write(&path, "not json").unwrap();
        assert!(SyncConfig::load(&path).is_err());
    }
}
