//! Command-line arguments for the watch binary.

use crate::config::SyncConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "commonplace-filesync-watch",
    about = "Track files and print sync events as JSON lines"
)]
pub struct WatchArgs {
    /// Files to track
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// JSON config file (defaults apply to missing fields)
    #[arg(long, env = "COMMONPLACE_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Reload external changes automatically, discarding local edits
    #[arg(long)]
    pub reactive: bool,

    /// Poll instead of using native file notifications
    #[arg(long)]
    pub force_polling: bool,

    /// Polling interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Where to persist tracked paths and unsaved edits between runs
    #[arg(long, env = "COMMONPLACE_SYNC_STATE")]
    pub state_file: Option<PathBuf>,
}

impl WatchArgs {
    /// Config file contents with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<SyncConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)?,
            None => SyncConfig::default(),
        };
        if self.force_polling {
            config.force_polling = true;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paths_and_flags() {
        let args = WatchArgs::try_parse_from([
            "commonplace-filesync-watch",
            "a.txt",
            "b.txt",
            "--reactive",
            "--force-polling",
            "--poll-interval-ms",
            "200",
        ])
        .unwrap();
        assert_eq!(args.paths, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
        assert!(args.reactive);

        let config = args.resolve_config().unwrap();
        assert!(config.force_polling);
        assert_eq!(config.poll_interval_ms, 200);
        assert_eq!(config.token_ttl_ms, 3000);
    }

    #[test]
    fn test_paths_required() {
        assert!(WatchArgs::try_parse_from(["commonplace-filesync-watch"]).is_err());
    }

    #[test]
    fn test_config_file_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{ "poll_interval_ms": 50, "history_limit": 3 }"#).unwrap();

        let args = WatchArgs::try_parse_from([
            "commonplace-filesync-watch",
            "a.txt",
            "--config",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let config = args.resolve_config().unwrap();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.history_limit, 3);
        assert!(!config.force_polling);
    }
}
