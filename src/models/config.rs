use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Path to the downloader executable. Defaults to `{data_dir}/gallery-dl.bin`.
    #[serde(default)]
    pub downloader_path: Option<PathBuf>,
    /// Passed to the downloader as `--config <path>` when set.
    #[serde(default)]
    pub downloader_config: Option<PathBuf>,
    /// JSON option catalog. The built-in catalog is used when unset.
    #[serde(default)]
    pub options_file: Option<PathBuf>,
    /// Defaults to `{data_dir}/site_rules.json`.
    #[serde(default)]
    pub site_rules_file: Option<PathBuf>,
    #[serde(default = "default_group_batches")]
    pub group_batches: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8390
}

fn default_group_batches() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_kill_timeout_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            downloader_path: None,
            downloader_config: None,
            options_file: None,
            site_rules_file: None,
            group_batches: default_group_batches(),
            event_capacity: default_event_capacity(),
            cancel_grace_secs: default_cancel_grace_secs(),
            kill_timeout_secs: default_kill_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// The downloader binary, falling back to `{data_dir}/gallery-dl.bin`.
    pub fn downloader_path(&self) -> PathBuf {
        match (&self.downloader_path, &self.data_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => dir.join("gallery-dl.bin"),
            (None, None) => PathBuf::from("gallery-dl.bin"),
        }
    }

    pub fn site_rules_path(&self) -> Option<PathBuf> {
        self.site_rules_file
            .clone()
            .or_else(|| self.data_dir.as_ref().map(|d| d.join("site_rules.json")))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8390);
        assert!(config.data_dir.is_none());
        assert!(config.downloader_config.is_none());
        assert!(config.group_batches);
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.cancel_grace_secs, 5);
        assert_eq!(config.kill_timeout_secs, 5);
    }

    #[test]
    fn test_server_config_partial_deserialization_empty() {
        let config: ServerConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config.port, 8390);
        assert!(config.group_batches);
        assert!(config.options_file.is_none());
    }

    #[test]
    fn test_server_config_partial_deserialization_some_fields() {
        let json = r#"{"port": 9000, "group_batches": false, "cancel_grace_secs": 1}"#;
        let config: ServerConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert!(!config.group_batches);
        assert_eq!(config.cancel_grace(), Duration::from_secs(1));
        assert_eq!(config.kill_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_downloader_path_falls_back_to_data_dir() {
        let config = ServerConfig {
            data_dir: Some(PathBuf::from("/data")),
            ..Default::default()
        };
        assert_eq!(config.downloader_path(), PathBuf::from("/data/gallery-dl.bin"));
        assert_eq!(
            config.site_rules_path(),
            Some(PathBuf::from("/data/site_rules.json"))
        );
    }

    #[test]
    fn test_explicit_downloader_path_wins() {
        let config = ServerConfig {
            data_dir: Some(PathBuf::from("/data")),
            downloader_path: Some(PathBuf::from("/usr/bin/gallery-dl")),
            ..Default::default()
        };
        assert_eq!(config.downloader_path(), PathBuf::from("/usr/bin/gallery-dl"));
    }
}
