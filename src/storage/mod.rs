use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::env;
use crate::error::{OtaError, Result};
use crate::networking::{DEFAULT_DEVICE_URL, DEFAULT_RELAY_PREFIX};
use crate::release::DEFAULT_RELEASE_FEED;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub device_url: String,
    pub release_feed_url: String,
    /// Prefix placed in front of asset URLs; `None` downloads directly.
    pub asset_relay: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            device_url: DEFAULT_DEVICE_URL.to_owned(),
            release_feed_url: DEFAULT_RELEASE_FEED.to_owned(),
            asset_relay: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ConsoleConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "device_url" => self.device_url = require_url(key, value)?,
            "release_feed_url" => self.release_feed_url = require_url(key, value)?,
            "asset_relay" => {
                self.asset_relay = match value {
                    "" | "none" => None,
                    "default" => Some(DEFAULT_RELAY_PREFIX.to_owned()),
                    prefix => Some(require_url(key, prefix)?),
                }
            }
            "request_timeout_secs" => {
                self.request_timeout_secs = value
                    .parse()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or_else(|| {
                        OtaError::Config(format!("{key} must be a positive number of seconds"))
                    })?;
            }
            _ => return Err(OtaError::Config(format!("unknown config key {key:?}"))),
        }
        Ok(())
    }
}

fn require_url(key: &str, value: &str) -> Result<String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(value.to_owned())
    } else {
        Err(OtaError::Config(format!(
            "{key} must start with http:// or https://"
        )))
    }
}

#[derive(Clone)]
pub struct StorageManager {
    config_path: PathBuf,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::at(env::config_path())
    }

    pub fn at(config_path: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the saved config, falling back to defaults when none exists yet.
    pub async fn read_config(&self) -> Result<ConsoleConfig> {
        match fs::read(&self.config_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                OtaError::Config(format!(
                    "unable to parse {}: {e}",
                    self.config_path.display()
                ))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "storage: no config at {}, using defaults",
                    self.config_path.display()
                );
                Ok(ConsoleConfig::default())
            }
            Err(err) => Err(OtaError::Config(format!(
                "unable to read {}: {err}",
                self.config_path.display()
            ))),
        }
    }

    pub async fn write_config(&self, config: &ConsoleConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| OtaError::Config(format!("unable to create config dir: {e}")))?;
        }
        let body = serde_json::to_vec_pretty(config)
            .map_err(|e| OtaError::Config(format!("unable to encode config: {e}")))?;
        fs::write(&self.config_path, body)
            .await
            .map_err(|e| OtaError::Config(format!("unable to persist config: {e}")))?;
        info!("storage: config saved to {}", self.config_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("axe-console-test-{}-{name}", std::process::id()))
            .join("config.json")
    }

    #[tokio::test]
    async fn missing_config_yields_defaults() {
        let storage = StorageManager::at(scratch_path("missing"));
        let config = storage.read_config().await.unwrap();
        assert_eq!(config, ConsoleConfig::default());
    }

    #[tokio::test]
    async fn persists_and_reloads_config() {
        let path = scratch_path("roundtrip");
        let storage = StorageManager::at(&path);
        let mut config = ConsoleConfig::default();
        config.set("device_url", "http://10.0.0.42").unwrap();
        config.set("asset_relay", "https://corsproxy.io/?url=").unwrap();
        storage.write_config(&config).await.unwrap();

        let loaded = storage.read_config().await.unwrap();
        assert_eq!(loaded, config);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn malformed_config_is_an_error() {
        let path = scratch_path("malformed");
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(&path, b"{not json").unwrap();
        let result = StorageManager::at(&path).read_config().await;
        assert!(matches!(result, Err(OtaError::Config(_))));
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: ConsoleConfig =
            serde_json::from_str(r#"{"device_url":"http://bitaxe.local"}"#).unwrap();
        assert_eq!(config.device_url, "http://bitaxe.local");
        assert_eq!(config.release_feed_url, DEFAULT_RELEASE_FEED);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn validates_config_updates() {
        let mut config = ConsoleConfig::default();
        assert!(config.set("device_url", "bitaxe.local").is_err());
        assert!(config.set("request_timeout_secs", "0").is_err());
        assert!(config.set("colour", "blue").is_err());
        config.set("asset_relay", "https://relay/?u=").unwrap();
        config.set("asset_relay", "none").unwrap();
        assert_eq!(config.asset_relay, None);
        config.set("asset_relay", "default").unwrap();
        assert_eq!(config.asset_relay.as_deref(), Some(DEFAULT_RELAY_PREFIX));
        config.set("request_timeout_secs", "5").unwrap();
        assert_eq!(config.request_timeout_secs, 5);
    }
}
