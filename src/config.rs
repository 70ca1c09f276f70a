use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AppError, Result};

const APP_DIR: &str = "annotated-reader";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

/// Signed-in identity. Absent `user_id` keeps the library on the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub user_id: Option<String>,
    pub jwt: Option<String>,

    #[serde(default = "default_api_host")]
    pub api_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval")]
    pub interval_minutes: u32,

    #[serde(default = "default_upload_debounce")]
    pub upload_debounce_secs: u64,

    #[serde(default = "default_download_cap")]
    pub download_cap: usize,

    #[serde(default = "default_hypothesis_api_url")]
    pub hypothesis_api_url: String,

    #[serde(default = "default_pocket_proxy_url")]
    pub pocket_proxy_url: String,
}

fn data_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR);
    std::fs::create_dir_all(&data_dir).ok();
    data_dir
}

fn default_db_path() -> String {
    data_dir().join("library.db").to_string_lossy().to_string()
}

fn default_socket_path() -> String {
    data_dir().join("library.sock").to_string_lossy().to_string()
}

fn default_api_host() -> String {
    "https://library.lindylearn.io".to_string()
}

fn default_sync_interval() -> u32 {
    30
}

fn default_upload_debounce() -> u64 {
    10
}

fn default_download_cap() -> usize {
    10_000
}

fn default_hypothesis_api_url() -> String {
    "https://api.hypothes.is/api".to_string()
}

fn default_pocket_proxy_url() -> String {
    "https://library.lindylearn.io".to_string()
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            jwt: None,
            api_host: default_api_host(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_sync_interval(),
            upload_debounce_secs: default_upload_debounce(),
            download_cap: default_download_cap(),
            hypothesis_api_url: default_hypothesis_api_url(),
            pocket_proxy_url: default_pocket_proxy_url(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            socket_path: default_socket_path(),
            account: AccountConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Identity and token, only when both are configured.
    pub fn signed_in_user(&self) -> Option<(String, String)> {
        match (&self.account.user_id, &self.account.jwt) {
            (Some(user), Some(jwt)) if !user.is_empty() => Some((user.clone(), jwt.clone())),
            _ => None,
        }
    }
}
