use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Immutable daemon configuration, constructed once at start-up and passed
/// explicitly into every component. Nothing reads configuration from ambient
/// process-wide state.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub data_dir: String,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default)]
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub github_repo: String,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            github_repo: String::new(),
            check_interval_secs: default_check_interval_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            token_env: default_token_env(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "listen field is required".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.data_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "data_dir field is required".to_string(),
            ));
        }
        if self.metrics_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "metrics_interval_secs must be >= 1".to_string(),
            ));
        }

        validate_update(&self.update)?;

        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("metrics.db")
    }

    pub fn archive_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("archive.jsonl.gz")
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_update(cfg: &UpdateConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    let mut parts = cfg.github_repo.split('/');
    let owner = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();
    if owner.trim().is_empty() || name.trim().is_empty() || parts.next().is_some() {
        return Err(ConfigError::Validation(
            "update.github_repo must be shaped owner/name when updates are enabled".to_string(),
        ));
    }
    if cfg.check_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "update.check_interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.download_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "update.download_timeout_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

const fn default_metrics_interval_secs() -> u64 {
    5
}

const fn default_check_interval_secs() -> u64 {
    3600
}

const fn default_download_timeout_secs() -> u64 {
    30
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
