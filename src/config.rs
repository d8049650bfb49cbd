use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use feedsync::cache::SqliteStorage;
use feedsync::sync::RefreshConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub refresh: RefreshConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub url: String,
  /// Signed-in account; feeds that need a viewer and the refresh
  /// coordinator stay idle without it
  pub viewer_id: Option<String>,
  /// Accounts still onboarding have no profile yet
  #[serde(default = "default_true")]
  pub has_profile: bool,
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/feedsync/cache.db)
  pub path: Option<PathBuf>,
}

impl CacheConfig {
  pub fn db_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path()
        .ok_or_else(|| eyre!("Could not determine data directory for the cache")),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Filter used when RUST_LOG is not set
  #[serde(default = "default_level")]
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

fn default_level() -> String {
  "info".to_string()
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feedsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/feedsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feedsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feedsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the API token from the environment, if any.
  ///
  /// Checks FEEDSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FEEDSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
