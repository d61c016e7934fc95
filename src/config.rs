use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::db::Database;
use crate::store::EMBEDDED_SECRET;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Company selected at startup (can be changed at runtime)
  pub company_id: Option<String>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub replay: ReplayConfig,
  #[serde(default)]
  pub install: InstallConfig,
  /// Record successful reads as GET audit entries in the transaction log
  #[serde(default)]
  pub audit_reads: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub url: String,
  /// Per-request timeout; a timeout counts as a network failure
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/shiftsync/offline.db)
  pub path: Option<PathBuf>,
  /// Secret the cache key is derived from (defaults to the embedded key)
  pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
  /// Stop replaying mutations the server rejected with a 4xx
  #[serde(default = "default_true")]
  pub quarantine_permanent: bool,
}

impl Default for ReplayConfig {
  fn default() -> Self {
    Self {
      quarantine_permanent: true,
    }
  }
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstallConfig {
  /// Also drop queued mutations when a reinstall is detected
  #[serde(default)]
  pub wipe_transactions: bool,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shiftsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shiftsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/shiftsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("shiftsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shiftsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.api.url.trim().is_empty() {
      return Err(eyre!("api.url must not be empty"));
    }
    Ok(config)
  }

  /// Bearer token for the API, from SHIFTSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("SHIFTSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  /// Secret the cache cipher is keyed from.
  ///
  /// Checks SHIFTSYNC_SECRET, then `storage.secret`, then falls back to the
  /// key embedded in the binary.
  pub fn secret(&self) -> String {
    std::env::var("SHIFTSYNC_SECRET")
      .ok()
      .filter(|s| !s.is_empty())
      .or_else(|| self.storage.secret.clone())
      .unwrap_or_else(|| EMBEDDED_SECRET.to_string())
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Database::default_path().ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }
}
