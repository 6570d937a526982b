use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::ResourceType;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin whose GET requests are intercepted (e.g. "https://app.example.com")
  pub origin: String,
  /// Path prefix marking API resources
  pub api_prefix: String,
  /// SQLite database path (defaults to $XDG_DATA_HOME/harbor/harbor.db)
  pub database: Option<PathBuf>,
  /// Directory for rolling log files; logs go to stderr when unset
  pub log_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost".to_string(),
      api_prefix: "/api/".to_string(),
      database: None,
      log_dir: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, every lookup misses and nothing is stored
  pub enabled: bool,
  /// Precache version; namespaces of other versions are dropped on activate
  pub version: u32,
  pub max_age: MaxAgeConfig,
  /// Upper bound on entries kept per runtime namespace
  pub max_entries: usize,
  /// URLs stored at install time
  pub precache: Vec<String>,
  /// URL of the page served when a document cannot be loaded
  pub offline_page: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      version: 1,
      max_age: MaxAgeConfig::default(),
      max_entries: 500,
      precache: Vec::new(),
      offline_page: "/offline.html".to_string(),
    }
  }
}

/// Max age per resource type, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MaxAgeConfig {
  pub page: u64,
  pub api: u64,
  pub asset: u64,
  pub image: u64,
}

impl Default for MaxAgeConfig {
  fn default() -> Self {
    const DAY: u64 = 24 * 60 * 60;
    Self {
      page: DAY,
      api: 5 * 60,
      asset: 30 * DAY,
      image: 7 * DAY,
    }
  }
}

impl MaxAgeConfig {
  pub fn for_type(&self, resource_type: ResourceType) -> chrono::Duration {
    let secs = match resource_type {
      ResourceType::Page => self.page,
      ResourceType::Api => self.api,
      ResourceType::Asset => self.asset,
      ResourceType::Image => self.image,
    };
    chrono::Duration::seconds(secs as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Attempts before an operation is dead-lettered
  pub max_retries: u32,
  /// Interval of the periodic wake registered when work is queued
  pub periodic_wake_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      periodic_wake_secs: 60,
    }
  }
}

impl SyncConfig {
  pub fn periodic_wake(&self) -> Duration {
    Duration::from_secs(self.periodic_wake_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: concat!("harbor/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./harbor.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/harbor/config.yaml
  ///
  /// Falls back to defaults when no file is found. `HARBOR_ORIGIN`
  /// overrides the configured origin.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(origin) = std::env::var("HARBOR_ORIGIN") {
      config.origin = origin;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("harbor.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("harbor").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Resolved database path.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("harbor").join("harbor.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_when_sections_missing() {
    let config = Config::from_yaml("origin: https://app.example.com\n").unwrap();
    assert_eq!(config.origin, "https://app.example.com");
    assert_eq!(config.api_prefix, "/api/");
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(
      config.cache.max_age.for_type(ResourceType::Asset),
      chrono::Duration::days(30)
    );
    assert_eq!(
      config.cache.max_age.for_type(ResourceType::Image),
      chrono::Duration::days(7)
    );
  }

  #[test]
  fn test_partial_max_age_override() {
    let yaml = "cache:\n  max_age:\n    api: 60\n  precache: [\"/\", \"/app.js\"]\n";
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(
      config.cache.max_age.for_type(ResourceType::Api),
      chrono::Duration::seconds(60)
    );
    assert_eq!(
      config.cache.max_age.for_type(ResourceType::Page),
      chrono::Duration::days(1)
    );
    assert_eq!(config.cache.precache.len(), 2);
  }

  #[test]
  fn test_explicit_missing_path_is_error() {
    let result = Config::load(Some(Path::new("/nonexistent/harbor.yaml")));
    assert!(result.is_err());
  }
}
