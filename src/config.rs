use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fauna::context::{
  ContextConfig, DEFAULT_CACHE_SIZE, DEFAULT_MAX_WIFI_AGE, DEFAULT_MAX_WWAN_AGE,
  DEFAULT_REQUEST_TIMEOUT,
};
use fauna::{Reachability, API_BASE_URL};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// API root every request path is resolved against
  pub api_root: String,
  pub cache: CacheConfig,
  pub request_timeout_secs: u64,
  /// Serve stale cached responses when a live request fails
  pub fallback_on_error: bool,
  /// Network class to report, e.g. `offline` to work from the cache only
  pub reachability: Reachability,
  /// Write logs here instead of stderr
  pub log_file: Option<PathBuf>,
  /// Log every request and response body
  pub log_http: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      api_root: API_BASE_URL.to_string(),
      cache: CacheConfig::default(),
      request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
      fallback_on_error: true,
      reachability: Reachability::Wifi,
      log_file: None,
      log_http: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Set to false to send every read to the network
  pub enabled: bool,
  pub max_wifi_age_secs: u64,
  pub max_wwan_age_secs: u64,
  /// Entries kept in memory in front of the on-disk store
  pub size: usize,
  /// Keep the cache on disk between runs
  pub persistent: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_wifi_age_secs: DEFAULT_MAX_WIFI_AGE.as_secs(),
      max_wwan_age_secs: DEFAULT_MAX_WWAN_AGE.as_secs(),
      size: DEFAULT_CACHE_SIZE,
      persistent: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fauna.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fauna/config.yaml
  ///
  /// Without a file every setting takes its default.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fauna.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fauna").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file deserializes as null rather than an empty mapping.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Settings for the contexts the CLI creates.
  pub fn context_config(&self) -> ContextConfig {
    ContextConfig::new(
      Duration::from_secs(self.cache.max_wifi_age_secs),
      Duration::from_secs(self.cache.max_wwan_age_secs),
      Duration::from_secs(self.request_timeout_secs),
      self.fallback_on_error,
    )
  }

  /// Get the API secret from the environment.
  ///
  /// Checks FAUNA_SECRET.
  pub fn get_secret() -> Result<String> {
    std::env::var(fauna::context::SECRET_ENV)
      .ok()
      .filter(|s| !s.is_empty())
      .ok_or_else(|| eyre!("Fauna secret not found. Set the FAUNA_SECRET environment variable."))
  }
}
