//! Per-context request settings and the process-wide defaults.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use crate::client::Reachability;

pub const DEFAULT_MAX_WIFI_AGE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_WWAN_AGE: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CACHE_SIZE: usize = 1000;

static DEFAULT_CONFIG: RwLock<Option<ContextConfig>> = RwLock::new(None);
static DEFAULT_CACHE_SIZE_SLOT: RwLock<Option<usize>> = RwLock::new(None);

/// Cache staleness, timeout and fallback settings for a context.
///
/// Values are immutable; the `with_*` methods return modified copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
  max_wifi_age: Duration,
  max_wwan_age: Duration,
  request_timeout: Duration,
  fallback_on_error: bool,
}

impl Default for ContextConfig {
  fn default() -> Self {
    Self::new(
      DEFAULT_MAX_WIFI_AGE,
      DEFAULT_MAX_WWAN_AGE,
      DEFAULT_REQUEST_TIMEOUT,
      true,
    )
  }
}

impl ContextConfig {
  pub fn new(
    max_wifi_age: Duration,
    max_wwan_age: Duration,
    request_timeout: Duration,
    fallback_on_error: bool,
  ) -> Self {
    Self {
      max_wifi_age,
      max_wwan_age,
      request_timeout,
      fallback_on_error,
    }
  }

  pub fn max_wifi_age(&self) -> Duration {
    self.max_wifi_age
  }

  pub fn max_wwan_age(&self) -> Duration {
    self.max_wwan_age
  }

  pub fn request_timeout(&self) -> Duration {
    self.request_timeout
  }

  pub fn fallback_on_error(&self) -> bool {
    self.fallback_on_error
  }

  /// Same max age on every network class.
  pub fn with_max_age(self, age: Duration) -> Self {
    Self {
      max_wifi_age: age,
      max_wwan_age: age,
      ..self
    }
  }

  pub fn with_max_wifi_age(self, age: Duration) -> Self {
    Self {
      max_wifi_age: age,
      ..self
    }
  }

  pub fn with_max_wwan_age(self, age: Duration) -> Self {
    Self {
      max_wwan_age: age,
      ..self
    }
  }

  pub fn with_timeout(self, timeout: Duration) -> Self {
    Self {
      request_timeout: timeout,
      ..self
    }
  }

  pub fn with_fallback_on_error(self, fallback: bool) -> Self {
    Self {
      fallback_on_error: fallback,
      ..self
    }
  }

  /// Oldest cached entry a read may use. `None` when offline: no live call is
  /// attempted and a cached entry of any age is served.
  pub fn max_age_for(&self, reachability: Reachability) -> Option<Duration> {
    match reachability {
      Reachability::Offline => None,
      Reachability::Wifi => Some(self.max_wifi_age),
      Reachability::Wwan => Some(self.max_wwan_age),
    }
  }
}

/// Config new contexts are created with unless given one explicitly.
pub fn default_config() -> ContextConfig {
  DEFAULT_CONFIG
    .read()
    .unwrap_or_else(PoisonError::into_inner)
    .unwrap_or_default()
}

pub fn set_default_config(config: ContextConfig) {
  *DEFAULT_CONFIG.write().unwrap_or_else(PoisonError::into_inner) = Some(config);
}

/// In-memory cache capacity new contexts are created with.
pub fn default_cache_size() -> usize {
  DEFAULT_CACHE_SIZE_SLOT
    .read()
    .unwrap_or_else(PoisonError::into_inner)
    .unwrap_or(DEFAULT_CACHE_SIZE)
}

pub fn set_default_cache_size(size: usize) {
  *DEFAULT_CACHE_SIZE_SLOT
    .write()
    .unwrap_or_else(PoisonError::into_inner) = Some(size);
}
