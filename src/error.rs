//! Error taxonomy shared by every layer of the client runtime.

use std::time::Duration;

/// Errors produced by futures, contexts, the cache and the HTTP client.
///
/// Outcomes are delivered to every observer of a future, so the type is
/// `Clone` and carries only owned text rather than boxed sources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
  /// A future was completed with an empty value or error.
  #[error("invalid future value: {0}")]
  InvalidFutureValue(String),

  /// A second completion was attempted on a terminal future.
  #[error("future already completed ({0})")]
  AlreadyCompleted(&'static str),

  /// `as_user` on a context whose credentials cannot masquerade.
  #[error("masquerade not permitted: {0}")]
  MasqueradeNotPermitted(String),

  /// Transport failure or an error status from the API.
  #[error("network failure{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
  Network {
    status: Option<u16>,
    message: String,
  },

  /// The request did not complete within its timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// The client reported no reachability and nothing was cached.
  #[error("offline and no cached response for {0}")]
  Offline(String),

  /// The cache's backing store reported an error.
  #[error("cache store failure: {0}")]
  CacheStore(String),

  /// The row store was used after `close`.
  #[error("row store is closed")]
  StoreClosed,

  /// Terminal state of a future whose producer honored a cancellation.
  #[error("operation cancelled")]
  Cancelled,

  /// Work could not be handed to the background runtime or main executor.
  #[error("dispatch failed: {0}")]
  Dispatch(String),

  /// No active context, no default context and no `FAUNA_SECRET`.
  #[error("no current context: set a default context or FAUNA_SECRET")]
  NoContext,

  #[error("configuration error: {0}")]
  Config(String),

  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl Error {
  /// Build a network error from a transport message.
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network {
      status: None,
      message: message.into(),
    }
  }

  /// Whether a stale cached value may stand in for this failure.
  pub fn is_recoverable_from_cache(&self) -> bool {
    matches!(
      self,
      Self::Network { .. } | Self::Timeout(_) | Self::Offline(_)
    )
  }

  pub(crate) fn is_empty(&self) -> bool {
    match self {
      Self::InvalidFutureValue(m)
      | Self::MasqueradeNotPermitted(m)
      | Self::Offline(m)
      | Self::CacheStore(m)
      | Self::Config(m)
      | Self::Dispatch(m)
      | Self::Decode(m) => m.trim().is_empty(),
      Self::Network { message, status } => status.is_none() && message.trim().is_empty(),
      _ => false,
    }
  }
}

impl From<rusqlite::Error> for Error {
  fn from(err: rusqlite::Error) -> Self {
    Self::CacheStore(err.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Self::Decode(err.to_string())
  }
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    Self::Network {
      status: err.status().map(|s| s.as_u16()),
      message: err.to_string(),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
