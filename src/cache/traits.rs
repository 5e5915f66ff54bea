//! Core types for the caching system.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::client::{Reachability, Response};

/// A stored response plus the metadata the staleness check needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub response: Response,
  /// When the response was fetched
  pub stored_at: DateTime<Utc>,
  /// Network class at the time it was fetched
  pub reachability: Reachability,
}

impl CacheEntry {
  pub fn new(response: Response, reachability: Reachability) -> Self {
    Self {
      response,
      stored_at: Utc::now(),
      reachability,
    }
  }

  /// Age at `now`. Entries stamped in the future count as brand new.
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    (now - self.stored_at).to_std().unwrap_or(Duration::ZERO)
  }

  pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    self.age(now) <= max_age
  }
}

/// A read served through [`Cache::fetch`](super::Cache::fetch), tagged with
/// how the cache answered it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Fetch time of the entry that was served; `None` for live responses
  pub stored_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// A response that came back from the live call and was just stored.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      stored_at: None,
    }
  }
}

impl CacheResult<Response> {
  /// Serve a stored entry, keeping its fetch time.
  pub fn from_entry(entry: CacheEntry, source: CacheSource) -> Self {
    Self {
      data: entry.response,
      source,
      stored_at: Some(entry.stored_at),
    }
  }
}

/// Which branch of the read path produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// The live call succeeded
  Network,
  /// The entry was within the max age for the current reachability, so no
  /// request was made
  CacheFresh,
  /// The live call failed with a recoverable error and fallback served the
  /// entry regardless of age
  CacheStale,
  /// The client reported no reachability; the entry was served without
  /// attempting a request
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_freshness_boundary() {
    let now = Utc::now();
    let entry = CacheEntry {
      response: Response::default(),
      stored_at: now - chrono::Duration::seconds(60),
      reachability: Reachability::Wifi,
    };
    assert!(entry.is_fresh(now, Duration::from_secs(60)));
    assert!(!entry.is_fresh(now, Duration::from_secs(59)));
  }

  #[test]
  fn test_future_timestamps_are_fresh() {
    let now = Utc::now();
    let entry = CacheEntry {
      response: Response::default(),
      stored_at: now + chrono::Duration::seconds(5),
      reachability: Reachability::Wwan,
    };
    assert_eq!(entry.age(now), Duration::ZERO);
  }

  #[test]
  fn test_served_entry_keeps_fetch_time() {
    let stored_at = Utc::now() - chrono::Duration::seconds(90);
    let entry = CacheEntry {
      response: Response::default(),
      stored_at,
      reachability: Reachability::Wwan,
    };
    let served = CacheResult::from_entry(entry, CacheSource::CacheStale);
    assert_eq!(served.source, CacheSource::CacheStale);
    assert_eq!(served.stored_at, Some(stored_at));
    assert_eq!(CacheResult::from_network(Response::default()).stored_at, None);
  }
}
