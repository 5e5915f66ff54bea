//! Cache layer that decides between cached and live responses.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::key::{normalize_path, Fingerprint, RequestKey};
use super::storage::{CacheStorage, NoopStorage, SqliteStorage};
use super::traits::{CacheEntry, CacheResult, CacheSource};
use crate::client::{Method, Reachability, Response};
use crate::error::{Error, Result};
use crate::future::{Future, Outcome};

/// How a single read should treat cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
  /// Network class reported by the client right now
  pub reachability: Reachability,
  /// Oldest acceptable entry; `None` when offline (any age is served and no
  /// live call is made)
  pub max_age: Option<Duration>,
  /// Serve any cached entry when the live call fails
  pub fallback_on_error: bool,
}

/// Response cache shared by every request issued through a context.
///
/// Entries live in a [`CacheStorage`] backend (SQLite by default) with a
/// bounded in-memory tier in front of it. Entries are never expired by age;
/// age only decides whether a read may use them.
#[derive(Clone)]
pub struct Cache {
  storage: Arc<dyn CacheStorage>,
  memory: Arc<Mutex<MemoryTier>>,
}

impl Cache {
  /// Create a cache over `storage`, keeping up to `capacity` entries in memory.
  pub fn new<S: CacheStorage + 'static>(storage: S, capacity: usize) -> Self {
    Self {
      storage: Arc::new(storage),
      memory: Arc::new(Mutex::new(MemoryTier::new(capacity))),
    }
  }

  /// A cache backed by a private in-memory database.
  pub fn in_memory(capacity: usize) -> Result<Self> {
    Ok(Self::new(SqliteStorage::in_memory()?, capacity))
  }

  /// The on-disk cache for an identity hash.
  pub fn persistent(identity: &str, capacity: usize) -> Result<Self> {
    Ok(Self::new(SqliteStorage::open_default(identity)?, capacity))
  }

  /// A cache that never stores anything.
  pub fn disabled() -> Self {
    Self::new(NoopStorage, 0)
  }

  /// Look up an entry. Store failures are logged and read as a miss.
  pub fn lookup(&self, key: &RequestKey) -> Option<CacheEntry> {
    let fingerprint = key.fingerprint();
    // The memory lock is held across the store read so an invalidation cannot
    // land between reading an entry and promoting it.
    let mut memory = self.memory();
    if let Some(entry) = memory.get(&fingerprint) {
      return Some(entry);
    }

    match self.storage.get(&fingerprint) {
      Ok(Some(entry)) => {
        memory.insert(fingerprint, key.path(), entry.clone());
        Some(entry)
      }
      Ok(None) => None,
      Err(e) => {
        tracing::warn!(request = %key.description(), error = %e, "cache read failed");
        None
      }
    }
  }

  /// Store a freshly fetched response.
  pub fn store(&self, key: &RequestKey, response: &Response, reachability: Reachability) -> Result<()> {
    self.store_entry(key, CacheEntry::new(response.clone(), reachability))
  }

  /// Store an entry with explicit metadata, replacing any previous one.
  pub fn store_entry(&self, key: &RequestKey, entry: CacheEntry) -> Result<()> {
    let fingerprint = key.fingerprint();
    let mut memory = self.memory();
    // Drop the memory copy first so a failed write never leaves it ahead of the store.
    memory.remove(&fingerprint);
    self.storage.put(&fingerprint, key.path(), &entry)?;
    memory.insert(fingerprint, key.path(), entry);
    Ok(())
  }

  /// Drop every entry for `path`, whatever its parameters.
  pub fn invalidate_path(&self, path: &str) -> Result<usize> {
    let path = normalize_path(path);
    let mut memory = self.memory();
    memory.remove_path(&path);
    self.storage.remove_path(&path)
  }

  pub fn clear(&self) -> Result<()> {
    let mut memory = self.memory();
    memory.clear();
    self.storage.clear()
  }

  /// Lock order is always memory tier, then storage.
  fn memory(&self) -> std::sync::MutexGuard<'_, MemoryTier> {
    self.memory.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Serve a read according to `policy`.
  ///
  /// 1. Offline: return the cached entry of any age, never calling `live`
  /// 2. Cached and within max age: return it without calling `live`
  /// 3. Otherwise call `live`; store the response on success
  /// 4. On failure, return any cached entry if the policy allows fallback
  pub fn fetch<F>(&self, key: &RequestKey, policy: FetchPolicy, live: F) -> Future<CacheResult<Response>>
  where
    F: FnOnce() -> Future<Response>,
  {
    let cached = self.lookup(key);

    let Some(max_age) = policy.max_age else {
      return match cached {
        Some(entry) => {
          tracing::debug!(request = %key.description(), "offline, serving cache");
          Future::value(CacheResult::from_entry(entry, CacheSource::Offline))
        }
        None => Future::error(Error::Offline(key.description())),
      };
    };

    if let Some(entry) = &cached {
      if entry.is_fresh(Utc::now(), max_age) {
        tracing::debug!(request = %key.description(), "cache hit");
        return Future::value(CacheResult::from_entry(entry.clone(), CacheSource::CacheFresh));
      }
    }

    tracing::debug!(
      request = %key.description(),
      stale = cached.is_some(),
      "fetching live"
    );

    let cache = self.clone();
    let key = key.clone();
    live().transform(move |outcome| match outcome {
      Outcome::Success(response) => {
        if let Err(e) = cache.store(&key, &response, policy.reachability) {
          tracing::warn!(request = %key.description(), error = %e, "failed to cache response");
        }
        Future::value(CacheResult::from_network(response))
      }
      Outcome::Failure(error) => match cached {
        Some(entry) if policy.fallback_on_error && error.is_recoverable_from_cache() => {
          tracing::warn!(
            request = %key.description(),
            error = %error,
            "live fetch failed, serving stale cache"
          );
          Future::value(CacheResult::from_entry(entry, CacheSource::CacheStale))
        }
        _ => Future::error(error),
      },
      Outcome::Cancelled => Future::cancelled(),
    })
  }

  /// Perform a write and invalidate what it superseded.
  ///
  /// After `live` succeeds every entry under `path` is dropped and, unless the
  /// write was a delete, the returned resource is stored under its own ref.
  /// Invalidation failures fail the returned future with
  /// [`Error::CacheStore`], since later reads could otherwise see old data.
  pub fn write<F>(&self, method: Method, path: &str, reachability: Reachability, live: F) -> Future<Response>
  where
    F: FnOnce() -> Future<Response>,
  {
    let cache = self.clone();
    let path = normalize_path(path);
    live().transform(move |outcome| match outcome {
      Outcome::Success(response) => {
        match cache.invalidate_after_write(method, &path, &response, reachability) {
          Ok(()) => Future::value(response),
          Err(e) => {
            tracing::error!(path = %path, error = %e, "cache invalidation after write failed");
            Future::error(e)
          }
        }
      }
      Outcome::Failure(error) => Future::error(error),
      Outcome::Cancelled => Future::cancelled(),
    })
  }

  fn invalidate_after_write(
    &self,
    method: Method,
    path: &str,
    response: &Response,
    reachability: Reachability,
  ) -> Result<()> {
    self.invalidate_path(path)?;

    let Some(resource_ref) = response.resource_ref().map(normalize_path) else {
      return Ok(());
    };
    if resource_ref != path {
      self.invalidate_path(&resource_ref)?;
    }
    if method != Method::Delete {
      self.store(&RequestKey::resource(&resource_ref), response, reachability)?;
    }
    Ok(())
  }
}

/// Bounded map of recently used entries.
struct MemoryTier {
  capacity: usize,
  tick: u64,
  entries: HashMap<Fingerprint, (String, CacheEntry, u64)>,
}

impl MemoryTier {
  fn new(capacity: usize) -> Self {
    Self {
      capacity,
      tick: 0,
      entries: HashMap::new(),
    }
  }

  fn get(&mut self, key: &Fingerprint) -> Option<CacheEntry> {
    self.tick += 1;
    let tick = self.tick;
    self.entries.get_mut(key).map(|(_, entry, used)| {
      *used = tick;
      entry.clone()
    })
  }

  fn insert(&mut self, key: Fingerprint, path: &str, entry: CacheEntry) {
    if self.capacity == 0 {
      return;
    }
    self.tick += 1;
    self.entries.insert(key, (path.to_string(), entry, self.tick));
    while self.entries.len() > self.capacity {
      let oldest = self
        .entries
        .iter()
        .min_by_key(|(_, (_, _, used))| *used)
        .map(|(k, _)| k.clone());
      match oldest {
        Some(k) => {
          self.entries.remove(&k);
        }
        None => break,
      }
    }
  }

  fn remove(&mut self, key: &Fingerprint) {
    self.entries.remove(key);
  }

  fn remove_path(&mut self, path: &str) {
    self.entries.retain(|_, (entry_path, _, _)| entry_path != path);
  }

  fn clear(&mut self) {
    self.entries.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::future::Promise;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::mpsc;

  fn response(name: &str) -> Response {
    Response::new(json!({ "ref": "users/1", "name": name }), Default::default())
  }

  fn aged(name: &str, secs: i64) -> CacheEntry {
    CacheEntry {
      response: response(name),
      stored_at: Utc::now() - chrono::Duration::seconds(secs),
      reachability: Reachability::Wifi,
    }
  }

  fn wifi(max_age: u64, fallback_on_error: bool) -> FetchPolicy {
    FetchPolicy {
      reachability: Reachability::Wifi,
      max_age: Some(Duration::from_secs(max_age)),
      fallback_on_error,
    }
  }

  struct Live {
    calls: Arc<AtomicUsize>,
  }

  impl Live {
    fn new() -> Self {
      Self {
        calls: Arc::new(AtomicUsize::new(0)),
      }
    }

    fn ok(&self, name: &'static str) -> impl FnOnce() -> Future<Response> {
      let calls = Arc::clone(&self.calls);
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Future::value(response(name))
      }
    }

    fn fail(&self) -> impl FnOnce() -> Future<Response> {
      let calls = Arc::clone(&self.calls);
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Future::error(Error::network("connection reset"))
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  fn key() -> RequestKey {
    RequestKey::resource("users/1")
  }

  #[test]
  fn test_fresh_entry_skips_network() {
    let cache = Cache::in_memory(10).unwrap();
    cache.store_entry(&key(), aged("cached", 59)).unwrap();
    let live = Live::new();

    let result = cache.fetch(&key(), wifi(60, true), live.ok("live")).get().unwrap();
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data.resource["name"], "cached");
    assert_eq!(live.calls(), 0);
  }

  #[test]
  fn test_stale_entry_goes_live_and_refreshes() {
    let cache = Cache::in_memory(10).unwrap();
    cache.store_entry(&key(), aged("cached", 61)).unwrap();
    let live = Live::new();

    let result = cache.fetch(&key(), wifi(60, true), live.ok("live")).get().unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.resource["name"], "live");
    assert_eq!(live.calls(), 1);

    let stored = cache.lookup(&key()).unwrap();
    assert_eq!(stored.response.resource["name"], "live");
    assert!(stored.is_fresh(Utc::now(), Duration::from_secs(5)));
  }

  #[test]
  fn test_fallback_on_error() {
    let cache = Cache::in_memory(10).unwrap();
    cache.store_entry(&key(), aged("stale", 3600)).unwrap();
    let live = Live::new();

    let result = cache.fetch(&key(), wifi(60, true), live.fail()).get().unwrap();
    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.resource["name"], "stale");

    let failed = cache.fetch(&key(), wifi(60, false), live.fail()).get();
    assert_eq!(failed, Err(Error::network("connection reset")));
    assert_eq!(live.calls(), 2);
  }

  #[test]
  fn test_miss_with_failure_propagates() {
    let cache = Cache::in_memory(10).unwrap();
    let live = Live::new();
    let failed = cache.fetch(&key(), wifi(60, true), live.fail()).get();
    assert_eq!(failed, Err(Error::network("connection reset")));
  }

  #[test]
  fn test_offline_serves_any_age_without_network() {
    let cache = Cache::in_memory(10).unwrap();
    let live = Live::new();
    let offline = FetchPolicy {
      reachability: Reachability::Offline,
      max_age: None,
      fallback_on_error: false,
    };

    let missing = cache.fetch(&key(), offline, live.ok("live")).get();
    assert_eq!(missing, Err(Error::Offline("users/1".to_string())));

    cache.store_entry(&key(), aged("ancient", 86_400)).unwrap();
    let result = cache.fetch(&key(), offline, live.ok("live")).get().unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.resource["name"], "ancient");
    assert_eq!(live.calls(), 0);
  }

  #[test]
  fn test_timed_out_fetch_leaves_entry_untouched() {
    let cache = Cache::in_memory(10).unwrap();
    cache.store_entry(&key(), aged("before", 3600)).unwrap();
    let never: Promise<Response> = Promise::new();
    let pending = never.future();

    let result = cache
      .fetch(&key(), wifi(60, false), move || {
        pending.within(Duration::from_millis(20))
      })
      .get();
    assert_eq!(result, Err(Error::Timeout(Duration::from_millis(20))));
    assert_eq!(
      cache.lookup(&key()).unwrap().response.resource["name"],
      "before"
    );
  }

  #[test]
  fn test_write_replaces_cached_resource() {
    let cache = Cache::in_memory(10).unwrap();
    cache.store_entry(&key(), aged("before", 1)).unwrap();

    let written = cache
      .write(Method::Put, "users/1", Reachability::Wifi, || {
        Future::value(response("after"))
      })
      .get()
      .unwrap();
    assert_eq!(written.resource["name"], "after");

    let live = Live::new();
    let read = cache.fetch(&key(), wifi(60, true), live.ok("live")).get().unwrap();
    assert_eq!(read.data.resource["name"], "after");
    assert_eq!(live.calls(), 0);
  }

  #[test]
  fn test_delete_drops_cached_resource() {
    let cache = Cache::in_memory(10).unwrap();
    cache.store_entry(&key(), aged("before", 1)).unwrap();

    cache
      .write(Method::Delete, "users/1", Reachability::Wifi, || {
        Future::value(Response::default())
      })
      .get()
      .unwrap();
    assert!(cache.lookup(&key()).is_none());
  }

  #[test]
  fn test_failed_write_keeps_cache() {
    let cache = Cache::in_memory(10).unwrap();
    cache.store_entry(&key(), aged("before", 1)).unwrap();
    let result = cache
      .write(Method::Put, "users/1", Reachability::Wifi, || {
        Future::error(Error::network("rejected"))
      })
      .get();
    assert!(result.is_err());
    assert!(cache.lookup(&key()).is_some());
  }

  #[test]
  fn test_invalidation_failure_is_surfaced() {
    let closed = Cache::new(ClosedStorage, 10);
    let result = closed
      .write(Method::Put, "users/1", Reachability::Wifi, || {
        Future::value(response("after"))
      })
      .get();
    assert!(matches!(result, Err(Error::CacheStore(_))));
  }

  struct ClosedStorage;

  impl CacheStorage for ClosedStorage {
    fn get(&self, _key: &Fingerprint) -> Result<Option<CacheEntry>> {
      Err(Error::CacheStore("disk I/O error".into()))
    }
    fn put(&self, _key: &Fingerprint, _path: &str, _entry: &CacheEntry) -> Result<()> {
      Err(Error::CacheStore("disk I/O error".into()))
    }
    fn remove_path(&self, _path: &str) -> Result<usize> {
      Err(Error::CacheStore("disk I/O error".into()))
    }
    fn clear(&self) -> Result<()> {
      Err(Error::CacheStore("disk I/O error".into()))
    }
  }

  #[test]
  fn test_read_failures_fall_through_to_live() {
    let cache = Cache::new(ClosedStorage, 0);
    let live = Live::new();
    let result = cache.fetch(&key(), wifi(60, true), live.ok("live")).get().unwrap();
    assert_eq!(result.data.resource["name"], "live");
    assert_eq!(live.calls(), 1);
  }

  /// Wraps a store so the first `get` parks until the test releases it.
  struct Gated {
    inner: SqliteStorage,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<Option<mpsc::Receiver<()>>>,
  }

  impl CacheStorage for Gated {
    fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
      let entry = self.inner.get(key);
      if let Some(entered) = self.entered.lock().unwrap().take() {
        entered.send(()).unwrap();
        let release = self.release.lock().unwrap().take().unwrap();
        release.recv_timeout(Duration::from_secs(5)).unwrap();
      }
      entry
    }
    fn put(&self, key: &Fingerprint, path: &str, entry: &CacheEntry) -> Result<()> {
      self.inner.put(key, path, entry)
    }
    fn remove_path(&self, path: &str) -> Result<usize> {
      self.inner.remove_path(path)
    }
    fn clear(&self) -> Result<()> {
      self.inner.clear()
    }
  }

  #[test]
  fn test_write_during_store_read_is_not_undone() {
    let inner = SqliteStorage::in_memory().unwrap();
    inner.put(&key().fingerprint(), key().path(), &aged("before", 1)).unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let cache = Cache::new(
      Gated {
        inner,
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(Some(release_rx)),
      },
      10,
    );

    let reading = cache.clone();
    let reader = std::thread::spawn(move || reading.lookup(&key()));
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let writing = cache.clone();
    let writer = std::thread::spawn(move || {
      writing
        .write(Method::Put, "users/1", Reachability::Wifi, || {
          Future::value(response("after"))
        })
        .get()
    });
    std::thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();

    let read = reader.join().unwrap().unwrap();
    assert_eq!(read.response.resource["name"], "before");
    writer.join().unwrap().unwrap();
    assert_eq!(cache.lookup(&key()).unwrap().response.resource["name"], "after");
  }

  #[test]
  fn test_disabled_cache_always_goes_live() {
    let cache = Cache::disabled();
    let live = Live::new();
    cache.store_entry(&key(), aged("cached", 0)).unwrap();

    let result = cache.fetch(&key(), wifi(60, true), live.ok("live")).get().unwrap();
    assert_eq!(result.source, CacheSource::Network);
    let again = cache.fetch(&key(), wifi(60, true), live.ok("live")).get().unwrap();
    assert_eq!(again.source, CacheSource::Network);
    assert_eq!(live.calls(), 2);
    assert!(cache.lookup(&key()).is_none());
  }

  #[test]
  fn test_memory_tier_is_bounded() {
    let mut tier = MemoryTier::new(2);
    let a = RequestKey::resource("a").fingerprint();
    let b = RequestKey::resource("b").fingerprint();
    let c = RequestKey::resource("c").fingerprint();
    tier.insert(a.clone(), "a", aged("a", 0));
    tier.insert(b.clone(), "b", aged("b", 0));
    tier.get(&a);
    tier.insert(c.clone(), "c", aged("c", 0));

    assert!(tier.get(&a).is_some());
    assert!(tier.get(&b).is_none());
    assert!(tier.get(&c).is_some());
  }
}
