//! End-to-end behaviour of contexts, the cache and the future engine through
//! the public API.

use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fauna::cache::{Cache, CacheEntry, RequestKey};
use fauna::context::{default_cache_size, default_config, set_default_cache_size, set_default_config};
use fauna::{
  join, sequence, ApiClient, Context, ContextConfig, Error, Future, Method, Outcome, Params,
  Reachability, Response,
};

/// Serializes tests that touch the process-wide defaults.
static GLOBALS: Mutex<()> = Mutex::new(());

/// Serves `users/1` and counts requests; fails every request when `down`.
struct Server {
  name: &'static str,
  gets: AtomicUsize,
  down: Mutex<bool>,
  current: Mutex<serde_json::Value>,
}

impl Server {
  fn new(name: &'static str) -> Arc<Self> {
    Arc::new(Self {
      name,
      gets: AtomicUsize::new(0),
      down: Mutex::new(false),
      current: Mutex::new(json!({ "ref": "users/1", "name": "live" })),
    })
  }

  fn gets(&self) -> usize {
    self.gets.load(Ordering::SeqCst)
  }
}

impl ApiClient for Server {
  fn request(
    &self,
    method: Method,
    _path: &str,
    params: &Params,
    _timeout: Duration,
    _trace_id: Option<&str>,
  ) -> Future<Response> {
    if *self.down.lock().unwrap() {
      return Future::error(Error::network("service unavailable"));
    }
    let mut current = self.current.lock().unwrap();
    match method {
      Method::Get => {
        self.gets.fetch_add(1, Ordering::SeqCst);
      }
      _ => {
        for (key, value) in params {
          current[key] = value.clone();
        }
      }
    }
    Future::value(Response::new(current.clone(), Default::default()))
  }

  fn reachability(&self) -> Reachability {
    Reachability::Wifi
  }

  fn auth_hash(&self) -> String {
    self.name.to_string()
  }

  fn api_root(&self) -> String {
    "test://fauna/".to_string()
  }

  fn can_masquerade(&self) -> bool {
    false
  }

  fn as_user(&self, user_ref: &str) -> fauna::Result<Arc<dyn ApiClient>> {
    Err(Error::MasqueradeNotPermitted(user_ref.to_string()))
  }
}

fn context(server: &Arc<Server>, config: ContextConfig) -> Context {
  Context::builder(server.clone())
    .config(config)
    .cache(Cache::in_memory(100).unwrap())
    .build()
    .unwrap()
}

fn seed(ctx: &Context, name: &str, age_secs: i64) {
  ctx
    .cache()
    .store_entry(
      &RequestKey::resource("users/1"),
      CacheEntry {
        response: Response::new(json!({ "ref": "users/1", "name": name }), Default::default()),
        stored_at: Utc::now() - chrono::Duration::seconds(age_secs),
        reachability: Reachability::Wifi,
      },
    )
    .unwrap();
}

#[test]
fn test_single_assignment() {
  let promise = fauna::Promise::new();
  let future = promise.future();
  promise.succeed(1).unwrap();
  assert_eq!(promise.succeed(2), Err(Error::AlreadyCompleted("succeed")));
  assert!(promise.fail(Error::network("late")).is_err());
  assert_eq!(future.get(), Ok(1));
}

#[test]
fn test_callback_after_terminal_does_not_rerun_producer() {
  let runs = Arc::new(AtomicUsize::new(0));
  let counter = runs.clone();
  let future = Future::in_background(move || {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok("done")
  });
  future.wait();

  let (tx, rx) = std::sync::mpsc::channel();
  future.on_success(move |value| tx.send(value).unwrap());
  assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "done");
  assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_flat_map_flattens() {
  let result = Future::value(5).flat_map(|x| Future::value(x * 2)).get();
  assert_eq!(result, Ok(10));
}

#[test]
fn test_sequence_fails_fast_and_join_collects() {
  let failure = Error::network("third");
  let inputs = || {
    vec![
      Future::value(1),
      Future::value(2),
      Future::error(failure.clone()),
    ]
  };

  assert_eq!(sequence(inputs()).get(), Err(failure.clone()));

  let outcomes = join(inputs()).get().unwrap();
  assert_eq!(
    outcomes,
    vec![
      Outcome::Success(1),
      Outcome::Success(2),
      Outcome::Failure(failure)
    ]
  );
}

#[test]
fn test_staleness_boundary() {
  let server = Server::new("boundary");
  let ctx = context(
    &server,
    ContextConfig::default().with_max_wifi_age(Duration::from_secs(60)),
  );

  seed(&ctx, "cached", 59);
  assert_eq!(ctx.get_resource("users/1").get().unwrap().resource["name"], "cached");
  assert_eq!(server.gets(), 0);

  seed(&ctx, "cached", 61);
  assert_eq!(ctx.get_resource("users/1").get().unwrap().resource["name"], "live");
  assert_eq!(server.gets(), 1);
}

#[test]
fn test_fallback_on_error() {
  let server = Server::new("fallback");
  *server.down.lock().unwrap() = true;

  let lenient = context(&server, ContextConfig::default().with_max_age(Duration::ZERO));
  seed(&lenient, "stale", 10);
  assert_eq!(
    lenient.get_resource("users/1").get().unwrap().resource["name"],
    "stale"
  );

  let strict = context(
    &server,
    ContextConfig::default()
      .with_max_age(Duration::ZERO)
      .with_fallback_on_error(false),
  );
  seed(&strict, "stale", 10);
  assert_eq!(
    strict.get_resource("users/1").get(),
    Err(Error::network("service unavailable"))
  );
}

#[test]
fn test_context_stack_restored_after_failure() {
  let _globals = GLOBALS.lock().unwrap_or_else(|e| e.into_inner());
  let outer = context(&Server::new("outer"), ContextConfig::default());
  let failing = context(&Server::new("failing"), ContextConfig::default());
  Context::set_default_context(outer.clone());

  let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
    failing.perform_in_context(|| panic!("block raised"));
  }));
  assert!(result.is_err());
  assert!(Context::current().unwrap().is_equivalent(&outer));

  let inner: fauna::Result<()> = failing.in_context(|| {
    assert!(Context::current().unwrap().is_equivalent(&failing));
    Err(Error::NoContext)
  });
  assert!(inner.is_err());
  assert!(Context::current().unwrap().is_equivalent(&outer));

  Context::clear_default_context();
}

#[test]
fn test_write_invalidates_fresh_entry() {
  let server = Server::new("writes");
  let ctx = context(&server, ContextConfig::default());
  seed(&ctx, "before", 0);

  let mut params = Params::new();
  params.insert("name".into(), json!("after"));
  ctx
    .in_context(|| fauna::put_resource("users/1", &params))
    .get()
    .unwrap();

  let read = ctx.get_resource("users/1").get().unwrap();
  assert_eq!(read.resource["name"], "after");
}

#[test]
fn test_process_defaults() {
  let _globals = GLOBALS.lock().unwrap_or_else(|e| e.into_inner());
  let original_config = default_config();
  let original_size = default_cache_size();

  let config = ContextConfig::default().with_timeout(Duration::from_secs(7));
  set_default_config(config);
  set_default_cache_size(12);
  assert_eq!(default_config(), config);
  assert_eq!(default_cache_size(), 12);

  let ctx = Context::builder(Server::new("defaults")).build().unwrap();
  assert_eq!(ctx.config().request_timeout(), Duration::from_secs(7));

  set_default_config(original_config);
  set_default_cache_size(original_size);
}

#[tokio::test]
async fn test_futures_can_be_awaited() {
  let server = Server::new("await");
  let ctx = context(&server, ContextConfig::default());
  let response = ctx.get_resource("users/1").await.unwrap();
  assert_eq!(response.resource["name"], "live");
}
