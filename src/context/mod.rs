//! Scoped execution contexts.
//!
//! A [`Context`] bundles an API client, a response cache and a
//! [`ContextConfig`]. Requests resolve their context with
//! [`Context::current`]: the innermost context entered on the running call
//! chain, then the process-wide default, then one built from `FAUNA_SECRET`.
//!
//! Entering a context attaches it to the call chain's [`Scope`], so futures
//! created inside [`Context::in_context`] keep resolving it from their
//! continuations, whichever thread those run on.

mod config;
mod requests;

pub use config::{
  default_cache_size, default_config, set_default_cache_size, set_default_config, ContextConfig,
  DEFAULT_CACHE_SIZE, DEFAULT_MAX_WIFI_AGE, DEFAULT_MAX_WWAN_AGE, DEFAULT_REQUEST_TIMEOUT,
};
pub use requests::{
  add_to_set, delete, delete_resource, get, get_creates_page, get_events_page, get_resource,
  get_updates_page, post, post_resource, put, put_resource, remove_from_set,
};

use std::future::Future as StdFuture;
use std::sync::{Arc, PoisonError, RwLock};

use crate::cache::Cache;
use crate::client::{ApiClient, Credentials, HttpClient};
use crate::error::{Error, Result};
use crate::future::scope::Scoped;
use crate::future::{Future, Scope};

/// Environment variable consulted when no context is active or set as default.
pub const SECRET_ENV: &str = "FAUNA_SECRET";

static DEFAULT_CONTEXT: RwLock<Option<Context>> = RwLock::new(None);

/// Marker stored in a [`Scope`] for an entered context.
struct Active(Context);

/// Client identity, cache and configuration for a chain of requests.
///
/// Cloning is cheap and clones share everything.
#[derive(Clone)]
pub struct Context {
  inner: Arc<Inner>,
}

struct Inner {
  client: Arc<dyn ApiClient>,
  cache: Cache,
  config: ContextConfig,
  trace_id: Option<String>,
  persistent: bool,
}

impl Context {
  /// Context authenticating with a key or user token.
  pub fn with_key(secret: &str) -> Result<Context> {
    Self::from_credentials(Credentials::Key(secret.to_string()))
  }

  /// Context holding a publisher key, which may masquerade as users.
  pub fn with_publisher_key(secret: &str) -> Result<Context> {
    Self::from_credentials(Credentials::PublisherKey(secret.to_string()))
  }

  /// Context acting as `user_ref` under a publisher key.
  pub fn with_key_as_user(publisher_key: &str, user_ref: &str) -> Result<Context> {
    Self::with_publisher_key(publisher_key)?.as_user(user_ref)
  }

  /// Resolve a publisher key from login details, then build a context for it.
  pub fn with_publisher_email(email: &str, password: &str) -> Future<Context> {
    HttpClient::publisher_key(email, password, default_config().request_timeout())
      .flat_map(|secret| match Context::with_publisher_key(&secret) {
        Ok(context) => Future::value(context),
        Err(e) => Future::error(e),
      })
  }

  fn from_credentials(credentials: Credentials) -> Result<Context> {
    let client = HttpClient::new(credentials)?;
    Self::builder(Arc::new(client)).persistent(true).build()
  }

  /// Builder for a context around an explicit client.
  pub fn builder(client: Arc<dyn ApiClient>) -> ContextBuilder {
    ContextBuilder {
      client,
      cache: None,
      config: None,
      trace_id: None,
      persistent: false,
    }
  }

  pub fn client(&self) -> &Arc<dyn ApiClient> {
    &self.inner.client
  }

  pub fn cache(&self) -> &Cache {
    &self.inner.cache
  }

  pub fn config(&self) -> ContextConfig {
    self.inner.config
  }

  pub fn trace_id(&self) -> Option<&str> {
    self.inner.trace_id.as_deref()
  }

  /// A context acting as `user_ref`, with its own cache.
  ///
  /// Fails with [`Error::MasqueradeNotPermitted`] unless this context's
  /// credentials allow masquerading.
  pub fn as_user(&self, user_ref: &str) -> Result<Context> {
    if !self.inner.client.can_masquerade() {
      return Err(Error::MasqueradeNotPermitted(format!(
        "cannot act as {} without a publisher key",
        user_ref
      )));
    }

    let client = self.inner.client.as_user(user_ref)?;
    let mut builder = Self::builder(client)
      .config(self.inner.config)
      .persistent(self.inner.persistent);
    if let Some(trace_id) = &self.inner.trace_id {
      builder = builder.trace_id(trace_id);
    }
    builder.build()
  }

  /// Same API root and same effective identity.
  pub fn is_equivalent(&self, other: &Context) -> bool {
    self.inner.client.is_equal_to(other.inner.client.as_ref())
  }

  pub fn set_log_http_traffic(&self, enabled: bool) {
    self.inner.client.set_log_http_traffic(enabled);
  }

  /// Drop every cached response for this context's identity.
  pub fn clear_cache(&self) -> Result<()> {
    self.inner.cache.clear()
  }

  /// The innermost entered context, else the default context, else one
  /// built from `FAUNA_SECRET` (which then becomes the default).
  pub fn current() -> Result<Context> {
    if let Some(Active(context)) = Scope::current().get::<Active>() {
      return Ok(context.clone());
    }
    if let Some(context) = Self::default_context() {
      return Ok(context);
    }
    Self::from_env()
  }

  fn from_env() -> Result<Context> {
    let secret = match std::env::var(SECRET_ENV) {
      Ok(secret) if !secret.is_empty() => secret,
      _ => return Err(Error::NoContext),
    };

    let mut slot = DEFAULT_CONTEXT
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    if let Some(context) = slot.as_ref() {
      return Ok(context.clone());
    }
    let context = Self::with_key(&secret)?;
    tracing::debug!("using default context from {}", SECRET_ENV);
    *slot = Some(context.clone());
    Ok(context)
  }

  pub fn default_context() -> Option<Context> {
    DEFAULT_CONTEXT
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn set_default_context(context: Context) {
    *DEFAULT_CONTEXT
      .write()
      .unwrap_or_else(PoisonError::into_inner) = Some(context);
  }

  pub fn clear_default_context() {
    *DEFAULT_CONTEXT
      .write()
      .unwrap_or_else(PoisonError::into_inner) = None;
  }

  /// Run `block` with this context entered. The previous context is restored
  /// on every exit path, including unwinding.
  pub fn in_context<R, F>(&self, block: F) -> R
  where
    F: FnOnce() -> R,
  {
    let _guard = Scope::current().with(Active(self.clone())).enter();
    block()
  }

  pub fn perform_in_context<F>(&self, block: F)
  where
    F: FnOnce(),
  {
    self.in_context(block)
  }

  /// Bind an async body to this context; it is entered on every poll.
  pub fn instrument<F: StdFuture>(&self, body: F) -> Scoped<F> {
    Scope::current().with(Active(self.clone())).instrument(body)
  }
}

impl std::fmt::Debug for Context {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Context")
      .field("api_root", &self.inner.client.api_root())
      .field("config", &self.inner.config)
      .field("trace_id", &self.inner.trace_id)
      .finish_non_exhaustive()
  }
}

/// Assembles a [`Context`]; see [`Context::builder`].
pub struct ContextBuilder {
  client: Arc<dyn ApiClient>,
  cache: Option<Cache>,
  config: Option<ContextConfig>,
  trace_id: Option<String>,
  persistent: bool,
}

impl ContextBuilder {
  /// Use an explicit cache instead of creating one.
  pub fn cache(mut self, cache: Cache) -> Self {
    self.cache = Some(cache);
    self
  }

  /// Defaults to [`default_config`] at build time.
  pub fn config(mut self, config: ContextConfig) -> Self {
    self.config = Some(config);
    self
  }

  /// Sent with every request made through the context.
  pub fn trace_id(mut self, trace_id: &str) -> Self {
    self.trace_id = Some(trace_id.to_string());
    self
  }

  /// Keep the created cache on disk, per identity, rather than in memory.
  pub fn persistent(mut self, persistent: bool) -> Self {
    self.persistent = persistent;
    self
  }

  pub fn build(self) -> Result<Context> {
    let cache = match self.cache {
      Some(cache) => cache,
      None => open_cache(self.client.as_ref(), self.persistent)?,
    };

    Ok(Context {
      inner: Arc::new(Inner {
        client: self.client,
        cache,
        config: self.config.unwrap_or_else(default_config),
        trace_id: self.trace_id,
        persistent: self.persistent,
      }),
    })
  }
}

fn open_cache(client: &dyn ApiClient, persistent: bool) -> Result<Cache> {
  let size = default_cache_size();
  if persistent {
    match Cache::persistent(&client.auth_hash(), size) {
      Ok(cache) => return Ok(cache),
      Err(e) => tracing::warn!(error = %e, "persistent cache unavailable, using memory"),
    }
  }
  Cache::in_memory(size)
}
