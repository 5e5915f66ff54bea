//! Request surface of a context, plus free functions that use
//! [`Context::current`].

use std::sync::Arc;

use super::Context;
use crate::cache::{normalize_path, CacheResult, FetchPolicy, RequestKey};
use crate::client::{Method, Params, Response};
use crate::future::Future;

impl Context {
  /// Read through the cache, reporting where the response came from.
  pub fn fetch(&self, path: &str, params: &Params) -> Future<CacheResult<Response>> {
    let key = RequestKey::new(path, params.clone());
    let config = self.config();
    let reachability = self.client().reachability();
    let policy = FetchPolicy {
      reachability,
      max_age: config.max_age_for(reachability),
      fallback_on_error: config.fallback_on_error(),
    };

    let client = Arc::clone(self.client());
    let timeout = config.request_timeout();
    self.in_context(|| {
      self.cache().fetch(&key, policy, || {
        client
          .request(Method::Get, key.path(), key.params(), timeout, self.trace_id())
          .within(timeout)
      })
    })
  }

  pub fn get(&self, path: &str, params: &Params) -> Future<Response> {
    self.fetch(path, params).map(|result| result.data)
  }

  pub fn post(&self, path: &str, params: &Params) -> Future<Response> {
    self.write(Method::Post, path, params)
  }

  pub fn put(&self, path: &str, params: &Params) -> Future<Response> {
    self.write(Method::Put, path, params)
  }

  pub fn delete(&self, path: &str, params: &Params) -> Future<Response> {
    self.write(Method::Delete, path, params)
  }

  fn write(&self, method: Method, path: &str, params: &Params) -> Future<Response> {
    let client = Arc::clone(self.client());
    let timeout = self.config().request_timeout();
    let reachability = client.reachability();
    let target = normalize_path(path);
    self.in_context(|| {
      self.cache().write(method, &target, reachability, || {
        client
          .request(method, &target, params, timeout, self.trace_id())
          .within(timeout)
      })
    })
  }

  pub fn get_resource(&self, path: &str) -> Future<Response> {
    self.get(path, &Params::new())
  }

  pub fn post_resource(&self, path: &str, params: &Params) -> Future<Response> {
    self.post(path, params)
  }

  pub fn put_resource(&self, path: &str, params: &Params) -> Future<Response> {
    self.put(path, params)
  }

  pub fn delete_resource(&self, path: &str) -> Future<Response> {
    self.delete(path, &Params::new())
  }

  /// A page of the event set at `path`.
  pub fn get_events_page(&self, path: &str, params: &Params) -> Future<Response> {
    self.get(&page_path(path, "events"), params)
  }

  pub fn get_creates_page(&self, path: &str, params: &Params) -> Future<Response> {
    self.get(&page_path(path, "creates"), params)
  }

  pub fn get_updates_page(&self, path: &str, params: &Params) -> Future<Response> {
    self.get(&page_path(path, "updates"), params)
  }

  /// Add `resource` to the custom set at `path`.
  pub fn add_to_set(&self, path: &str, resource: &str) -> Future<Response> {
    self.set_write(Method::Put, path, resource)
  }

  pub fn remove_from_set(&self, path: &str, resource: &str) -> Future<Response> {
    self.set_write(Method::Delete, path, resource)
  }

  /// Membership changes also make cached pages of the set stale.
  fn set_write(&self, method: Method, path: &str, resource: &str) -> Future<Response> {
    let set = normalize_path(path);
    let member = format!("{}/{}", set, normalize_path(resource));
    let cache = self.cache().clone();

    self
      .write(method, &member, &Params::new())
      .flat_map(move |response| {
        let stale = [
          set.clone(),
          page_path(&set, "events"),
          page_path(&set, "creates"),
          page_path(&set, "updates"),
        ];
        for path in &stale {
          if let Err(e) = cache.invalidate_path(path) {
            tracing::error!(path = %path, error = %e, "cache invalidation after set change failed");
            return Future::error(e);
          }
        }
        Future::value(response)
      })
  }
}

fn page_path(path: &str, page: &str) -> String {
  format!("{}/{}", normalize_path(path), page)
}

/// Run `request` against the current context, or fail with its resolution error.
fn with_current<F>(request: F) -> Future<Response>
where
  F: FnOnce(&Context) -> Future<Response>,
{
  match Context::current() {
    Ok(context) => request(&context),
    Err(e) => Future::error(e),
  }
}

pub fn get(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.get(path, params))
}

pub fn post(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.post(path, params))
}

pub fn put(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.put(path, params))
}

pub fn delete(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.delete(path, params))
}

pub fn get_resource(path: &str) -> Future<Response> {
  with_current(|ctx| ctx.get_resource(path))
}

pub fn post_resource(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.post_resource(path, params))
}

pub fn put_resource(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.put_resource(path, params))
}

pub fn delete_resource(path: &str) -> Future<Response> {
  with_current(|ctx| ctx.delete_resource(path))
}

pub fn get_events_page(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.get_events_page(path, params))
}

pub fn get_creates_page(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.get_creates_page(path, params))
}

pub fn get_updates_page(path: &str, params: &Params) -> Future<Response> {
  with_current(|ctx| ctx.get_updates_page(path, params))
}

pub fn add_to_set(path: &str, resource: &str) -> Future<Response> {
  with_current(|ctx| ctx.add_to_set(path, resource))
}

pub fn remove_from_set(path: &str, resource: &str) -> Future<Response> {
  with_current(|ctx| ctx.remove_from_set(path, resource))
}
