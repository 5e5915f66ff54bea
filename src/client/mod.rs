//! The API client boundary.
//!
//! Contexts only talk to the remote service through [`ApiClient`]. The crate
//! ships [`HttpClient`] for the real service; tests substitute their own
//! implementations.

mod credentials;
mod http;
#[cfg(test)]
pub(crate) mod mock;
mod types;

pub use credentials::Credentials;
pub use http::{HttpClient, API_BASE_URL, API_HOST, API_VERSION};
pub use types::{Method, Params, Reachability, Response};

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::future::Future;

/// Operations a context needs from the remote API.
pub trait ApiClient: Send + Sync {
  /// Issue a request. Implementations must complete the future with
  /// [`crate::Error::Timeout`] if `timeout` elapses.
  ///
  /// `trace_id` belongs to this request only; clients are shared between
  /// contexts with different trace ids.
  fn request(
    &self,
    method: Method,
    path: &str,
    params: &Params,
    timeout: Duration,
    trace_id: Option<&str>,
  ) -> Future<Response>;

  /// Current network reachability as seen by this client.
  fn reachability(&self) -> Reachability;

  /// Digest of the effective identity (credentials plus masquerade target).
  fn auth_hash(&self) -> String;

  /// Base URL every path is resolved against.
  fn api_root(&self) -> String;

  fn can_masquerade(&self) -> bool;

  /// A client acting as `user_ref`. Fails with
  /// [`crate::Error::MasqueradeNotPermitted`] when not allowed.
  fn as_user(&self, user_ref: &str) -> Result<Arc<dyn ApiClient>>;

  fn set_log_http_traffic(&self, _enabled: bool) {}

  fn get(&self, path: &str, params: &Params, timeout: Duration) -> Future<Response> {
    self.request(Method::Get, path, params, timeout, None)
  }

  fn post(&self, path: &str, params: &Params, timeout: Duration) -> Future<Response> {
    self.request(Method::Post, path, params, timeout, None)
  }

  fn put(&self, path: &str, params: &Params, timeout: Duration) -> Future<Response> {
    self.request(Method::Put, path, params, timeout, None)
  }

  fn delete(&self, path: &str, params: &Params, timeout: Duration) -> Future<Response> {
    self.request(Method::Delete, path, params, timeout, None)
  }

  /// Same API root and same effective identity.
  fn is_equal_to(&self, other: &dyn ApiClient) -> bool {
    self.api_root() == other.api_root() && self.auth_hash() == other.auth_hash()
  }
}
