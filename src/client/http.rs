//! reqwest-backed implementation of [`ApiClient`].

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use super::{ApiClient, Credentials, Method, Params, Reachability, Response};
use crate::error::{Error, Result};
use crate::future::Future;

pub const API_HOST: &str = "rest.fauna.org";
pub const API_VERSION: &str = "v1";
pub const API_BASE_URL: &str = "https://rest.fauna.org/v1/";

const TRACE_HEADER: &str = "X-Fauna-Trace-Id";

/// HTTP client for the Fauna REST API.
///
/// Cloning is cheap; clones share the connection pool, reachability slot and
/// traffic logging switch.
#[derive(Clone)]
pub struct HttpClient {
  inner: Arc<Inner>,
}

struct Inner {
  http: reqwest::Client,
  root: Url,
  credentials: Credentials,
  reachability: Arc<AtomicU8>,
  log_traffic: AtomicBool,
}

impl HttpClient {
  /// Client for the public API root.
  pub fn new(credentials: Credentials) -> Result<Self> {
    Self::with_root(credentials, API_BASE_URL)
  }

  /// Client for an explicit API root, e.g. a staging deployment.
  pub fn with_root(credentials: Credentials, root: &str) -> Result<Self> {
    let mut root =
      Url::parse(root).map_err(|e| Error::Config(format!("Invalid API root {}: {}", root, e)))?;
    if !root.path().ends_with('/') {
      let path = format!("{}/", root.path());
      root.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .user_agent(concat!("fauna-rs/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      inner: Arc::new(Inner {
        http,
        root,
        credentials,
        reachability: Arc::new(AtomicU8::new(Reachability::Wifi.to_u8())),
        log_traffic: AtomicBool::new(false),
      }),
    })
  }

  pub fn credentials(&self) -> &Credentials {
    &self.inner.credentials
  }

  /// Record the network condition reported by the host platform.
  ///
  /// Shared with every client derived through [`ApiClient::as_user`].
  pub fn set_reachability(&self, reachability: Reachability) {
    self
      .inner
      .reachability
      .store(reachability.to_u8(), Ordering::SeqCst);
  }

  /// Exchange publisher login details for a publisher key.
  pub fn publisher_key(email: &str, password: &str, timeout: Duration) -> Future<String> {
    let client = match Self::new(Credentials::PublisherLogin {
      email: email.to_string(),
      password: password.to_string(),
    }) {
      Ok(client) => client,
      Err(e) => return Future::error(e),
    };

    client
      .get("keys/publisher", &Params::new(), timeout)
      .flat_map(|response| {
        let secret = response
          .resource
          .get("secret")
          .and_then(Value::as_str)
          .map(String::from);
        match secret {
          Some(secret) => Future::value(secret),
          None => Future::error(Error::Decode(
            "publisher key response has no secret".to_string(),
          )),
        }
      })
  }
}

impl Inner {
  async fn send(
    &self,
    method: Method,
    path: &str,
    params: &Params,
    timeout: Duration,
    trace_id: Option<&str>,
  ) -> Result<Response> {
    let url = self
      .root
      .join(path.trim_start_matches('/'))
      .map_err(|e| Error::Config(format!("Invalid request path {}: {}", path, e)))?;

    let (user, password) = self.credentials.basic_auth();
    let mut request = self
      .http
      .request(http_method(method), url)
      .basic_auth(user, password)
      .timeout(timeout);

    if let Some(trace_id) = trace_id {
      request = request.header(TRACE_HEADER, trace_id);
    }

    request = match method {
      Method::Get | Method::Delete => request.query(&query_pairs(params)),
      Method::Post | Method::Put => request.json(params),
    };

    let log = self.log_traffic.load(Ordering::Relaxed);
    if log {
      tracing::info!(method = method.as_str(), path, ?params, "request");
    }

    let started = Instant::now();
    let response = request
      .send()
      .await
      .map_err(|e| transport_error(e, timeout))?;
    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| transport_error(e, timeout))?;

    if log {
      tracing::info!(
        method = method.as_str(),
        path,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        body = %body,
        "response"
      );
    }

    if !status.is_success() {
      return Err(Error::Network {
        status: Some(status.as_u16()),
        message: error_message(&body)
          .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string()),
      });
    }

    if body.trim().is_empty() {
      return Ok(Response::default());
    }
    Ok(serde_json::from_str(&body)?)
  }
}

impl ApiClient for HttpClient {
  fn request(
    &self,
    method: Method,
    path: &str,
    params: &Params,
    timeout: Duration,
    trace_id: Option<&str>,
  ) -> Future<Response> {
    let inner = Arc::clone(&self.inner);
    let path = path.to_string();
    let params = params.clone();
    let trace_id = trace_id.map(String::from);
    Future::spawn(async move {
      inner
        .send(method, &path, &params, timeout, trace_id.as_deref())
        .await
    })
  }

  fn reachability(&self) -> Reachability {
    Reachability::from_u8(self.inner.reachability.load(Ordering::SeqCst))
  }

  fn auth_hash(&self) -> String {
    self.inner.credentials.auth_hash()
  }

  fn api_root(&self) -> String {
    self.inner.root.to_string()
  }

  fn can_masquerade(&self) -> bool {
    self.inner.credentials.can_masquerade()
  }

  fn as_user(&self, user_ref: &str) -> Result<Arc<dyn ApiClient>> {
    let credentials = self.inner.credentials.as_user(user_ref).ok_or_else(|| {
      Error::MasqueradeNotPermitted(format!(
        "cannot act as {} without a publisher key",
        user_ref
      ))
    })?;

    Ok(Arc::new(HttpClient {
      inner: Arc::new(Inner {
        http: self.inner.http.clone(),
        root: self.inner.root.clone(),
        credentials,
        reachability: Arc::clone(&self.inner.reachability),
        log_traffic: AtomicBool::new(self.inner.log_traffic.load(Ordering::Relaxed)),
      }),
    }))
  }

  fn set_log_http_traffic(&self, enabled: bool) {
    self.inner.log_traffic.store(enabled, Ordering::Relaxed);
  }
}

fn http_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Delete => reqwest::Method::DELETE,
  }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> Error {
  if err.is_timeout() {
    Error::Timeout(timeout)
  } else {
    Error::from(err)
  }
}

/// Query string pairs; strings are sent bare, everything else as JSON.
fn query_pairs(params: &Params) -> Vec<(String, String)> {
  params
    .iter()
    .map(|(key, value)| {
      let value = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      (key.clone(), value)
    })
    .collect()
}

/// Pull a message out of an error body like `{"error": "..."}`.
fn error_message(body: &str) -> Option<String> {
  let value: Value = serde_json::from_str(body).ok()?;
  match value.get("error")? {
    Value::String(message) => Some(message.clone()),
    other => Some(other.to_string()),
  }
}
