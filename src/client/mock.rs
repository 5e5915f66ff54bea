//! In-memory [`ApiClient`] for unit tests.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ApiClient, Method, Params, Reachability, Response};
use crate::error::{Error, Result};
use crate::future::Future;

/// Stores resources by path. Writes update the store; reads return it.
#[derive(Clone)]
pub(crate) struct MockClient {
  identity: String,
  publisher: bool,
  reachability: Arc<AtomicU8>,
  resources: Arc<Mutex<HashMap<String, Value>>>,
  failure: Arc<Mutex<Option<Error>>>,
  calls: Arc<Mutex<Vec<(Method, String)>>>,
  trace_ids: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockClient {
  pub fn new(identity: &str) -> Self {
    Self {
      identity: identity.to_string(),
      publisher: false,
      reachability: Arc::new(AtomicU8::new(Reachability::Wifi.to_u8())),
      resources: Arc::default(),
      failure: Arc::default(),
      calls: Arc::default(),
      trace_ids: Arc::default(),
    }
  }

  pub fn publisher(identity: &str) -> Self {
    Self {
      publisher: true,
      ..Self::new(identity)
    }
  }

  pub fn insert(&self, path: &str, resource: Value) {
    self
      .resources
      .lock()
      .unwrap()
      .insert(path.to_string(), resource);
  }

  /// Make every following request fail with `error`.
  pub fn fail_with(&self, error: Option<Error>) {
    *self.failure.lock().unwrap() = error;
  }

  pub fn set_reachability(&self, reachability: Reachability) {
    self.reachability.store(reachability.to_u8(), Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self.calls.lock().unwrap().clone()
  }

  /// Trace id sent with each request, in call order.
  pub fn trace_ids(&self) -> Vec<Option<String>> {
    self.trace_ids.lock().unwrap().clone()
  }

  fn respond(&self, method: Method, path: &str, params: &Params) -> Result<Response> {
    if let Some(error) = self.failure.lock().unwrap().clone() {
      return Err(error);
    }

    let mut resources = self.resources.lock().unwrap();
    match method {
      Method::Get => resources
        .get(path)
        .map(|resource| Response::new(resource.clone(), Default::default()))
        .ok_or_else(|| Error::Network {
          status: Some(404),
          message: format!("{} not found", path),
        }),
      Method::Post | Method::Put => {
        let mut resource = json!({ "ref": path });
        for (key, value) in params {
          resource[key] = value.clone();
        }
        resources.insert(path.to_string(), resource.clone());
        Ok(Response::new(resource, Default::default()))
      }
      Method::Delete => {
        resources.remove(path);
        Ok(Response::default())
      }
    }
  }
}

impl ApiClient for MockClient {
  fn request(
    &self,
    method: Method,
    path: &str,
    params: &Params,
    _timeout: Duration,
    trace_id: Option<&str>,
  ) -> Future<Response> {
    self
      .calls
      .lock()
      .unwrap()
      .push((method, path.to_string()));
    self
      .trace_ids
      .lock()
      .unwrap()
      .push(trace_id.map(String::from));
    let client = self.clone();
    let path = path.to_string();
    let params = params.clone();
    Future::in_background(move || client.respond(method, &path, &params))
  }

  fn reachability(&self) -> Reachability {
    Reachability::from_u8(self.reachability.load(Ordering::SeqCst))
  }

  fn auth_hash(&self) -> String {
    self.identity.clone()
  }

  fn api_root(&self) -> String {
    "mock://fauna/".to_string()
  }

  fn can_masquerade(&self) -> bool {
    self.publisher
  }

  fn as_user(&self, user_ref: &str) -> Result<Arc<dyn ApiClient>> {
    if !self.publisher {
      return Err(Error::MasqueradeNotPermitted(user_ref.to_string()));
    }
    Ok(Arc::new(Self {
      identity: format!("{}:{}", self.identity, user_ref),
      publisher: false,
      ..self.clone()
    }))
  }
}
