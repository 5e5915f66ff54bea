//! Request fingerprints used as cache keys.

use sha2::{Digest, Sha256};

use crate::client::Params;

/// SHA-256 hex digest identifying a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// A read request as seen by the cache: a resource path plus parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestKey {
  path: String,
  params: Params,
}

impl RequestKey {
  pub fn new(path: &str, params: Params) -> Self {
    Self {
      path: normalize_path(path),
      params,
    }
  }

  /// Key for a bare resource path.
  pub fn resource(path: &str) -> Self {
    Self::new(path, Params::new())
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn params(&self) -> &Params {
    &self.params
  }

  pub fn fingerprint(&self) -> Fingerprint {
    let mut input = self.path.clone();
    // Params is ordered by key, so equal requests hash equally.
    for (key, value) in &self.params {
      input.push('\n');
      input.push_str(key);
      input.push('=');
      input.push_str(&value.to_string());
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
  }

  /// Human-readable form for logs and errors.
  pub fn description(&self) -> String {
    if self.params.is_empty() {
      self.path.clone()
    } else {
      let params: Vec<String> = self
        .params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
      format!("{}?{}", self.path, params.join("&"))
    }
  }
}

/// Trim surrounding slashes and whitespace so `/users/1/` and `users/1` match.
pub fn normalize_path(path: &str) -> String {
  path.trim().trim_matches('/').to_string()
}
