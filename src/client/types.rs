//! Wire-level types shared by the client, the cache and contexts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Request parameters, kept in key order so equal requests fingerprint equally.
pub type Params = BTreeMap<String, Value>;

/// A decoded API response: the requested resource plus any resources it
/// references, keyed by ref.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub resource: Value,
  #[serde(default)]
  pub references: Map<String, Value>,
}

impl Response {
  pub fn new(resource: Value, references: Map<String, Value>) -> Self {
    Self {
      resource,
      references,
    }
  }

  /// The resource's own path (`"ref"` field), if it has one.
  pub fn resource_ref(&self) -> Option<&str> {
    self.resource.get("ref").and_then(Value::as_str)
  }
}

/// Coarse network condition used to pick a cache staleness threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
  Offline,
  #[default]
  Wifi,
  Wwan,
}

impl Reachability {
  pub fn as_str(self) -> &'static str {
    match self {
      Reachability::Offline => "offline",
      Reachability::Wifi => "wifi",
      Reachability::Wwan => "wwan",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "offline" => Some(Reachability::Offline),
      "wifi" => Some(Reachability::Wifi),
      "wwan" => Some(Reachability::Wwan),
      _ => None,
    }
  }

  pub(crate) fn to_u8(self) -> u8 {
    match self {
      Reachability::Offline => 0,
      Reachability::Wifi => 1,
      Reachability::Wwan => 2,
    }
  }

  pub(crate) fn from_u8(v: u8) -> Self {
    match v {
      0 => Reachability::Offline,
      2 => Reachability::Wwan,
      _ => Reachability::Wifi,
    }
  }
}

/// HTTP verb of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}
