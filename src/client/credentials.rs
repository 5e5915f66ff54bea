//! Opaque credentials and the identity derived from them.

use sha2::{Digest, Sha256};

/// How a client authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
  /// Client key or user token
  Key(String),
  /// Publisher key, allowed to act as any user
  PublisherKey(String),
  /// Publisher key acting as `user_ref`
  Masquerade { key: String, user_ref: String },
  /// Publisher account login, only used to fetch a publisher key
  PublisherLogin { email: String, password: String },
}

impl Credentials {
  /// User name and password for HTTP basic auth.
  pub fn basic_auth(&self) -> (&str, Option<&str>) {
    match self {
      Credentials::Key(key) | Credentials::PublisherKey(key) => (key, None),
      Credentials::Masquerade { key, user_ref } => (key, Some(user_ref)),
      Credentials::PublisherLogin { email, password } => (email, Some(password)),
    }
  }

  /// Whether these credentials may derive a masquerading identity.
  pub fn can_masquerade(&self) -> bool {
    matches!(
      self,
      Credentials::PublisherKey(_) | Credentials::Masquerade { .. }
    )
  }

  /// Credentials acting as `user_ref`, if allowed.
  pub fn as_user(&self, user_ref: &str) -> Option<Credentials> {
    match self {
      Credentials::PublisherKey(key) | Credentials::Masquerade { key, .. } => {
        Some(Credentials::Masquerade {
          key: key.clone(),
          user_ref: user_ref.to_string(),
        })
      }
      _ => None,
    }
  }

  /// Stable digest of the effective identity.
  ///
  /// Used for equivalence checks and to name per-identity cache files.
  pub fn auth_hash(&self) -> String {
    let (user, password) = self.basic_auth();
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update(b":");
    hasher.update(password.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Debug for Credentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Credentials::Key(_) => f.write_str("Key(..)"),
      Credentials::PublisherKey(_) => f.write_str("PublisherKey(..)"),
      Credentials::Masquerade { user_ref, .. } => f
        .debug_struct("Masquerade")
        .field("user_ref", user_ref)
        .finish_non_exhaustive(),
      Credentials::PublisherLogin { email, .. } => f
        .debug_struct("PublisherLogin")
        .field("email", email)
        .finish_non_exhaustive(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_publisher_keys_masquerade() {
    assert!(Credentials::Key("k".into()).as_user("users/1").is_none());
    assert!(Credentials::PublisherLogin {
      email: "a@b.c".into(),
      password: "pw".into()
    }
    .as_user("users/1")
    .is_none());

    let masked = Credentials::PublisherKey("pk".into())
      .as_user("users/1")
      .unwrap();
    assert_eq!(masked.basic_auth(), ("pk", Some("users/1")));
    assert!(masked.can_masquerade());
  }

  #[test]
  fn test_auth_hash_tracks_identity() {
    let publisher = Credentials::PublisherKey("pk".into());
    let as_one = publisher.as_user("users/1").unwrap();
    let as_two = publisher.as_user("users/2").unwrap();

    assert_eq!(publisher.auth_hash(), Credentials::Key("pk".into()).auth_hash());
    assert_ne!(as_one.auth_hash(), as_two.auth_hash());
    assert_eq!(as_one.auth_hash(), publisher.as_user("users/1").unwrap().auth_hash());
    assert_eq!(as_one.auth_hash().len(), 64);
  }

  #[test]
  fn test_debug_hides_secrets() {
    let rendered = format!("{:?}", Credentials::Masquerade {
      key: "secret".into(),
      user_ref: "users/1".into()
    });
    assert!(!rendered.contains("secret"));
    assert!(rendered.contains("users/1"));
  }
}
