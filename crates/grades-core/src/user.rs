//! Users and their activity: favorites and recent searches.
//!
//! User ids are issued by the external identity provider; the core only
//! checks that they are plausible, never that they are authentic.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const MAX_USER_ID_LEN: usize = 255;
/// Upper bound on `limit` for recent-search listings.
pub const MAX_RECENT_LIMIT: usize = 100;

/// An opaque, already-verified user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
  pub fn new(raw: impl Into<String>) -> Result<Self> {
    let raw = raw.into();
    if raw.trim().is_empty() {
      return Err(Error::InvalidUserId("empty"));
    }
    if raw.len() > MAX_USER_ID_LEN {
      return Err(Error::InvalidUserId("longer than 255 bytes"));
    }
    if raw.chars().any(char::is_control) {
      return Err(Error::InvalidUserId("contains control characters"));
    }
    Ok(Self(raw))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl TryFrom<String> for UserId {
  type Error = Error;

  fn try_from(raw: String) -> Result<Self> { Self::new(raw) }
}

impl From<UserId> for String {
  fn from(id: UserId) -> Self { id.0 }
}

impl fmt::Display for UserId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub user_id:    UserId,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Favorite {
  pub camis:    String,
  pub added_at: DateTime<Utc>,
}

/// A de-duplicated search: one row per normalized term per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentSearch {
  /// Normalized form; the de-duplication key.
  pub term_key:     String,
  /// The latest spelling the user typed.
  pub display_term: String,
  pub searched_at:  DateTime<Utc>,
}

/// Validate a listing limit against `1..=MAX_RECENT_LIMIT`.
pub fn check_limit(limit: usize) -> Result<usize> {
  if limit == 0 || limit > MAX_RECENT_LIMIT {
    return Err(Error::InvalidLimit {
      got: limit,
      max: MAX_RECENT_LIMIT,
    });
  }
  Ok(limit)
}
