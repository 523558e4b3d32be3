//! Cache keys and the invalidation sets returned by every store write.
//!
//! A write is not complete until its [`InvalidationSet`] has been applied to
//! the result cache. [`Written`] carries the set next to the write's result
//! and is `#[must_use]`, so dropping it unapplied is a compiler warning rather
//! than a silent stale read.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Result, query::SearchRequest, user::UserId};

pub const SEARCH_PREFIX: &str = "search:";
pub const FEED_PREFIX: &str = "feed:";
const USER_PREFIX: &str = "user:";

fn digest(bytes: &[u8]) -> String { hex::encode(Sha256::digest(bytes)) }

/// Every key scoped to `user`. User ids are hashed so that arbitrary id
/// characters cannot collide with the key separator.
pub fn user_prefix(user: &UserId) -> String {
  format!("{USER_PREFIX}{}:", digest(user.as_str().as_bytes()))
}

// ─── Keys ────────────────────────────────────────────────────────────────────

/// A deterministic cache key derived from a read's full parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
  /// `search:<sha256 of the canonical request JSON>`.
  pub fn search(request: &SearchRequest) -> Result<Self> {
    let canonical = serde_json::to_vec(request)?;
    Ok(Self(format!("{SEARCH_PREFIX}{}", digest(&canonical))))
  }

  pub fn favorites(user: &UserId) -> Self {
    Self(format!("{}favorites", user_prefix(user)))
  }

  pub fn recent_searches(user: &UserId, limit: usize) -> Self {
    Self(format!("{}recent:{limit}", user_prefix(user)))
  }

  pub fn recently_graded(since: NaiveDate, limit: usize) -> Self {
    Self(format!("{FEED_PREFIX}recently-graded:{since}:{limit}"))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

// ─── Invalidations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Invalidation {
  Key(CacheKey),
  Prefix(String),
}

impl Invalidation {
  /// Everything cached for one user.
  pub fn user(user: &UserId) -> Self { Self::Prefix(user_prefix(user)) }

  pub fn favorites(user: &UserId) -> Self {
    Self::Key(CacheKey::favorites(user))
  }

  /// Recent-search listings of one user, for every limit.
  pub fn recent_searches(user: &UserId) -> Self {
    Self::Prefix(format!("{}recent:", user_prefix(user)))
  }

  pub fn search_results() -> Self { Self::Prefix(SEARCH_PREFIX.to_owned()) }

  pub fn grade_feed() -> Self { Self::Prefix(FEED_PREFIX.to_owned()) }

  /// Whether applying `self` removes `key`.
  pub fn covers(&self, key: &str) -> bool {
    match self {
      Self::Key(k) => k.as_str() == key,
      Self::Prefix(p) => key.starts_with(p.as_str()),
    }
  }
}

/// The cache entries a write may have made stale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationSet {
  entries: Vec<Invalidation>,
}

impl InvalidationSet {
  pub fn new() -> Self { Self::default() }

  pub fn of(entry: Invalidation) -> Self {
    Self {
      entries: vec![entry],
    }
  }

  pub fn push(&mut self, entry: Invalidation) {
    if !self.entries.contains(&entry) {
      self.entries.push(entry);
    }
  }

  pub fn extend(&mut self, other: InvalidationSet) {
    for entry in other.entries {
      self.push(entry);
    }
  }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn iter(&self) -> impl Iterator<Item = &Invalidation> {
    self.entries.iter()
  }
}

impl FromIterator<Invalidation> for InvalidationSet {
  fn from_iter<I: IntoIterator<Item = Invalidation>>(iter: I) -> Self {
    let mut set = Self::new();
    for entry in iter {
      set.push(entry);
    }
    set
  }
}

/// The result of a store write plus the invalidations it requires.
#[derive(Debug, Clone)]
#[must_use = "a write is incomplete until its invalidation set is applied"]
pub struct Written<T> {
  pub value:      T,
  pub invalidate: InvalidationSet,
}

impl<T> Written<T> {
  pub fn new(value: T, invalidate: InvalidationSet) -> Self {
    Self { value, invalidate }
  }

  /// A write that cannot affect any cached read.
  pub fn clean(value: T) -> Self { Self::new(value, InvalidationSet::new()) }
}
