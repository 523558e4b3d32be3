//! Read-through result cache.
//!
//! [`ResultCache`] memoizes serialized read results under a [`CacheKey`] and
//! applies the [`InvalidationSet`]s returned by store writes. Storage goes
//! through a [`CacheBackend`]; [`MemoryCache`] keeps entries in-process.
//!
//! Reads never depend on the cache: a failed lookup or write is logged and
//! the result is computed from the store. Failed invalidations are retried
//! and then reported, since a skipped one would serve stale data.
//!
//! A read that overlaps an invalidation does not store its result. Every
//! invalidation bumps a generation under an exclusive gate; a computed result
//! is stored under the shared gate, and only if the generation it observed
//! before computing is still current.

use std::{
  future::Future,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use dashmap::DashMap;
use grades_core::invalidation::{CacheKey, Invalidation, InvalidationSet};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Attempts made for each invalidation before it is reported as failed.
pub const INVALIDATION_ATTEMPTS: u32 = 3;

const INVALIDATION_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache backend unavailable: {0}")]
  Unavailable(String),

  #[error("cache payload error: {0}")]
  Payload(#[from] serde_json::Error),
}

// ─── Backend ─────────────────────────────────────────────────────────────────

/// Key-value storage behind a [`ResultCache`].
pub trait CacheBackend: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

  /// Store `payload`; `ttl` of `None` keeps it until invalidated.
  fn put(
    &self,
    key: &str,
    payload: String,
    ttl: Option<Duration>,
  ) -> Result<(), CacheError>;

  fn remove(&self, key: &str) -> Result<(), CacheError>;

  fn remove_prefix(&self, prefix: &str) -> Result<(), CacheError>;
}

struct Entry {
  payload: String,
  expires: Option<Instant>,
}

impl Entry {
  fn is_live(&self, now: Instant) -> bool {
    self.expires.is_none_or(|at| at > now)
  }
}

/// In-process backend on a concurrent map. Expired entries are dropped
/// lazily on lookup.
#[derive(Default)]
pub struct MemoryCache {
  entries: DashMap<String, Entry>,
}

impl MemoryCache {
  pub fn new() -> Self { Self::default() }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn contains(&self, key: &str) -> bool {
    self
      .entries
      .get(key)
      .is_some_and(|entry| entry.is_live(Instant::now()))
  }
}

impl CacheBackend for MemoryCache {
  fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
    let now = Instant::now();
    let hit = match self.entries.get(key) {
      Some(entry) if entry.is_live(now) => Some(entry.payload.clone()),
      Some(_) => None,
      None => return Ok(None),
    };
    if hit.is_none() {
      self.entries.remove_if(key, |_, entry| !entry.is_live(now));
    }
    Ok(hit)
  }

  fn put(
    &self,
    key: &str,
    payload: String,
    ttl: Option<Duration>,
  ) -> Result<(), CacheError> {
    let expires = ttl.map(|ttl| Instant::now() + ttl);
    self
      .entries
      .insert(key.to_owned(), Entry { payload, expires });
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), CacheError> {
    self.entries.remove(key);
    Ok(())
  }

  fn remove_prefix(&self, prefix: &str) -> Result<(), CacheError> {
    self.entries.retain(|key, _| !key.starts_with(prefix));
    Ok(())
  }
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// How long a cached read may be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
  /// Kept until an invalidation removes it.
  UntilInvalidated,
  /// Expires after the duration; zero disables caching for the read.
  For(Duration),
}

impl Ttl {
  fn storage(self) -> Option<Option<Duration>> {
    match self {
      Self::UntilInvalidated => Some(None),
      Self::For(d) if d.is_zero() => None,
      Self::For(d) => Some(Some(d)),
    }
  }
}

// ─── Result cache ────────────────────────────────────────────────────────────

/// Orders cache writes against invalidations.
#[derive(Default)]
struct Fence {
  generation: AtomicU64,
  gate:       RwLock<()>,
}

pub struct ResultCache<C> {
  backend: Arc<C>,
  enabled: bool,
  fence:   Arc<Fence>,
}

impl<C> Clone for ResultCache<C> {
  fn clone(&self) -> Self {
    Self {
      backend: Arc::clone(&self.backend),
      enabled: self.enabled,
      fence:   Arc::clone(&self.fence),
    }
  }
}

impl<C: CacheBackend> ResultCache<C> {
  pub fn new(backend: Arc<C>, enabled: bool) -> Self {
    Self {
      backend,
      enabled,
      fence: Arc::default(),
    }
  }

  pub fn backend(&self) -> &C { &self.backend }

  /// Serve `key` from the cache, or run `compute` and remember its result.
  ///
  /// Errors from `compute` are returned as-is and never cached.
  pub async fn get_or_compute<T, E, F, Fut>(
    &self,
    key: &CacheKey,
    ttl: Ttl,
    compute: F,
  ) -> Result<T, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let Some(expiry) = ttl.storage().filter(|_| self.enabled) else {
      return compute().await;
    };

    match self.lookup(key) {
      Ok(Some(value)) => {
        debug!(key = key.as_str(), "cache hit");
        return Ok(value);
      }
      Ok(None) => debug!(key = key.as_str(), "cache miss"),
      Err(e) => warn!(key = key.as_str(), error = %e, "cache read failed"),
    }

    let observed = self.fence.generation.load(Ordering::Acquire);
    let value = compute().await?;

    let _shared = self.fence.gate.read().await;
    if self.fence.generation.load(Ordering::Acquire) != observed {
      debug!(key = key.as_str(), "invalidated while computing, not stored");
    } else if let Err(e) = self.remember(key, &value, expiry) {
      warn!(key = key.as_str(), error = %e, "cache write failed");
    }
    Ok(value)
  }

  fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
    self
      .backend
      .get(key.as_str())?
      .map(|payload| serde_json::from_str(&payload))
      .transpose()
      .map_err(CacheError::from)
  }

  fn remember<T: Serialize>(
    &self,
    key: &CacheKey,
    value: &T,
    expiry: Option<Duration>,
  ) -> Result<(), CacheError> {
    let payload = serde_json::to_string(value)?;
    self.backend.put(key.as_str(), payload, expiry)
  }

  /// Apply every invalidation in `set`, retrying each one.
  ///
  /// Runs even when caching is disabled, so entries written before the cache
  /// was switched off cannot resurface.
  pub async fn invalidate(&self, set: &InvalidationSet) -> Result<(), CacheError> {
    if set.is_empty() {
      return Ok(());
    }
    let _exclusive = self.fence.gate.write().await;
    self.fence.generation.fetch_add(1, Ordering::AcqRel);
    for entry in set.iter() {
      self.apply_with_retry(entry).await?;
    }
    Ok(())
  }

  async fn apply_with_retry(&self, entry: &Invalidation) -> Result<(), CacheError> {
    let mut attempt = 1;
    loop {
      let outcome = match entry {
        Invalidation::Key(key) => self.backend.remove(key.as_str()),
        Invalidation::Prefix(prefix) => self.backend.remove_prefix(prefix),
      };
      match outcome {
        Ok(()) => return Ok(()),
        Err(e) if attempt < INVALIDATION_ATTEMPTS => {
          warn!(?entry, attempt, error = %e, "cache invalidation failed, retrying");
          tokio::time::sleep(INVALIDATION_BACKOFF * attempt).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn entries_expire() {
    let cache = MemoryCache::new();
    cache
      .put("feed:a", "1".into(), Some(Duration::from_millis(1)))
      .unwrap();
    cache.put("user:x:favorites", "2".into(), None).unwrap();
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(cache.get("feed:a").unwrap(), None);
    assert_eq!(cache.get("user:x:favorites").unwrap().as_deref(), Some("2"));
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn prefix_removal_is_scoped() {
    let cache = MemoryCache::new();
    for key in ["search:1", "search:2", "feed:1"] {
      cache.put(key, "x".into(), None).unwrap();
    }
    cache.remove_prefix("search:").unwrap();
    assert!(!cache.contains("search:1"));
    assert!(cache.contains("feed:1"));
  }

  #[tokio::test]
  async fn zero_ttl_bypasses_storage() {
    let cache = ResultCache::new(Arc::new(MemoryCache::new()), true);
    let key = CacheKey::recently_graded("2024-01-01".parse().unwrap(), 5);

    let value: Result<u32, ()> = cache
      .get_or_compute(&key, Ttl::For(Duration::ZERO), || async { Ok(7) })
      .await;
    assert_eq!(value, Ok(7));
    assert!(cache.backend().is_empty());

    let value: Result<u32, ()> = cache
      .get_or_compute(&key, Ttl::For(Duration::from_secs(60)), || async { Ok(8) })
      .await;
    assert_eq!(value, Ok(8));
    // Served from the cache: the closure's value is ignored.
    let value: Result<u32, ()> = cache
      .get_or_compute(&key, Ttl::For(Duration::from_secs(60)), || async { Ok(9) })
      .await;
    assert_eq!(value, Ok(8));
  }

  #[tokio::test]
  async fn results_computed_across_an_invalidation_are_not_stored() {
    let cache = ResultCache::new(Arc::new(MemoryCache::new()), true);
    let key = CacheKey::recently_graded("2024-01-01".parse().unwrap(), 5);
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let reader = {
      let cache = cache.clone();
      let key = key.clone();
      tokio::spawn(async move {
        cache
          .get_or_compute(&key, Ttl::UntilInvalidated, || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<u32, ()>(1)
          })
          .await
      })
    };

    started_rx.await.unwrap();
    cache
      .invalidate(&InvalidationSet::of(Invalidation::grade_feed()))
      .await
      .unwrap();
    release_tx.send(()).unwrap();

    assert_eq!(reader.await.unwrap(), Ok(1));
    assert!(cache.backend().is_empty());

    // Without an overlapping invalidation the next read is stored.
    let value: Result<u32, ()> = cache
      .get_or_compute(&key, Ttl::UntilInvalidated, || async { Ok(2) })
      .await;
    assert_eq!(value, Ok(2));
    assert!(cache.backend().contains(key.as_str()));
  }

  #[tokio::test]
  async fn failed_computations_are_not_cached() {
    let cache = ResultCache::new(Arc::new(MemoryCache::new()), true);
    let key = CacheKey::recently_graded("2024-01-01".parse().unwrap(), 5);
    let value: Result<u32, &str> = cache
      .get_or_compute(&key, Ttl::UntilInvalidated, || async { Err("boom") })
      .await;
    assert_eq!(value, Err("boom"));
    assert!(cache.backend().is_empty());
  }
}
