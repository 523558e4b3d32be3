//! [`GradeService`], the operations the serving layer calls.
//!
//! Wraps an [`InspectionStore`] with the result cache. Every store write goes
//! through `GradeService::settle`, which applies the write's invalidation
//! set before the caller sees the result.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{Days, NaiveDate, Utc};
use grades_core::{
  ErrorKind,
  detect::{DetectionMode, DetectionReport, DetectionScope, partition_of},
  event::{GradeUpdateEvent, RecentGrade},
  inspection::{Enrichment, Establishment, IngestReport, NewInspection, SearchHit},
  invalidation::{CacheKey, Invalidation, InvalidationSet, Written},
  query::SearchParams,
  store::{InspectionStore, StoreError},
  user::{Favorite, RecentSearch, User, UserId, check_limit},
};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
  Error, Result,
  cache::{CacheBackend, MemoryCache, ResultCache, Ttl},
  config::{CacheSettings, Settings},
};

/// An ingestion batch and the incremental detection it triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
  pub report:    IngestReport,
  pub detection: DetectionReport,
}

struct Inner<S, C> {
  store:   S,
  cache:   ResultCache<C>,
  ttls:    CacheSettings,
  /// Detection locks, one per partition of the id space.
  stripes: Vec<Mutex<()>>,
}

/// Cloning is cheap; clones share the store, cache and locks.
pub struct GradeService<S, C = MemoryCache> {
  inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for GradeService<S, C> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S, C> GradeService<S, C>
where
  S: InspectionStore + 'static,
  C: CacheBackend + 'static,
{
  pub fn new(store: S, cache: Arc<C>, settings: &Settings) -> Self {
    let stripes = (0..settings.partitions()).map(|_| Mutex::new(())).collect();
    Self {
      inner: Arc::new(Inner {
        store,
        cache: ResultCache::new(cache, settings.cache.enabled),
        ttls: settings.cache.clone(),
        stripes,
      }),
    }
  }

  pub fn store(&self) -> &S { &self.inner.store }

  pub fn cache(&self) -> &ResultCache<C> { &self.inner.cache }

  /// Apply a write's invalidations, then release its value.
  async fn commit<T>(&self, written: Written<T>) -> Result<T> {
    let Written { value, invalidate } = written;
    self.invalidate(&invalidate).await?;
    Ok(value)
  }

  async fn invalidate(&self, set: &InvalidationSet) -> Result<()> {
    self.inner.cache.invalidate(set).await.map_err(|e| {
      error!(invalidate = ?set, error = %e, "cache invalidation failed");
      Error::CacheInvalidation(e)
    })
  }

  /// Finish a store write.
  ///
  /// A write that timed out may still commit on the database thread.
  /// `fallback`, everything the write could have made stale, is invalidated
  /// before the timeout is reported and again once the store has drained.
  async fn settle<T>(
    &self,
    outcome: Result<Written<T>, S::Error>,
    fallback: impl FnOnce() -> InvalidationSet,
  ) -> Result<T> {
    match outcome {
      Ok(written) => self.commit(written).await,
      Err(e) if e.kind() == ErrorKind::Timeout => {
        let fallback = fallback();
        warn!(
          invalidate = ?fallback,
          error = %e,
          "write timed out, invalidating everything it could touch",
        );
        self.invalidate(&fallback).await?;
        self.invalidate_when_drained(fallback);
        Err(Error::store(e))
      }
      Err(e) => Err(Error::store(e)),
    }
  }

  fn invalidate_when_drained(&self, set: InvalidationSet) {
    let service = self.clone();
    tokio::spawn(async move {
      if let Err(e) = service.inner.store.settled().await {
        error!(error = %e, "store did not drain after a timed-out write");
      }
      // Failures are logged inside.
      let _ = service.invalidate(&set).await;
    });
  }

  // ── Ingestion & detection ─────────────────────────────────────────────────

  /// Upsert a batch, then run incremental detection over the establishments
  /// it touched.
  pub async fn ingest(&self, batch: Vec<NewInspection>) -> Result<IngestOutcome> {
    let outcome = self.inner.store.upsert_inspections(batch).await;
    let report = self.settle(outcome, catalog_changes).await?;

    let detection = if report.establishments.is_empty() {
      DetectionReport::empty(DetectionMode::Incremental)
    } else {
      self
        .detect(
          DetectionMode::Incremental,
          DetectionScope::Establishments {
            camis: report.establishments.clone(),
          },
        )
        .await?
    };
    Ok(IngestOutcome { report, detection })
  }

  /// Run one detection pass while holding the locks of every stripe the
  /// scope can touch.
  pub async fn detect(
    &self,
    mode: DetectionMode,
    scope: DetectionScope,
  ) -> Result<DetectionReport> {
    scope.validate()?;

    // Ascending order, so overlapping passes cannot deadlock.
    let mut guards = Vec::new();
    for stripe in self.stripes_for(&scope) {
      guards.push(self.inner.stripes[stripe].lock().await);
    }
    let outcome = self.inner.store.detect_grade_changes(mode, scope).await;
    drop(guards);

    self
      .settle(outcome, || InvalidationSet::of(Invalidation::grade_feed()))
      .await
  }

  fn stripes_for(&self, scope: &DetectionScope) -> BTreeSet<usize> {
    let count = self.inner.stripes.len();
    let of = u32::try_from(count).unwrap_or(u32::MAX);
    match scope {
      DetectionScope::Establishments { camis } => camis
        .iter()
        .map(|id| partition_of(id, of) as usize)
        .collect(),
      DetectionScope::Partition { index, of: parts } if *parts == of => {
        BTreeSet::from([*index as usize])
      }
      DetectionScope::All | DetectionScope::Partition { .. } => (0..count).collect(),
    }
  }

  pub async fn grade_events(&self, camis: String) -> Result<Vec<GradeUpdateEvent>> {
    self.inner.store.grade_events(camis).await.map_err(Error::store)
  }

  /// Events graded within the last `days` days, newest first.
  pub async fn recently_graded(
    &self,
    days: u32,
    limit: usize,
  ) -> Result<Vec<RecentGrade>> {
    let limit = check_limit(limit)?;
    let since = Utc::now()
      .date_naive()
      .checked_sub_days(Days::new(u64::from(days)))
      .unwrap_or(NaiveDate::MIN);
    let key = CacheKey::recently_graded(since, limit);

    self
      .inner
      .cache
      .get_or_compute(&key, self.inner.ttls.feed_ttl(), || async {
        self
          .inner
          .store
          .recently_graded(since, limit)
          .await
          .map_err(Error::store)
      })
      .await
  }

  // ── Search ────────────────────────────────────────────────────────────────

  pub async fn search(&self, params: SearchParams) -> Result<Vec<SearchHit>> {
    let request = params.into_request()?;
    let key = CacheKey::search(&request)?;

    self
      .inner
      .cache
      .get_or_compute(&key, self.inner.ttls.search_ttl(), || async {
        self.inner.store.search(&request).await.map_err(Error::store)
      })
      .await
  }

  pub async fn get_establishment(&self, camis: String) -> Result<Establishment> {
    self
      .inner
      .store
      .get_establishment(camis.clone())
      .await
      .map_err(Error::store)?
      .ok_or(Error::EstablishmentNotFound(camis))
  }

  // ── Maintenance ───────────────────────────────────────────────────────────

  pub async fn set_enrichment(&self, camis: String, enrichment: Enrichment) -> Result<()> {
    let outcome = self.inner.store.set_enrichment(camis, enrichment).await;
    self.settle(outcome, search_changes).await
  }

  pub async fn rebuild_name_keys(&self) -> Result<usize> {
    let outcome = self.inner.store.rebuild_name_keys().await;
    self.settle(outcome, search_changes).await
  }

  pub async fn prune_violations(&self, before: NaiveDate) -> Result<usize> {
    let outcome = self.inner.store.prune_violations(before).await;
    self.settle(outcome, InvalidationSet::new).await
  }

  // ── Users ─────────────────────────────────────────────────────────────────

  pub async fn register_user(&self, user: UserId) -> Result<User> {
    let outcome = self.inner.store.register_user(user.clone()).await;
    self
      .settle(outcome, || InvalidationSet::of(Invalidation::user(&user)))
      .await
  }

  /// Delete a user and everything cached for it. The cache is cleared even
  /// when the user did not exist.
  pub async fn delete_user(&self, user: UserId) -> Result<()> {
    let outcome = self.inner.store.delete_user(user.clone()).await;
    let deleted = self
      .settle(outcome, || InvalidationSet::of(Invalidation::user(&user)))
      .await?;
    if deleted {
      info!(user = %user, "deleted user");
      Ok(())
    } else {
      Err(Error::UserNotFound(user))
    }
  }

  pub async fn add_favorite(&self, user: UserId, camis: String) -> Result<bool> {
    let fallback = InvalidationSet::of(Invalidation::favorites(&user));
    let outcome = self.inner.store.add_favorite(user, camis).await;
    self.settle(outcome, || fallback).await
  }

  pub async fn remove_favorite(&self, user: UserId, camis: String) -> Result<bool> {
    let fallback = InvalidationSet::of(Invalidation::favorites(&user));
    let outcome = self.inner.store.remove_favorite(user, camis).await;
    self.settle(outcome, || fallback).await
  }

  pub async fn list_favorites(&self, user: UserId) -> Result<Vec<Favorite>> {
    let key = CacheKey::favorites(&user);
    self
      .inner
      .cache
      .get_or_compute(&key, Ttl::UntilInvalidated, || async {
        self.inner.store.list_favorites(user).await.map_err(Error::store)
      })
      .await
  }

  pub async fn record_search(&self, user: UserId, term: String) -> Result<RecentSearch> {
    let fallback = InvalidationSet::of(Invalidation::recent_searches(&user));
    let outcome = self.inner.store.record_search(user, term).await;
    self.settle(outcome, || fallback).await
  }

  pub async fn list_recent_searches(
    &self,
    user: UserId,
    limit: usize,
  ) -> Result<Vec<RecentSearch>> {
    let limit = check_limit(limit)?;
    let key = CacheKey::recent_searches(&user, limit);
    self
      .inner
      .cache
      .get_or_compute(&key, Ttl::UntilInvalidated, || async {
        self
          .inner
          .store
          .list_recent_searches(user, limit)
          .await
          .map_err(Error::store)
      })
      .await
  }

  // ── Partitioned detection ─────────────────────────────────────────────────

  /// Detect over every partition in parallel, one task per lock stripe.
  pub async fn detect_partitioned(&self, mode: DetectionMode) -> Result<DetectionReport> {
    let of = u32::try_from(self.inner.stripes.len()).unwrap_or(u32::MAX);
    let mut tasks = JoinSet::new();
    for index in 0..of {
      let service = self.clone();
      tasks.spawn(async move {
        service
          .detect(mode, DetectionScope::Partition { index, of })
          .await
      });
    }

    let mut report = DetectionReport::empty(mode);
    while let Some(joined) = tasks.join_next().await {
      report.absorb(joined??);
    }
    info!(
      partitions = of,
      establishments = report.establishments,
      events = report.events.len(),
      anomalies = report.anomalies.count,
      "partitioned detection complete",
    );
    Ok(report)
  }
}

/// What an ingestion batch can make stale.
fn catalog_changes() -> InvalidationSet {
  [Invalidation::search_results(), Invalidation::grade_feed()]
    .into_iter()
    .collect()
}

fn search_changes() -> InvalidationSet {
  InvalidationSet::of(Invalidation::search_results())
}
