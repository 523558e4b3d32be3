//! The `InspectionStore` trait.
//!
//! Implemented by storage backends (`grades-store-sqlite`). The service layer
//! depends on this abstraction and applies the [`InvalidationSet`] of every
//! write it performs.
//!
//! [`InvalidationSet`]: crate::invalidation::InvalidationSet

use std::future::Future;

use chrono::NaiveDate;

use crate::{
  ErrorKind,
  detect::{DetectionMode, DetectionReport, DetectionScope},
  event::{GradeUpdateEvent, RecentGrade},
  inspection::{Enrichment, Establishment, IngestReport, NewInspection, SearchHit},
  invalidation::Written,
  query::SearchRequest,
  user::{Favorite, RecentSearch, User, UserId},
};

/// Errors raised by a store backend classify themselves for the caller.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  fn kind(&self) -> ErrorKind;
}

/// Abstraction over an inspection store backend.
///
/// Every write returns [`Written`], pairing its result with the cache entries
/// it made stale. All methods return `Send` futures so the trait can be used
/// from multi-threaded runtimes.
pub trait InspectionStore: Send + Sync {
  type Error: StoreError;

  // ── Ingestion & maintenance ───────────────────────────────────────────

  /// Upsert a batch keyed by `(camis, inspection_date)`, replacing each
  /// record's violations and deriving its name key and trigram postings.
  ///
  /// Rows failing [`NewInspection::validate`] are reported, not written.
  /// Pending grades finalized on records already behind a watermark emit a
  /// `pending_finalized` event in the same transaction.
  fn upsert_inspections(
    &self,
    batch: Vec<NewInspection>,
  ) -> impl Future<Output = Result<Written<IngestReport>, Self::Error>> + Send + '_;

  /// Attach enrichment to every record of an establishment.
  fn set_enrichment(
    &self,
    camis: String,
    enrichment: Enrichment,
  ) -> impl Future<Output = Result<Written<()>, Self::Error>> + Send + '_;

  /// Re-normalize every stored name and rebuild the trigram index. Returns
  /// the number of records whose key changed.
  fn rebuild_name_keys(
    &self,
  ) -> impl Future<Output = Result<Written<usize>, Self::Error>> + Send + '_;

  /// Delete violations of inspections dated before `before`. Returns the
  /// number of violations removed.
  fn prune_violations(
    &self,
    before: NaiveDate,
  ) -> impl Future<Output = Result<Written<usize>, Self::Error>> + Send + '_;

  // ── Grade changes ─────────────────────────────────────────────────────

  /// Run one detection pass over `scope` in a single transaction.
  fn detect_grade_changes(
    &self,
    mode: DetectionMode,
    scope: DetectionScope,
  ) -> impl Future<Output = Result<Written<DetectionReport>, Self::Error>> + Send + '_;

  /// Every event recorded for one establishment, oldest inspection first.
  fn grade_events(
    &self,
    camis: String,
  ) -> impl Future<Output = Result<Vec<GradeUpdateEvent>, Self::Error>> + Send + '_;

  /// Events whose effective date is on or after `since`, newest first.
  fn recently_graded(
    &self,
    since: NaiveDate,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<RecentGrade>, Self::Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  fn search<'a>(
    &'a self,
    request: &'a SearchRequest,
  ) -> impl Future<Output = Result<Vec<SearchHit>, Self::Error>> + Send + 'a;

  /// Latest summary plus full history. `None` if the establishment is unknown.
  fn get_establishment(
    &self,
    camis: String,
  ) -> impl Future<Output = Result<Option<Establishment>, Self::Error>> + Send + '_;

  // ── Users ─────────────────────────────────────────────────────────────

  /// Create the user if absent; returns the stored row either way.
  fn register_user(
    &self,
    user: UserId,
  ) -> impl Future<Output = Result<Written<User>, Self::Error>> + Send + '_;

  /// Delete the user with its favorites and searches. The value is `false`
  /// when no such user existed; the invalidation is returned regardless.
  fn delete_user(
    &self,
    user: UserId,
  ) -> impl Future<Output = Result<Written<bool>, Self::Error>> + Send + '_;

  /// Returns whether a row was added.
  fn add_favorite(
    &self,
    user: UserId,
    camis: String,
  ) -> impl Future<Output = Result<Written<bool>, Self::Error>> + Send + '_;

  /// Returns whether a row was removed.
  fn remove_favorite(
    &self,
    user: UserId,
    camis: String,
  ) -> impl Future<Output = Result<Written<bool>, Self::Error>> + Send + '_;

  fn list_favorites(
    &self,
    user: UserId,
  ) -> impl Future<Output = Result<Vec<Favorite>, Self::Error>> + Send + '_;

  /// Record a search term, de-duplicated on its normalized form.
  fn record_search(
    &self,
    user: UserId,
    term: String,
  ) -> impl Future<Output = Result<Written<RecentSearch>, Self::Error>> + Send + '_;

  fn list_recent_searches(
    &self,
    user: UserId,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<RecentSearch>, Self::Error>> + Send + '_;

  // ── Coordination ──────────────────────────────────────────────────────

  /// Resolve once every call issued before this one has finished, including
  /// calls whose callers stopped waiting after a timeout. Not subject to the
  /// call deadline.
  fn settled(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
