//! [`SqliteStore`], the SQLite implementation of [`InspectionStore`].

use std::{
  collections::{BTreeSet, HashMap},
  path::Path,
  time::Duration,
};

use chrono::{DateTime, NaiveDate, Utc};
use grades_core::{
  detect::{
    Baseline, DetectionMode, DetectionReport, DetectionScope, ScanRow, Transition,
    scan,
  },
  event::{GradeUpdateEvent, RecentGrade},
  grade::GradeEventKind,
  inspection::{
    Enrichment, Establishment, IngestReport, NewInspection, RejectedRow, SearchHit,
    Violation,
  },
  invalidation::{Invalidation, InvalidationSet, Written},
  normalize::{normalize, similarity, trigrams},
  query::{SearchRequest, SortOrder},
  store::InspectionStore,
  user::{Favorite, RecentSearch, User, UserId, check_limit},
};
use rusqlite::{
  OptionalExtension as _, functions::FunctionFlags, params, params_from_iter,
  types::Value,
};
use tracing::{debug, info, warn};

use crate::{
  Error, Result,
  encode::{
    EVENT_COLUMNS, RawEvent, RawFavorite, RawInspection, RawRecentGrade,
    RawRecentSearch, RawSummary, RawUser, SUMMARY_COLUMNS, SUMMARY_WIDTH,
    decode_date, decode_dt, decode_grade_lenient, encode_boro,
    encode_critical_flag, encode_date, encode_dt, encode_enrichment, encode_grade,
    trigram_postings,
  },
  schema::SCHEMA,
};

const BUSY_BACKOFF: Duration = Duration::from_millis(25);

// ─── Options ─────────────────────────────────────────────────────────────────

/// Tunables of a [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
  /// Deadline for every database call.
  pub timeout:              Duration,
  /// How long SQLite itself waits on a lock before reporting busy.
  pub lock_wait:            Duration,
  /// Retries after a busy/locked failure before giving up.
  pub busy_retries:         u32,
  /// Minimum trigram similarity for a search candidate.
  pub similarity_threshold: f64,
  /// Recent searches kept per user.
  pub max_recent_searches:  usize,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      timeout:              Duration::from_secs(5),
      lock_wait:            Duration::from_millis(500),
      busy_retries:         3,
      similarity_threshold: 0.3,
      max_recent_searches:  50,
    }
  }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// An inspection store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn:    tokio_rusqlite::Connection,
  options: StoreOptions,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with(path, StoreOptions::default()).await
  }

  pub async fn open_with(
    path: impl AsRef<Path>,
    options: StoreOptions,
  ) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn, options };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store.
  pub async fn open_in_memory() -> Result<Self> {
    Self::open_in_memory_with(StoreOptions::default()).await
  }

  pub async fn open_in_memory_with(options: StoreOptions) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn, options };
    store.init_schema().await?;
    Ok(store)
  }

  pub fn options(&self) -> &StoreOptions { &self.options }

  async fn init_schema(&self) -> Result<()> {
    let lock_wait = self.options.lock_wait;
    self
      .conn
      .call(move |conn| {
        conn.busy_timeout(lock_wait)?;
        register_functions(conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run `job` on the database thread under the call deadline, retrying
  /// busy/locked failures with a linear backoff.
  async fn call<F, R>(&self, job: F) -> Result<R>
  where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Clone + Send + 'static,
    R: Send + 'static,
  {
    let mut attempts = 0;
    loop {
      attempts += 1;
      let attempt = job.clone();
      let pending = self.conn.call(move |conn| Ok(attempt(conn)));

      let outcome = match tokio::time::timeout(self.options.timeout, pending).await
      {
        Ok(done) => done.map_err(Error::from).and_then(|inner| inner),
        Err(_) => return Err(Error::Timeout(self.options.timeout)),
      };

      match outcome {
        Err(e) if e.is_busy() => {
          if attempts > self.options.busy_retries {
            return Err(Error::Busy { attempts });
          }
          warn!(attempt = attempts, error = %e, "database busy, retrying");
          tokio::time::sleep(BUSY_BACKOFF * attempts).await;
        }
        other => return other,
      }
    }
  }

  /// Execute raw SQL, bypassing every invariant the store maintains.
  #[cfg(test)]
  pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<usize> {
    self.call(move |conn| Ok(conn.execute(sql, [])?)).await
  }
}

/// SQL functions the queries rely on. Both are pure.
fn register_functions(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
  let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

  conn.create_scalar_function("trigram_similarity", 2, flags, |ctx| {
    let a: String = ctx.get(0)?;
    let b: String = ctx.get(1)?;
    Ok(similarity(&a, &b))
  })?;

  conn.create_scalar_function("grade_partition", 2, flags, |ctx| {
    let camis: String = ctx.get(0)?;
    let of = u32::try_from(ctx.get::<i64>(1)?)
      .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
    Ok(i64::from(grades_core::detect::partition_of(&camis, of)))
  })?;

  Ok(())
}

// ─── Shared helpers ──────────────────────────────────────────────────────────

fn ensure_user(conn: &rusqlite::Connection, user: &UserId) -> Result<()> {
  conn
    .query_row(
      "SELECT 1 FROM users WHERE user_id = ?1",
      params![user.as_str()],
      |_| Ok(()),
    )
    .optional()?
    .ok_or_else(|| Error::UserNotFound(user.clone()))
}

fn establishment_exists(conn: &rusqlite::Connection, camis: &str) -> Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM inspections WHERE camis = ?1 LIMIT 1",
        params![camis],
        |_| Ok(()),
      )
      .optional()?
      .is_some(),
  )
}

/// Insert an event unless the same transition is already recorded. Returns
/// the event only when a row was written.
fn insert_event(
  conn: &rusqlite::Connection,
  event: GradeUpdateEvent,
) -> Result<Option<GradeUpdateEvent>> {
  let written = conn.execute(
    "INSERT OR IGNORE INTO grade_events (
       event_id, camis, inspection_date, previous_grade, new_grade, kind,
       detected_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    params![
      event.event_id.hyphenated().to_string(),
      event.camis,
      encode_date(event.inspection_date),
      encode_grade(event.previous_grade),
      event.new_grade.code(),
      event.kind.as_str(),
      encode_dt(event.detected_at),
    ],
  )?;
  Ok((written == 1).then_some(event))
}

/// Rebuild the trigram postings of one establishment from every name key
/// it has used.
fn reindex_names(conn: &rusqlite::Connection, camis: &str) -> Result<()> {
  conn.execute("DELETE FROM name_trigrams WHERE camis = ?1", params![camis])?;

  let keys: Vec<String> = conn
    .prepare_cached("SELECT DISTINCT name_key FROM inspections WHERE camis = ?1")?
    .query_map(params![camis], |r| r.get(0))?
    .collect::<rusqlite::Result<_>>()?;

  let mut insert = conn.prepare_cached(
    "INSERT OR IGNORE INTO name_trigrams (trigram, camis) VALUES (?1, ?2)",
  )?;
  for trigram in trigram_postings(&keys) {
    insert.execute(params![trigram, camis])?;
  }
  Ok(())
}

// ─── Ingestion ───────────────────────────────────────────────────────────────

fn upsert_batch(
  conn: &mut rusqlite::Connection,
  batch: Vec<NewInspection>,
) -> Result<Written<IngestReport>> {
  let now = Utc::now();
  let now_str = encode_dt(now);
  let tx = conn.transaction()?;

  let mut report = IngestReport::default();
  let mut touched = BTreeSet::new();

  for row in batch {
    if let Err(e) = row.validate() {
      warn!(
        camis = %row.camis,
        inspection_date = %row.inspection_date,
        error = %e,
        "rejecting inspection row",
      );
      report.rejected.push(RejectedRow {
        camis:           row.camis,
        inspection_date: row.inspection_date,
        reason:          e.to_string(),
      });
      continue;
    }

    let date = encode_date(row.inspection_date);
    let stored: Option<Option<String>> = tx
      .query_row(
        "SELECT grade FROM inspections WHERE camis = ?1 AND inspection_date = ?2",
        params![row.camis, date],
        |r| r.get(0),
      )
      .optional()?;

    tx.execute(
      "INSERT INTO inspections (
         camis, inspection_date, name, name_key, boro, building, street,
         zipcode, phone, latitude, longitude, cuisine, critical_flag, grade,
         grade_date, inspection_type, action, ingested_at
       ) VALUES (
         ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
         ?17, ?18
       )
       ON CONFLICT (camis, inspection_date) DO UPDATE SET
         name            = excluded.name,
         name_key        = excluded.name_key,
         boro            = excluded.boro,
         building        = excluded.building,
         street          = excluded.street,
         zipcode         = excluded.zipcode,
         phone           = excluded.phone,
         latitude        = excluded.latitude,
         longitude       = excluded.longitude,
         cuisine         = excluded.cuisine,
         critical_flag   = excluded.critical_flag,
         grade           = excluded.grade,
         grade_date      = excluded.grade_date,
         inspection_type = excluded.inspection_type,
         action          = excluded.action,
         ingested_at     = excluded.ingested_at",
      params![
        row.camis,
        date,
        row.name,
        normalize(&row.name),
        encode_boro(row.boro),
        row.building,
        row.street,
        row.zipcode,
        row.phone,
        row.latitude,
        row.longitude,
        row.cuisine,
        encode_critical_flag(row.critical_flag),
        encode_grade(row.grade),
        row.grade_date.map(encode_date),
        row.inspection_type,
        row.action,
        now_str,
      ],
    )?;

    if stored.is_some() {
      report.updated += 1;
    } else {
      report.inserted += 1;
    }

    tx.execute(
      "DELETE FROM violations WHERE camis = ?1 AND inspection_date = ?2",
      params![row.camis, date],
    )?;
    for violation in &row.violations {
      report.violations += tx.execute(
        "INSERT OR IGNORE INTO violations (camis, inspection_date, code, description)
         VALUES (?1, ?2, ?3, ?4)",
        params![row.camis, date, violation.code, violation.description],
      )?;
    }

    match stored {
      Some(previous) => {
        if let Some(event) = reconcile_watermark(&tx, &row, previous.as_deref(), now)? {
          report.finalized.push(event);
        }
      }
      None => {
        if rewind_watermark(&tx, &row.camis, row.inspection_date)? {
          report.rewound += 1;
        }
      }
    }

    touched.insert(row.camis);
  }

  for camis in &touched {
    reindex_names(&tx, camis)?;
  }
  tx.commit()?;

  report.establishments = touched.into_iter().collect();
  info!(
    inserted = report.inserted,
    updated = report.updated,
    rejected = report.rejected.len(),
    finalized = report.finalized.len(),
    rewound = report.rewound,
    "ingested inspection batch",
  );

  let mut invalidate = InvalidationSet::new();
  if report.inserted + report.updated > 0 {
    invalidate.push(Invalidation::search_results());
    invalidate.push(Invalidation::grade_feed());
  }
  Ok(Written::new(report, invalidate))
}

/// Reopen an establishment's scanned history when a new record lands on or
/// before its watermark.
///
/// Events after the new record are dropped with the watermark, so the next
/// incremental pass rescans the whole history. Events before it are derived
/// again unchanged and deduplicated by the transition index.
fn rewind_watermark(
  conn: &rusqlite::Connection,
  camis: &str,
  inspection_date: NaiveDate,
) -> Result<bool> {
  let through: Option<String> = conn
    .query_row(
      "SELECT through_date FROM detection_watermarks WHERE camis = ?1",
      params![camis],
      |r| r.get(0),
    )
    .optional()?;
  let Some(through) = through.as_deref().map(decode_date).transpose()? else {
    return Ok(false);
  };
  if inspection_date > through {
    return Ok(false);
  }

  let dropped = conn.execute(
    "DELETE FROM grade_events WHERE camis = ?1 AND inspection_date > ?2",
    params![camis, encode_date(inspection_date)],
  )?;
  conn.execute(
    "DELETE FROM detection_watermarks WHERE camis = ?1",
    params![camis],
  )?;
  debug!(
    camis,
    %inspection_date,
    %through,
    dropped,
    "late record rewound detection watermark",
  );
  Ok(true)
}

/// Keep an already-scanned record consistent with its watermark when its
/// grade is rewritten in place.
///
/// A pending grade replaced by a final one on or before the watermark emits a
/// `pending_finalized` event. Records past the watermark are left to the next
/// incremental pass.
fn reconcile_watermark(
  conn: &rusqlite::Connection,
  row: &NewInspection,
  stored_grade: Option<&str>,
  now: DateTime<Utc>,
) -> Result<Option<GradeUpdateEvent>> {
  let Some(new) = row.grade else { return Ok(None) };
  let previous = decode_grade_lenient(stored_grade);
  if previous == Some(new) {
    return Ok(None);
  }

  let through: Option<String> = conn
    .query_row(
      "SELECT through_date FROM detection_watermarks WHERE camis = ?1",
      params![row.camis],
      |r| r.get(0),
    )
    .optional()?;
  let Some(through) = through.as_deref().map(decode_date).transpose()? else {
    return Ok(None);
  };
  if row.inspection_date > through {
    return Ok(None);
  }

  if row.inspection_date == through {
    conn.execute(
      "UPDATE detection_watermarks
       SET last_grade = ?2, has_baseline = 1, updated_at = ?3
       WHERE camis = ?1",
      params![row.camis, new.code(), encode_dt(now)],
    )?;
  }

  let Some(pending) = previous.filter(|p| p.is_pending()) else {
    return Ok(None);
  };
  if !new.is_final() {
    return Ok(None);
  }

  let transition = Transition {
    camis:           row.camis.clone(),
    inspection_date: row.inspection_date,
    previous:        Some(pending),
    new,
    kind:            GradeEventKind::PendingFinalized,
  };
  insert_event(conn, transition.into_event(now))
}

// ─── Maintenance ─────────────────────────────────────────────────────────────

fn attach_enrichment(
  conn: &mut rusqlite::Connection,
  camis: String,
  enrichment: Enrichment,
) -> Result<Written<()>> {
  let json = encode_enrichment(&enrichment)?;
  let updated = conn.execute(
    "UPDATE inspections SET enrichment = ?2 WHERE camis = ?1",
    params![camis, json],
  )?;
  if updated == 0 {
    return Err(Error::EstablishmentNotFound(camis));
  }
  Ok(Written::new(
    (),
    InvalidationSet::of(Invalidation::search_results()),
  ))
}

fn rebuild_names(conn: &mut rusqlite::Connection) -> Result<Written<usize>> {
  let tx = conn.transaction()?;

  let rows: Vec<(String, String, String, String)> = tx
    .prepare("SELECT camis, inspection_date, name, name_key FROM inspections")?
    .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
    .collect::<rusqlite::Result<_>>()?;

  let mut changed = 0;
  {
    let mut update = tx.prepare(
      "UPDATE inspections SET name_key = ?3 WHERE camis = ?1 AND inspection_date = ?2",
    )?;
    for (camis, date, name, stored_key) in &rows {
      let key = normalize(name);
      if &key != stored_key {
        update.execute(params![camis, date, key])?;
        changed += 1;
      }
    }
  }

  tx.execute("DELETE FROM name_trigrams", [])?;
  let establishments: Vec<String> = tx
    .prepare("SELECT DISTINCT camis FROM inspections")?
    .query_map([], |r| r.get(0))?
    .collect::<rusqlite::Result<_>>()?;
  for camis in &establishments {
    reindex_names(&tx, camis)?;
  }
  tx.commit()?;

  info!(
    records = rows.len(),
    changed,
    establishments = establishments.len(),
    "rebuilt name keys",
  );

  let invalidate = if changed > 0 {
    InvalidationSet::of(Invalidation::search_results())
  } else {
    InvalidationSet::new()
  };
  Ok(Written::new(changed, invalidate))
}

fn delete_old_violations(
  conn: &mut rusqlite::Connection,
  before: NaiveDate,
) -> Result<Written<usize>> {
  let removed = conn.execute(
    "DELETE FROM violations WHERE inspection_date < ?1",
    params![encode_date(before)],
  )?;
  info!(removed, before = %before, "pruned violations");
  // No cached read includes violations.
  Ok(Written::clean(removed))
}

// ─── Detection ───────────────────────────────────────────────────────────────

/// Materialize the scope where a plain predicate cannot express it.
fn prepare_scope(conn: &rusqlite::Connection, scope: &DetectionScope) -> Result<()> {
  if let DetectionScope::Establishments { camis } = scope {
    conn.execute(
      "CREATE TEMP TABLE IF NOT EXISTS detection_scope (camis TEXT PRIMARY KEY)",
      [],
    )?;
    conn.execute("DELETE FROM temp.detection_scope", [])?;
    let mut insert = conn
      .prepare("INSERT OR IGNORE INTO temp.detection_scope (camis) VALUES (?1)")?;
    for id in camis {
      insert.execute(params![id])?;
    }
  }
  Ok(())
}

fn release_scope(conn: &rusqlite::Connection, scope: &DetectionScope) -> Result<()> {
  if matches!(scope, DetectionScope::Establishments { .. }) {
    conn.execute("DELETE FROM temp.detection_scope", [])?;
  }
  Ok(())
}

/// SQL predicate restricting `column` to the scope, with its parameters.
fn scope_predicate(scope: &DetectionScope, column: &str) -> (String, Vec<Value>) {
  match scope {
    DetectionScope::All => ("1 = 1".to_owned(), Vec::new()),
    DetectionScope::Establishments { .. } => (
      format!("{column} IN (SELECT camis FROM temp.detection_scope)"),
      Vec::new(),
    ),
    DetectionScope::Partition { index, of } => (
      format!("grade_partition({column}, ?) = ?"),
      vec![
        Value::Integer(i64::from(*of)),
        Value::Integer(i64::from(*index)),
      ],
    ),
  }
}

fn detect(
  conn: &mut rusqlite::Connection,
  mode: DetectionMode,
  scope: DetectionScope,
) -> Result<Written<DetectionReport>> {
  scope.validate()?;
  let now = Utc::now();
  let tx = conn.transaction()?;
  prepare_scope(&tx, &scope)?;

  let (in_scope, bound) = scope_predicate(&scope, "camis");
  if mode == DetectionMode::FullResync {
    let cleared = tx.execute(
      &format!("DELETE FROM grade_events WHERE {in_scope}"),
      params_from_iter(bound.iter()),
    )?;
    tx.execute(
      &format!("DELETE FROM detection_watermarks WHERE {in_scope}"),
      params_from_iter(bound.iter()),
    )?;
    debug!(cleared, "cleared derived events for resync");
  }

  let seeds: HashMap<String, Baseline> = tx
    .prepare(&format!(
      "SELECT camis, last_grade, has_baseline FROM detection_watermarks
       WHERE {in_scope}"
    ))?
    .query_map(params_from_iter(bound.iter()), |r| {
      let camis: String = r.get(0)?;
      let last: Option<String> = r.get(1)?;
      let has_baseline: bool = r.get(2)?;
      let baseline = if has_baseline {
        Baseline::After(decode_grade_lenient(last.as_deref()))
      } else {
        Baseline::Empty
      };
      Ok((camis, baseline))
    })?
    .collect::<rusqlite::Result<_>>()?;

  let (in_scope_i, bound_i) = scope_predicate(&scope, "i.camis");
  let raw_rows: Vec<(String, String, Option<String>)> = tx
    .prepare(&format!(
      "SELECT i.camis, i.inspection_date, i.grade
       FROM inspections i
       LEFT JOIN detection_watermarks w ON w.camis = i.camis
       WHERE {in_scope_i}
         AND (w.through_date IS NULL OR i.inspection_date > w.through_date)
       ORDER BY i.camis, i.inspection_date"
    ))?
    .query_map(params_from_iter(bound_i.iter()), |r| {
      Ok((r.get(0)?, r.get(1)?, r.get(2)?))
    })?
    .collect::<rusqlite::Result<_>>()?;

  let rows = raw_rows
    .into_iter()
    .map(|(camis, date, grade)| {
      Ok(ScanRow {
        camis,
        inspection_date: decode_date(&date)?,
        grade,
      })
    })
    .collect::<Result<Vec<_>>>()?;

  let pass = scan(rows, &seeds);

  let mut events = Vec::new();
  for transition in pass.transitions {
    if let Some(event) = insert_event(&tx, transition.into_event(now))? {
      events.push(event);
    }
  }

  {
    let mut upsert = tx.prepare(
      "INSERT INTO detection_watermarks (
         camis, through_date, last_grade, has_baseline, updated_at
       ) VALUES (?1, ?2, ?3, ?4, ?5)
       ON CONFLICT (camis) DO UPDATE SET
         through_date = excluded.through_date,
         last_grade   = excluded.last_grade,
         has_baseline = excluded.has_baseline,
         updated_at   = excluded.updated_at",
    )?;
    let stamp = encode_dt(now);
    for mark in &pass.watermarks {
      let (last, has_baseline) = match mark.baseline {
        Baseline::Empty => (None, false),
        Baseline::After(grade) => (encode_grade(grade), true),
      };
      upsert.execute(params![
        mark.camis,
        encode_date(mark.through),
        last,
        has_baseline,
        stamp,
      ])?;
    }
  }

  release_scope(&tx, &scope)?;
  tx.commit()?;

  let report = DetectionReport {
    mode,
    establishments: pass.establishments,
    records: pass.records,
    events,
    anomalies: pass.anomalies,
  };
  info!(
    ?mode,
    establishments = report.establishments,
    records = report.records,
    events = report.events.len(),
    anomalies = report.anomalies.count,
    "grade detection pass complete",
  );

  let invalidate = if mode == DetectionMode::FullResync || !report.events.is_empty()
  {
    InvalidationSet::of(Invalidation::grade_feed())
  } else {
    InvalidationSet::new()
  };
  Ok(Written::new(report, invalidate))
}

fn load_events(conn: &rusqlite::Connection, camis: &str) -> Result<Vec<GradeUpdateEvent>> {
  let raws: Vec<RawEvent> = conn
    .prepare(&format!(
      "SELECT {EVENT_COLUMNS} FROM grade_events e
       WHERE e.camis = ?1
       ORDER BY e.inspection_date, e.detected_at"
    ))?
    .query_map(params![camis], RawEvent::from_row)?
    .collect::<rusqlite::Result<_>>()?;
  raws.into_iter().map(RawEvent::into_event).collect()
}

fn load_recently_graded(
  conn: &rusqlite::Connection,
  since: NaiveDate,
  limit: usize,
) -> Result<Vec<RecentGrade>> {
  let raws: Vec<RawRecentGrade> = conn
    .prepare(&format!(
      "SELECT {EVENT_COLUMNS}, i.name, i.boro, i.cuisine,
              COALESCE(i.grade_date, i.inspection_date) AS effective_date
       FROM grade_events e
       JOIN inspections i
         ON i.camis = e.camis AND i.inspection_date = e.inspection_date
       WHERE COALESCE(i.grade_date, i.inspection_date) >= ?1
       ORDER BY effective_date DESC, e.camis ASC, e.detected_at DESC
       LIMIT ?2"
    ))?
    .query_map(
      params![encode_date(since), i64::try_from(limit).unwrap_or(i64::MAX)],
      |r| {
        Ok(RawRecentGrade {
          event:          RawEvent::from_row(r)?,
          name:           r.get(7)?,
          boro:           r.get(8)?,
          cuisine:        r.get(9)?,
          effective_date: r.get(10)?,
        })
      },
    )?
    .collect::<rusqlite::Result<_>>()?;
  raws.into_iter().map(RawRecentGrade::into_recent).collect()
}

// ─── Search ──────────────────────────────────────────────────────────────────

fn run_search(
  conn: &rusqlite::Connection,
  request: &SearchRequest,
  threshold: f64,
) -> Result<Vec<SearchHit>> {
  // Positional parameters, pushed in the order their `?` appear in the text.
  let mut bound: Vec<Value> = Vec::new();
  let query = request.query();

  let candidates = match query {
    Some(key) => {
      let grams = trigrams(key);
      let holes = vec!["?"; grams.len()].join(", ");
      bound.extend(grams.into_iter().map(Value::Text));
      format!(
        "WHERE i.camis IN (SELECT camis FROM name_trigrams WHERE trigram IN ({holes}))"
      )
    }
    None => String::new(),
  };

  let score = match query {
    Some(key) => {
      bound.push(Value::Text(key.to_owned()));
      "trigram_similarity(latest.name_key, ?)"
    }
    None => "NULL",
  };

  let mut conds: Vec<String> = Vec::new();
  if let Some(key) = query {
    conds.push("(l.score >= ? OR instr(l.name_key, ?) > 0)".to_owned());
    bound.push(Value::Real(threshold));
    bound.push(Value::Text(key.to_owned()));
  }

  let filters = request.filters();
  if let Some(borough) = filters.borough {
    conds.push("l.boro = ?".to_owned());
    bound.push(Value::Text(borough.name().to_owned()));
  }
  if let Some(grade) = filters.grade {
    let grades = grade.grades();
    conds.push(format!(
      "l.grade IN ({})",
      vec!["?"; grades.len()].join(", ")
    ));
    bound.extend(grades.into_iter().map(|g| Value::Text(g.code().to_owned())));
  }
  if let Some(cuisine) = &filters.cuisine {
    conds.push("lower(substr(l.cuisine, 1, length(?))) = lower(?)".to_owned());
    bound.push(Value::Text(cuisine.clone()));
    bound.push(Value::Text(cuisine.clone()));
  }
  if let Some(zipcode) = &filters.zipcode {
    conds.push("l.zipcode = ?".to_owned());
    bound.push(Value::Text(zipcode.clone()));
  }
  let where_clause = if conds.is_empty() {
    "1 = 1".to_owned()
  } else {
    conds.join(" AND ")
  };

  let order = match (request.sort(), query) {
    (SortOrder::Relevance, Some(key)) => {
      bound.push(Value::Text(key.to_owned()));
      bound.push(Value::Text(key.to_owned()));
      "l.score DESC, (substr(l.name_key, 1, length(?)) = ?) DESC, l.camis ASC"
    }
    (SortOrder::Relevance, None) => "l.camis ASC",
    (SortOrder::NameAsc, _) => "l.name_key ASC, l.camis ASC",
    (SortOrder::NameDesc, _) => "l.name_key DESC, l.camis ASC",
    (SortOrder::DateDesc, _) => "l.inspection_date DESC, l.camis ASC",
    (SortOrder::GradeAsc, _) => {
      "CASE l.grade WHEN 'A' THEN 0 WHEN 'B' THEN 1 WHEN 'C' THEN 2 ELSE 3 END,
       l.name_key ASC, l.camis ASC"
    }
  };

  let page = request.page();
  bound.push(Value::Integer(i64::from(page.size())));
  bound.push(Value::Integer(
    i64::try_from(page.offset()).unwrap_or(i64::MAX),
  ));

  let sql = format!(
    "WITH latest AS (
       SELECT * FROM (
         SELECT i.*, ROW_NUMBER() OVER (
           PARTITION BY i.camis
           ORDER BY i.inspection_date DESC, i.grade_date DESC
         ) AS rn
         FROM inspections i
         {candidates}
       )
       WHERE rn = 1
     ),
     scored AS (
       SELECT latest.*, {score} AS score FROM latest
     )
     SELECT {SUMMARY_COLUMNS}, l.score
     FROM scored l
     WHERE {where_clause}
     ORDER BY {order}
     LIMIT ? OFFSET ?"
  );

  let raws: Vec<(RawSummary, Option<f64>)> = conn
    .prepare(&sql)?
    .query_map(params_from_iter(bound.iter()), |r| {
      Ok((RawSummary::from_row(r)?, r.get(SUMMARY_WIDTH)?))
    })?
    .collect::<rusqlite::Result<_>>()?;

  raws
    .into_iter()
    .map(|(raw, score)| {
      Ok(SearchHit {
        establishment: raw.into_summary()?,
        score,
      })
    })
    .collect()
}

fn load_establishment(
  conn: &rusqlite::Connection,
  camis: &str,
) -> Result<Option<Establishment>> {
  let latest: Option<RawSummary> = conn
    .query_row(
      &format!(
        "SELECT {SUMMARY_COLUMNS} FROM inspections l
         WHERE l.camis = ?1
         ORDER BY l.inspection_date DESC, l.grade_date DESC
         LIMIT 1"
      ),
      params![camis],
      RawSummary::from_row,
    )
    .optional()?;
  let Some(latest) = latest else { return Ok(None) };

  let history: Vec<RawInspection> = conn
    .prepare(
      "SELECT inspection_date, grade, grade_date, critical_flag,
              inspection_type, action
       FROM inspections
       WHERE camis = ?1
       ORDER BY inspection_date DESC",
    )?
    .query_map(params![camis], |r| {
      Ok(RawInspection {
        inspection_date: r.get(0)?,
        grade:           r.get(1)?,
        grade_date:      r.get(2)?,
        critical_flag:   r.get(3)?,
        inspection_type: r.get(4)?,
        action:          r.get(5)?,
      })
    })?
    .collect::<rusqlite::Result<_>>()?;

  let mut violations: HashMap<String, Vec<Violation>> = HashMap::new();
  let mut stmt = conn.prepare(
    "SELECT inspection_date, code, description FROM violations
     WHERE camis = ?1
     ORDER BY inspection_date, code",
  )?;
  let rows = stmt.query_map(params![camis], |r| {
    Ok((
      r.get::<_, String>(0)?,
      Violation {
        code:        r.get(1)?,
        description: r.get(2)?,
      },
    ))
  })?;
  for row in rows {
    let (date, violation) = row?;
    violations.entry(date).or_default().push(violation);
  }

  let inspections = history
    .into_iter()
    .map(|raw| {
      let cited = violations.remove(&raw.inspection_date).unwrap_or_default();
      raw.into_detail(cited)
    })
    .collect::<Result<_>>()?;

  Ok(Some(Establishment {
    summary: latest.into_summary()?,
    inspections,
  }))
}

// ─── Users ───────────────────────────────────────────────────────────────────

fn insert_user(conn: &mut rusqlite::Connection, user: UserId) -> Result<Written<User>> {
  let tx = conn.transaction()?;
  tx.execute(
    "INSERT OR IGNORE INTO users (user_id, created_at) VALUES (?1, ?2)",
    params![user.as_str(), encode_dt(Utc::now())],
  )?;
  let raw = tx.query_row(
    "SELECT user_id, created_at FROM users WHERE user_id = ?1",
    params![user.as_str()],
    |r| {
      Ok(RawUser {
        user_id:    r.get(0)?,
        created_at: r.get(1)?,
      })
    },
  )?;
  tx.commit()?;
  // A fresh user has nothing cached: deletion already cleared its prefix.
  Ok(Written::clean(raw.into_user()?))
}

fn remove_user(conn: &mut rusqlite::Connection, user: UserId) -> Result<Written<bool>> {
  let deleted = conn.execute(
    "DELETE FROM users WHERE user_id = ?1",
    params![user.as_str()],
  )?;
  Ok(Written::new(
    deleted == 1,
    InvalidationSet::of(Invalidation::user(&user)),
  ))
}

fn insert_favorite(
  conn: &mut rusqlite::Connection,
  user: UserId,
  camis: String,
) -> Result<Written<bool>> {
  let tx = conn.transaction()?;
  ensure_user(&tx, &user)?;
  if !establishment_exists(&tx, &camis)? {
    return Err(Error::EstablishmentNotFound(camis));
  }
  let added = tx.execute(
    "INSERT OR IGNORE INTO favorites (user_id, camis, added_at) VALUES (?1, ?2, ?3)",
    params![user.as_str(), camis, encode_dt(Utc::now())],
  )? == 1;
  tx.commit()?;

  let invalidate = if added {
    InvalidationSet::of(Invalidation::favorites(&user))
  } else {
    InvalidationSet::new()
  };
  Ok(Written::new(added, invalidate))
}

fn delete_favorite(
  conn: &mut rusqlite::Connection,
  user: UserId,
  camis: String,
) -> Result<Written<bool>> {
  let tx = conn.transaction()?;
  ensure_user(&tx, &user)?;
  let removed = tx.execute(
    "DELETE FROM favorites WHERE user_id = ?1 AND camis = ?2",
    params![user.as_str(), camis],
  )? == 1;
  tx.commit()?;

  let invalidate = if removed {
    InvalidationSet::of(Invalidation::favorites(&user))
  } else {
    InvalidationSet::new()
  };
  Ok(Written::new(removed, invalidate))
}

fn load_favorites(conn: &rusqlite::Connection, user: &UserId) -> Result<Vec<Favorite>> {
  ensure_user(conn, user)?;
  let raws: Vec<RawFavorite> = conn
    .prepare(
      "SELECT camis, added_at FROM favorites
       WHERE user_id = ?1
       ORDER BY added_at DESC, camis ASC",
    )?
    .query_map(params![user.as_str()], |r| {
      Ok(RawFavorite {
        camis:    r.get(0)?,
        added_at: r.get(1)?,
      })
    })?
    .collect::<rusqlite::Result<_>>()?;
  raws.into_iter().map(RawFavorite::into_favorite).collect()
}

fn upsert_search(
  conn: &mut rusqlite::Connection,
  user: UserId,
  term: String,
  cap: usize,
) -> Result<Written<RecentSearch>> {
  let key = normalize(&term);
  if key.is_empty() {
    return Err(grades_core::Error::EmptySearchTerm(term).into());
  }
  let display = term.trim().to_owned();
  let stamp = encode_dt(Utc::now());

  let tx = conn.transaction()?;
  ensure_user(&tx, &user)?;
  tx.execute(
    "INSERT INTO recent_searches (user_id, term_key, display_term, searched_at, seq)
     VALUES (
       ?1, ?2, ?3, ?4,
       (SELECT COALESCE(MAX(seq), 0) + 1 FROM recent_searches WHERE user_id = ?1)
     )
     ON CONFLICT (user_id, term_key) DO UPDATE SET
       display_term = excluded.display_term,
       searched_at  = excluded.searched_at,
       seq          = excluded.seq",
    params![user.as_str(), key, display, stamp],
  )?;
  let trimmed = tx.execute(
    "DELETE FROM recent_searches
     WHERE user_id = ?1
       AND seq NOT IN (
         SELECT seq FROM recent_searches
         WHERE user_id = ?1
         ORDER BY seq DESC
         LIMIT ?2
       )",
    params![user.as_str(), i64::try_from(cap).unwrap_or(i64::MAX)],
  )?;
  tx.commit()?;
  if trimmed > 0 {
    debug!(user = %user, trimmed, "trimmed recent searches");
  }

  Ok(Written::new(
    RecentSearch {
      term_key:     key,
      display_term: display,
      searched_at:  decode_dt(&stamp)?,
    },
    InvalidationSet::of(Invalidation::recent_searches(&user)),
  ))
}

fn load_recent_searches(
  conn: &rusqlite::Connection,
  user: &UserId,
  limit: usize,
) -> Result<Vec<RecentSearch>> {
  ensure_user(conn, user)?;
  let raws: Vec<RawRecentSearch> = conn
    .prepare(
      "SELECT term_key, display_term, searched_at FROM recent_searches
       WHERE user_id = ?1
       ORDER BY seq DESC
       LIMIT ?2",
    )?
    .query_map(
      params![user.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
      |r| {
        Ok(RawRecentSearch {
          term_key:     r.get(0)?,
          display_term: r.get(1)?,
          searched_at:  r.get(2)?,
        })
      },
    )?
    .collect::<rusqlite::Result<_>>()?;
  raws.into_iter().map(RawRecentSearch::into_recent_search).collect()
}

// ─── InspectionStore impl ────────────────────────────────────────────────────

impl InspectionStore for SqliteStore {
  type Error = Error;

  // ── Ingestion & maintenance ───────────────────────────────────────────────

  async fn upsert_inspections(
    &self,
    batch: Vec<NewInspection>,
  ) -> Result<Written<IngestReport>> {
    self.call(move |conn| upsert_batch(conn, batch)).await
  }

  async fn set_enrichment(
    &self,
    camis: String,
    enrichment: Enrichment,
  ) -> Result<Written<()>> {
    self
      .call(move |conn| attach_enrichment(conn, camis, enrichment))
      .await
  }

  async fn rebuild_name_keys(&self) -> Result<Written<usize>> {
    self.call(rebuild_names).await
  }

  async fn prune_violations(&self, before: NaiveDate) -> Result<Written<usize>> {
    self
      .call(move |conn| delete_old_violations(conn, before))
      .await
  }

  // ── Grade changes ─────────────────────────────────────────────────────────

  async fn detect_grade_changes(
    &self,
    mode: DetectionMode,
    scope: DetectionScope,
  ) -> Result<Written<DetectionReport>> {
    self.call(move |conn| detect(conn, mode, scope)).await
  }

  async fn grade_events(&self, camis: String) -> Result<Vec<GradeUpdateEvent>> {
    self.call(move |conn| load_events(conn, &camis)).await
  }

  async fn recently_graded(
    &self,
    since: NaiveDate,
    limit: usize,
  ) -> Result<Vec<RecentGrade>> {
    self
      .call(move |conn| load_recently_graded(conn, since, limit))
      .await
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
    let request = request.clone();
    let threshold = self.options.similarity_threshold;
    self
      .call(move |conn| run_search(conn, &request, threshold))
      .await
  }

  async fn get_establishment(&self, camis: String) -> Result<Option<Establishment>> {
    self
      .call(move |conn| load_establishment(conn, &camis))
      .await
  }

  // ── Users ─────────────────────────────────────────────────────────────────

  async fn register_user(&self, user: UserId) -> Result<Written<User>> {
    self.call(move |conn| insert_user(conn, user)).await
  }

  async fn delete_user(&self, user: UserId) -> Result<Written<bool>> {
    self.call(move |conn| remove_user(conn, user)).await
  }

  async fn add_favorite(&self, user: UserId, camis: String) -> Result<Written<bool>> {
    self
      .call(move |conn| insert_favorite(conn, user, camis))
      .await
  }

  async fn remove_favorite(
    &self,
    user: UserId,
    camis: String,
  ) -> Result<Written<bool>> {
    self
      .call(move |conn| delete_favorite(conn, user, camis))
      .await
  }

  async fn list_favorites(&self, user: UserId) -> Result<Vec<Favorite>> {
    self.call(move |conn| load_favorites(conn, &user)).await
  }

  async fn record_search(
    &self,
    user: UserId,
    term: String,
  ) -> Result<Written<RecentSearch>> {
    let cap = self.options.max_recent_searches;
    self
      .call(move |conn| upsert_search(conn, user, term, cap))
      .await
  }

  async fn list_recent_searches(
    &self,
    user: UserId,
    limit: usize,
  ) -> Result<Vec<RecentSearch>> {
    check_limit(limit)?;
    self
      .call(move |conn| load_recent_searches(conn, &user, limit))
      .await
  }

  // ── Coordination ──────────────────────────────────────────────────────────

  async fn settled(&self) -> Result<()> {
    // Calls run in order on the database thread.
    self.conn.call(|_| Ok(())).await?;
    Ok(())
  }
}
