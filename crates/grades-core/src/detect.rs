//! Grade transition detection over ordered inspection histories.
//!
//! The store streams one scan ordered by `(camis, inspection_date)` through
//! [`scan`], which folds it in a single pass: each establishment is a
//! contiguous partition, and within it every record is compared against the
//! last validly-graded predecessor. The fold also produces the per
//! establishment [`Watermark`]s that let the next incremental pass resume
//! without rereading history.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  event::GradeUpdateEvent,
  grade::{Grade, GradeEventKind},
};

/// Anomaly examples kept in a summary; the count keeps going past this.
pub const MAX_ANOMALY_EXAMPLES: usize = 10;

// ─── Mode & scope ────────────────────────────────────────────────────────────

/// How a detection pass treats previously derived events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
  /// Resume after each establishment's watermark.
  Incremental,
  /// Clear events and watermarks for the scope, then re-derive everything.
  FullResync,
}

/// Which establishments a detection pass covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionScope {
  All,
  Establishments { camis: Vec<String> },
  /// Establishments whose [`partition_of`] equals `index`.
  Partition { index: u32, of: u32 },
}

impl DetectionScope {
  pub fn validate(&self) -> Result<()> {
    match self {
      Self::Partition { of: 0, .. } => {
        Err(Error::InvalidScope("partition count must be positive".into()))
      }
      Self::Partition { index, of } if index >= of => Err(Error::InvalidScope(
        format!("partition {index} out of range for {of} partitions"),
      )),
      _ => Ok(()),
    }
  }

  pub fn contains(&self, camis: &str) -> bool {
    match self {
      Self::All => true,
      Self::Establishments { camis: ids } => ids.iter().any(|id| id == camis),
      Self::Partition { index, of } => partition_of(camis, *of) == *index,
    }
  }
}

/// Stable partition of an establishment id (64-bit FNV-1a, reduced mod `of`).
///
/// The store registers the same function in SQL, so the value must never
/// depend on process state.
pub fn partition_of(camis: &str, of: u32) -> u32 {
  const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
  const PRIME: u64 = 0x0000_0100_0000_01b3;

  if of == 0 {
    return 0;
  }
  let hash = camis
    .bytes()
    .fold(OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(PRIME));
  (hash % u64::from(of)) as u32
}

// ─── Scan input / output ─────────────────────────────────────────────────────

/// One record of the ordered scan. The grade is still the raw stored code:
/// corrupt values are only discovered here.
#[derive(Debug, Clone)]
pub struct ScanRow {
  pub camis:           String,
  pub inspection_date: NaiveDate,
  pub grade:           Option<String>,
}

/// A detected change, before it is stamped into a [`GradeUpdateEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transition {
  pub camis:           String,
  pub inspection_date: NaiveDate,
  pub previous:        Option<Grade>,
  pub new:             Grade,
  pub kind:            GradeEventKind,
}

impl Transition {
  pub fn into_event(self, detected_at: DateTime<Utc>) -> GradeUpdateEvent {
    GradeUpdateEvent {
      event_id: Uuid::new_v4(),
      camis: self.camis,
      inspection_date: self.inspection_date,
      previous_grade: self.previous,
      new_grade: self.new,
      kind: self.kind,
      detected_at,
    }
  }
}

/// What the next record of an establishment is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Baseline {
  /// No valid record seen yet: the next one only establishes the baseline.
  #[default]
  Empty,
  /// The grade of the last valid record, which may be blank.
  After(Option<Grade>),
}

/// The point up to which an establishment's history has been scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
  pub camis:    String,
  pub through:  NaiveDate,
  /// Seed for the next incremental pass.
  pub baseline: Baseline,
}

/// A record skipped because its stored grade is outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeAnomaly {
  pub camis:           String,
  pub inspection_date: NaiveDate,
  pub raw_grade:       String,
}

/// Count of anomalies plus the first few examples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalySummary {
  pub count:    usize,
  pub examples: Vec<GradeAnomaly>,
}

impl AnomalySummary {
  pub fn record(&mut self, anomaly: GradeAnomaly) {
    self.count += 1;
    if self.examples.len() < MAX_ANOMALY_EXAMPLES {
      self.examples.push(anomaly);
    }
  }

  pub fn merge(&mut self, other: AnomalySummary) {
    self.count += other.count;
    let room = MAX_ANOMALY_EXAMPLES.saturating_sub(self.examples.len());
    self.examples.extend(other.examples.into_iter().take(room));
  }

  pub fn is_empty(&self) -> bool { self.count == 0 }
}

/// Everything one pass over the ordered scan produced.
#[derive(Debug, Default)]
pub struct Scan {
  pub transitions:    Vec<Transition>,
  pub watermarks:     Vec<Watermark>,
  pub anomalies:      AnomalySummary,
  pub records:        usize,
  pub establishments: usize,
}

/// Summary of a detection pass, as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
  pub mode:           DetectionMode,
  pub establishments: usize,
  pub records:        usize,
  pub events:         Vec<GradeUpdateEvent>,
  pub anomalies:      AnomalySummary,
}

impl DetectionReport {
  pub fn empty(mode: DetectionMode) -> Self {
    Self {
      mode,
      establishments: 0,
      records: 0,
      events: Vec::new(),
      anomalies: AnomalySummary::default(),
    }
  }

  /// Fold the report of another partition into this one.
  pub fn absorb(&mut self, other: DetectionReport) {
    self.establishments += other.establishments;
    self.records += other.records;
    self.events.extend(other.events);
    self.anomalies.merge(other.anomalies);
  }
}

// ─── The fold ────────────────────────────────────────────────────────────────

struct Cursor {
  camis:    String,
  through:  NaiveDate,
  baseline: Baseline,
}

/// Fold an ordered scan into transitions and watermarks in one pass.
///
/// `rows` must be ordered by `camis`, then `inspection_date`. `seeds` holds
/// the baseline of establishments resuming from a watermark; any other
/// establishment starts [`Baseline::Empty`], so its first valid record is
/// never an event.
pub fn scan<I>(rows: I, seeds: &HashMap<String, Baseline>) -> Scan
where
  I: IntoIterator<Item = ScanRow>,
{
  let mut out = Scan::default();
  let mut cursor: Option<Cursor> = None;

  for row in rows {
    out.records += 1;

    if cursor.as_ref().is_none_or(|c| c.camis != row.camis) {
      if let Some(done) = cursor.take() {
        out.watermarks.push(done.into_watermark());
      }
      out.establishments += 1;
      cursor = Some(Cursor {
        camis:    row.camis.clone(),
        through:  row.inspection_date,
        baseline: seeds.get(&row.camis).copied().unwrap_or_default(),
      });
    }
    let Some(current) = cursor.as_mut() else { continue };
    debug_assert!(row.inspection_date >= current.through);
    current.through = row.inspection_date;

    let grade = match Grade::from_optional_code(row.grade.as_deref()) {
      Ok(grade) => grade,
      Err(_) => {
        let raw = row.grade.unwrap_or_default();
        tracing::warn!(
          camis = %row.camis,
          inspection_date = %row.inspection_date,
          raw_grade = %raw,
          "skipping record with unknown grade code",
        );
        out.anomalies.record(GradeAnomaly {
          camis:           row.camis,
          inspection_date: row.inspection_date,
          raw_grade:       raw,
        });
        continue;
      }
    };

    if let (Baseline::After(previous), Some(new)) = (current.baseline, grade)
      && previous != Some(new)
    {
      out.transitions.push(Transition {
        camis: row.camis,
        inspection_date: row.inspection_date,
        previous,
        new,
        kind: GradeEventKind::classify(previous, new),
      });
    }
    current.baseline = Baseline::After(grade);
  }

  if let Some(done) = cursor {
    out.watermarks.push(done.into_watermark());
  }
  out
}

impl Cursor {
  fn into_watermark(self) -> Watermark {
    Watermark {
      camis:    self.camis,
      through:  self.through,
      baseline: self.baseline,
    }
  }
}
