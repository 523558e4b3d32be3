//! Inspection records, violations, and the read models built from them.
//!
//! An establishment has no row of its own: it is the set of inspection
//! records sharing a `camis`, and its current state is its latest record.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  grade::{Borough, CriticalFlag, Grade},
};

// ─── Ingestion input ─────────────────────────────────────────────────────────

/// A violation cited during one inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
  pub code:        String,
  pub description: Option<String>,
}

/// One inspection row as supplied by the ingestion pipeline, keyed by
/// `(camis, inspection_date)`. The search key is derived by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInspection {
  pub camis:           String,
  pub inspection_date: NaiveDate,
  /// Doing-business-as name, as published.
  pub name:            String,
  pub boro:            Option<Borough>,
  pub building:        Option<String>,
  pub street:          Option<String>,
  pub zipcode:         Option<String>,
  pub phone:           Option<String>,
  pub latitude:        Option<f64>,
  pub longitude:       Option<f64>,
  pub cuisine:         Option<String>,
  pub critical_flag:   Option<CriticalFlag>,
  pub grade:           Option<Grade>,
  pub grade_date:      Option<NaiveDate>,
  pub inspection_type: Option<String>,
  pub action:          Option<String>,
  #[serde(default)]
  pub violations:      Vec<Violation>,
}

impl NewInspection {
  /// Convenience constructor with every optional field empty.
  pub fn new(
    camis: impl Into<String>,
    inspection_date: NaiveDate,
    name: impl Into<String>,
  ) -> Self {
    Self {
      camis: camis.into(),
      inspection_date,
      name: name.into(),
      boro: None,
      building: None,
      street: None,
      zipcode: None,
      phone: None,
      latitude: None,
      longitude: None,
      cuisine: None,
      critical_flag: None,
      grade: None,
      grade_date: None,
      inspection_type: None,
      action: None,
      violations: Vec::new(),
    }
  }

  /// Check the record-level invariants the store relies on.
  pub fn validate(&self) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidRecord {
      camis:           self.camis.clone(),
      inspection_date: self.inspection_date,
      reason:          reason.to_owned(),
    };

    if self.camis.trim().is_empty() {
      return Err(invalid("empty establishment id"));
    }
    if let Some(graded) = self.grade_date
      && graded < self.inspection_date
    {
      return Err(invalid("grade date precedes inspection date"));
    }
    let finite = |v: Option<f64>| v.is_none_or(f64::is_finite);
    if !finite(self.latitude) || !finite(self.longitude) {
      return Err(invalid("non-finite coordinates"));
    }
    Ok(())
  }
}

// ─── Enrichment ──────────────────────────────────────────────────────────────

/// Third-party place data attached to an establishment after the fact. The
/// lookups themselves happen outside this workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
  pub google_place_id: Option<String>,
  pub foursquare_id:   Option<String>,
  pub yelp_id:         Option<String>,
  pub rating:          Option<f32>,
  pub review_count:    Option<u32>,
  pub price_level:     Option<u8>,
  pub website:         Option<String>,
  /// Human-readable opening hours, one entry per day.
  #[serde(default)]
  pub hours:           Vec<String>,
  pub fetched_at:      Option<DateTime<Utc>>,
}

// ─── Read models ─────────────────────────────────────────────────────────────

/// The current state of an establishment: its latest inspection record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstablishmentSummary {
  pub camis:             String,
  pub name:              String,
  pub boro:              Option<Borough>,
  pub building:          Option<String>,
  pub street:            Option<String>,
  pub zipcode:           Option<String>,
  pub phone:             Option<String>,
  pub latitude:          Option<f64>,
  pub longitude:         Option<f64>,
  pub cuisine:           Option<String>,
  pub latest_inspection: NaiveDate,
  pub grade:             Option<Grade>,
  pub grade_date:        Option<NaiveDate>,
  pub critical_flag:     Option<CriticalFlag>,
  pub enrichment:        Option<Enrichment>,
}

/// One search result. `score` is the trigram similarity when the search had
/// query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
  #[serde(flatten)]
  pub establishment: EstablishmentSummary,
  pub score:         Option<f64>,
}

/// One dated inspection with its violations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionDetail {
  pub inspection_date: NaiveDate,
  pub grade:           Option<Grade>,
  pub grade_date:      Option<NaiveDate>,
  pub critical_flag:   Option<CriticalFlag>,
  pub inspection_type: Option<String>,
  pub action:          Option<String>,
  pub violations:      Vec<Violation>,
}

/// Full establishment view: latest state plus history, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Establishment {
  pub summary:     EstablishmentSummary,
  pub inspections: Vec<InspectionDetail>,
}

// ─── Ingestion report ────────────────────────────────────────────────────────

/// A row the store refused, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRow {
  pub camis:           String,
  pub inspection_date: NaiveDate,
  pub reason:          String,
}

/// Outcome of one ingestion batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
  pub inserted:       usize,
  pub updated:        usize,
  pub violations:     usize,
  pub rejected:       Vec<RejectedRow>,
  /// Distinct establishments touched by the batch, sorted.
  pub establishments: Vec<String>,
  /// Pending grades finalized in place on already-scanned records.
  pub finalized:      Vec<crate::event::GradeUpdateEvent>,
  /// Establishments whose scanned history a late record reopened.
  pub rewound:        usize,
}
