//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Dates are stored as `YYYY-MM-DD`, timestamps as fixed-precision RFC 3339
//! UTC strings, so both sort correctly as text. Grades, boroughs and flags are
//! stored as their published codes. Enrichment is compact JSON.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use grades_core::{
  event::{GradeUpdateEvent, RecentGrade},
  grade::{Borough, CriticalFlag, Grade, GradeEventKind},
  inspection::{Enrichment, EstablishmentSummary, InspectionDetail, Violation},
  user::{Favorite, RecentSearch, User, UserId},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Dates ───────────────────────────────────────────────────────────────────

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── Codes ───────────────────────────────────────────────────────────────────

pub fn encode_grade(g: Option<Grade>) -> Option<&'static str> {
  g.map(Grade::code)
}

/// Read-side grade decoding. Unknown stored codes read as no grade; the
/// detector is the component that reports them.
pub fn decode_grade_lenient(s: Option<&str>) -> Option<Grade> {
  Grade::from_optional_code(s).ok().flatten()
}

pub fn decode_grade(s: &str) -> Result<Grade> { Ok(Grade::from_code(s)?) }

pub fn decode_event_kind(s: &str) -> Result<GradeEventKind> { Ok(s.parse()?) }

pub fn encode_boro(b: Option<Borough>) -> Option<&'static str> {
  b.map(Borough::name)
}

pub fn decode_boro(s: Option<&str>) -> Option<Borough> {
  s.and_then(Borough::parse)
}

pub fn encode_critical_flag(f: Option<CriticalFlag>) -> Option<&'static str> {
  f.map(CriticalFlag::as_str)
}

pub fn decode_critical_flag(s: Option<&str>) -> Option<CriticalFlag> {
  s.and_then(CriticalFlag::parse)
}

// ─── Enrichment ──────────────────────────────────────────────────────────────

pub fn encode_enrichment(e: &Enrichment) -> Result<String> {
  Ok(serde_json::to_string(e)?)
}

pub fn decode_enrichment(s: Option<&str>) -> Result<Option<Enrichment>> {
  s.map(serde_json::from_str).transpose().map_err(Error::from)
}

/// Stable rendering of a trigram set for the posting table.
pub fn trigram_postings(keys: &[String]) -> BTreeSet<String> {
  keys
    .iter()
    .flat_map(|k| grades_core::normalize::trigrams(k))
    .collect()
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Columns selected for an [`EstablishmentSummary`], in
/// [`RawSummary::from_row`] order. Expects the inspection row aliased `l`.
pub const SUMMARY_COLUMNS: &str = "l.camis, l.name, l.boro, l.building, \
                                   l.street, l.zipcode, l.phone, l.latitude, \
                                   l.longitude, l.cuisine, l.inspection_date, \
                                   l.grade, l.grade_date, l.critical_flag, \
                                   l.enrichment";

/// Number of columns in [`SUMMARY_COLUMNS`].
pub const SUMMARY_WIDTH: usize = 15;

/// Raw values of the latest inspection row of an establishment.
pub struct RawSummary {
  pub camis:           String,
  pub name:            String,
  pub boro:            Option<String>,
  pub building:        Option<String>,
  pub street:          Option<String>,
  pub zipcode:         Option<String>,
  pub phone:           Option<String>,
  pub latitude:        Option<f64>,
  pub longitude:       Option<f64>,
  pub cuisine:         Option<String>,
  pub inspection_date: String,
  pub grade:           Option<String>,
  pub grade_date:      Option<String>,
  pub critical_flag:   Option<String>,
  pub enrichment:      Option<String>,
}

impl RawSummary {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      camis:           row.get(0)?,
      name:            row.get(1)?,
      boro:            row.get(2)?,
      building:        row.get(3)?,
      street:          row.get(4)?,
      zipcode:         row.get(5)?,
      phone:           row.get(6)?,
      latitude:        row.get(7)?,
      longitude:       row.get(8)?,
      cuisine:         row.get(9)?,
      inspection_date: row.get(10)?,
      grade:           row.get(11)?,
      grade_date:      row.get(12)?,
      critical_flag:   row.get(13)?,
      enrichment:      row.get(14)?,
    })
  }

  pub fn into_summary(self) -> Result<EstablishmentSummary> {
    Ok(EstablishmentSummary {
      boro:              decode_boro(self.boro.as_deref()),
      latest_inspection: decode_date(&self.inspection_date)?,
      grade:             decode_grade_lenient(self.grade.as_deref()),
      grade_date:        self.grade_date.as_deref().map(decode_date).transpose()?,
      critical_flag:     decode_critical_flag(self.critical_flag.as_deref()),
      enrichment:        decode_enrichment(self.enrichment.as_deref())?,
      camis:             self.camis,
      name:              self.name,
      building:          self.building,
      street:            self.street,
      zipcode:           self.zipcode,
      phone:             self.phone,
      latitude:          self.latitude,
      longitude:         self.longitude,
      cuisine:           self.cuisine,
    })
  }
}

/// One dated inspection row, without its violations.
pub struct RawInspection {
  pub inspection_date: String,
  pub grade:           Option<String>,
  pub grade_date:      Option<String>,
  pub critical_flag:   Option<String>,
  pub inspection_type: Option<String>,
  pub action:          Option<String>,
}

impl RawInspection {
  pub fn into_detail(self, violations: Vec<Violation>) -> Result<InspectionDetail> {
    Ok(InspectionDetail {
      inspection_date: decode_date(&self.inspection_date)?,
      grade: decode_grade_lenient(self.grade.as_deref()),
      grade_date: self.grade_date.as_deref().map(decode_date).transpose()?,
      critical_flag: decode_critical_flag(self.critical_flag.as_deref()),
      inspection_type: self.inspection_type,
      action: self.action,
      violations,
    })
  }
}

/// Columns selected for a [`GradeUpdateEvent`], aliased `e`.
pub const EVENT_COLUMNS: &str = "e.event_id, e.camis, e.inspection_date, \
                                 e.previous_grade, e.new_grade, e.kind, \
                                 e.detected_at";

pub struct RawEvent {
  pub event_id:        String,
  pub camis:           String,
  pub inspection_date: String,
  pub previous_grade:  Option<String>,
  pub new_grade:       String,
  pub kind:            String,
  pub detected_at:     String,
}

impl RawEvent {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:        row.get(0)?,
      camis:           row.get(1)?,
      inspection_date: row.get(2)?,
      previous_grade:  row.get(3)?,
      new_grade:       row.get(4)?,
      kind:            row.get(5)?,
      detected_at:     row.get(6)?,
    })
  }

  pub fn into_event(self) -> Result<GradeUpdateEvent> {
    Ok(GradeUpdateEvent {
      event_id:        Uuid::parse_str(&self.event_id)?,
      inspection_date: decode_date(&self.inspection_date)?,
      previous_grade:  self
        .previous_grade
        .as_deref()
        .map(decode_grade)
        .transpose()?,
      new_grade:       decode_grade(&self.new_grade)?,
      kind:            decode_event_kind(&self.kind)?,
      detected_at:     decode_dt(&self.detected_at)?,
      camis:           self.camis,
    })
  }
}

/// An event joined with the inspection row it was detected on.
pub struct RawRecentGrade {
  pub event:          RawEvent,
  pub name:           String,
  pub boro:           Option<String>,
  pub cuisine:        Option<String>,
  pub effective_date: String,
}

impl RawRecentGrade {
  pub fn into_recent(self) -> Result<RecentGrade> {
    Ok(RecentGrade {
      event:          self.event.into_event()?,
      name:           self.name,
      boro:           decode_boro(self.boro.as_deref()),
      cuisine:        self.cuisine,
      effective_date: decode_date(&self.effective_date)?,
    })
  }
}

pub struct RawUser {
  pub user_id:    String,
  pub created_at: String,
}

impl RawUser {
  pub fn into_user(self) -> Result<User> {
    Ok(User {
      user_id:    UserId::new(self.user_id)?,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}

pub struct RawFavorite {
  pub camis:    String,
  pub added_at: String,
}

impl RawFavorite {
  pub fn into_favorite(self) -> Result<Favorite> {
    Ok(Favorite {
      camis:    self.camis,
      added_at: decode_dt(&self.added_at)?,
    })
  }
}

pub struct RawRecentSearch {
  pub term_key:     String,
  pub display_term: String,
  pub searched_at:  String,
}

impl RawRecentSearch {
  pub fn into_recent_search(self) -> Result<RecentSearch> {
    Ok(RecentSearch {
      searched_at:  decode_dt(&self.searched_at)?,
      term_key:     self.term_key,
      display_term: self.display_term,
    })
  }
}
