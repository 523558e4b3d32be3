//! Closed vocabularies of the inspection dataset: grades, grade-event kinds,
//! boroughs, and critical flags.
//!
//! External codes are parsed into these enums once, at the ingestion
//! boundary. Everything past that boundary works with the typed values.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Grade ───────────────────────────────────────────────────────────────────

/// An official health grade or one of the not-yet-final markers.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Grade {
  #[serde(rename = "A")]
  A,
  #[serde(rename = "B")]
  B,
  #[serde(rename = "C")]
  C,
  /// `P`: grade pending, issued on re-opening after a closure.
  #[serde(rename = "P")]
  ReopeningPending,
  /// `Z`: grade pending.
  #[serde(rename = "Z")]
  Pending,
  /// `N`: not yet graded.
  #[serde(rename = "N")]
  NotYetGraded,
}

impl Grade {
  /// The grades the `pending` filter synonym expands to.
  pub const PENDING_SET: [Grade; 3] =
    [Grade::ReopeningPending, Grade::Pending, Grade::NotYetGraded];

  /// The single-letter code used by the city's dataset.
  pub fn code(self) -> &'static str {
    match self {
      Self::A => "A",
      Self::B => "B",
      Self::C => "C",
      Self::ReopeningPending => "P",
      Self::Pending => "Z",
      Self::NotYetGraded => "N",
    }
  }

  /// Parse a dataset code. Surrounding whitespace and case are ignored.
  pub fn from_code(raw: &str) -> Result<Self> {
    match raw.trim().to_ascii_uppercase().as_str() {
      "A" => Ok(Self::A),
      "B" => Ok(Self::B),
      "C" => Ok(Self::C),
      "P" => Ok(Self::ReopeningPending),
      "Z" => Ok(Self::Pending),
      "N" => Ok(Self::NotYetGraded),
      _ => Err(Error::UnknownGrade(raw.to_owned())),
    }
  }

  /// Parse an optional dataset code where blank means "no grade".
  pub fn from_optional_code(raw: Option<&str>) -> Result<Option<Self>> {
    match raw.map(str::trim) {
      None | Some("") => Ok(None),
      Some(code) => Self::from_code(code).map(Some),
    }
  }

  pub fn is_pending(self) -> bool { Self::PENDING_SET.contains(&self) }

  pub fn is_final(self) -> bool { matches!(self, Self::A | Self::B | Self::C) }
}

impl fmt::Display for Grade {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.code())
  }
}

impl FromStr for Grade {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> { Self::from_code(s) }
}

// ─── Grade event kind ────────────────────────────────────────────────────────

/// How a grade change is classified by the transition detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeEventKind {
  /// Any change that is not a pending grade being finalized.
  NewGrade,
  /// A pending or not-yet-graded marker replaced by A, B, or C.
  PendingFinalized,
}

impl GradeEventKind {
  /// Classify the change `previous -> current`.
  pub fn classify(previous: Option<Grade>, current: Grade) -> Self {
    match previous {
      Some(prev) if prev.is_pending() && current.is_final() => {
        Self::PendingFinalized
      }
      _ => Self::NewGrade,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::NewGrade => "new_grade",
      Self::PendingFinalized => "pending_finalized",
    }
  }
}

impl FromStr for GradeEventKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "new_grade" => Ok(Self::NewGrade),
      "pending_finalized" => Ok(Self::PendingFinalized),
      other => Err(Error::InvalidFilter {
        field: "event kind",
        value: other.to_owned(),
      }),
    }
  }
}

// ─── Borough ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Borough {
  Manhattan,
  Brooklyn,
  Queens,
  Bronx,
  #[serde(rename = "Staten Island")]
  StatenIsland,
}

impl Borough {
  pub const ALL: [Borough; 5] = [
    Borough::Manhattan,
    Borough::Brooklyn,
    Borough::Queens,
    Borough::Bronx,
    Borough::StatenIsland,
  ];

  /// The spelling used by the city's dataset and stored in the `boro` column.
  pub fn name(self) -> &'static str {
    match self {
      Self::Manhattan => "Manhattan",
      Self::Brooklyn => "Brooklyn",
      Self::Queens => "Queens",
      Self::Bronx => "Bronx",
      Self::StatenIsland => "Staten Island",
    }
  }

  /// Case-, space- and punctuation-insensitive lookup
  /// (`"staten island"`, `"Staten_Island"` and `"STATENISLAND"` all match).
  pub fn parse(raw: &str) -> Option<Self> {
    let folded: String = raw
      .chars()
      .filter(char::is_ascii_alphabetic)
      .map(|c| c.to_ascii_lowercase())
      .collect();
    Self::ALL.into_iter().find(|b| {
      b.name()
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_lowercase())
        .eq(folded.chars())
    })
  }
}

impl fmt::Display for Borough {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

// ─── Critical flag ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriticalFlag {
  Critical,
  #[serde(rename = "Not Critical")]
  NotCritical,
  #[serde(rename = "Not Applicable")]
  NotApplicable,
}

impl CriticalFlag {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Critical => "Critical",
      Self::NotCritical => "Not Critical",
      Self::NotApplicable => "Not Applicable",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "critical" | "y" => Some(Self::Critical),
      "not critical" | "n" => Some(Self::NotCritical),
      "not applicable" | "n/a" => Some(Self::NotApplicable),
      _ => None,
    }
  }
}
