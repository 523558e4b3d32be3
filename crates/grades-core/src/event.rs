//! Grade update events: derived, append-only facts about grade changes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::grade::{Borough, Grade, GradeEventKind};

/// A detected grade change for one inspection of one establishment.
///
/// Events are never updated in place; corrections are new events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeUpdateEvent {
  pub event_id:        Uuid,
  pub camis:           String,
  pub inspection_date: NaiveDate,
  pub previous_grade:  Option<Grade>,
  pub new_grade:       Grade,
  pub kind:            GradeEventKind,
  /// When the detector recorded the event. Not used for feed ordering.
  pub detected_at:     DateTime<Utc>,
}

/// One entry of the "recently graded" feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentGrade {
  pub event:          GradeUpdateEvent,
  pub name:           String,
  pub boro:           Option<Borough>,
  pub cuisine:        Option<String>,
  /// Official grade date, or the inspection date when none was published.
  /// The feed is ordered by this date.
  pub effective_date: NaiveDate,
}
