//! Error types for `grades-core`.

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

/// Coarse classification shared by every error in the workspace. The serving
/// layer maps these onto wire status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Malformed caller input; correctable by the caller.
  Validation,
  /// No establishment or user for the given id.
  NotFound,
  /// A uniqueness rule was violated on a non-idempotent path.
  Conflict,
  /// The store did not answer before its deadline.
  Timeout,
  /// Connection or transaction failure.
  Unavailable,
  Internal,
}

impl ErrorKind {
  /// Whether a caller may retry the same request unchanged.
  pub fn is_retryable(self) -> bool {
    matches!(self, Self::Timeout | Self::Unavailable)
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid {field} filter: {value:?}")]
  InvalidFilter { field: &'static str, value: String },

  #[error("invalid page: {0}")]
  InvalidPage(String),

  #[error("limit {got} out of range 1..={max}")]
  InvalidLimit { got: usize, max: usize },

  #[error("unknown grade code: {0:?}")]
  UnknownGrade(String),

  #[error("unknown sort order: {0:?}")]
  UnknownSort(String),

  #[error("invalid user id: {0}")]
  InvalidUserId(&'static str),

  #[error("search term {0:?} is empty after normalization")]
  EmptySearchTerm(String),

  #[error("invalid inspection record {camis}@{inspection_date}: {reason}")]
  InvalidRecord {
    camis:           String,
    inspection_date: NaiveDate,
    reason:          String,
  },

  #[error("invalid detection scope: {0}")]
  InvalidScope(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Serialization(_) => ErrorKind::Internal,
      _ => ErrorKind::Validation,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
