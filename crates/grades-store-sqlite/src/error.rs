//! Error type for `grades-store-sqlite`.

use std::time::Duration;

use grades_core::{ErrorKind, store::StoreError, user::UserId};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] grades_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("database call exceeded {0:?}")]
  Timeout(Duration),

  #[error("database still busy after {attempts} attempts")]
  Busy { attempts: u32 },

  #[error("establishment not found: {0}")]
  EstablishmentNotFound(String),

  #[error("user not found: {0}")]
  UserNotFound(UserId),
}

impl Error {
  fn sqlite_code(&self) -> Option<ErrorCode> {
    let inner = match self {
      Self::Sqlite(e) | Self::Database(tokio_rusqlite::Error::Rusqlite(e)) => e,
      _ => return None,
    };
    inner.sqlite_error_code()
  }

  /// Transient lock contention, worth retrying.
  pub fn is_busy(&self) -> bool {
    matches!(
      self.sqlite_code(),
      Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
  }
}

impl StoreError for Error {
  fn kind(&self) -> ErrorKind {
    match self {
      Self::Core(e) => e.kind(),
      Self::Timeout(_) => ErrorKind::Timeout,
      Self::Busy { .. } => ErrorKind::Unavailable,
      Self::Database(tokio_rusqlite::Error::ConnectionClosed) => {
        ErrorKind::Unavailable
      }
      Self::EstablishmentNotFound(_) | Self::UserNotFound(_) => {
        ErrorKind::NotFound
      }
      _ if self.is_busy() => ErrorKind::Unavailable,
      _ if self.sqlite_code() == Some(ErrorCode::ConstraintViolation) => {
        ErrorKind::Conflict
      }
      _ => ErrorKind::Internal,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
