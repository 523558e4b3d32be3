//! Error type for `grades-service`.

use grades_core::{ErrorKind, store::StoreError, user::UserId};
use thiserror::Error;

use crate::cache::CacheError;

#[derive(Debug, Error)]
pub enum Error {
  #[error("{0}")]
  Core(#[from] grades_core::Error),

  #[error("store error: {source}")]
  Store {
    kind:   ErrorKind,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("establishment not found: {0}")]
  EstablishmentNotFound(String),

  #[error("user not found: {0}")]
  UserNotFound(UserId),

  /// The write happened but stale cache entries may remain.
  #[error("cache invalidation failed after the write committed: {0}")]
  CacheInvalidation(#[source] CacheError),

  #[error("detection task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

impl Error {
  pub fn store<E: StoreError>(e: E) -> Self {
    Self::Store {
      kind:   e.kind(),
      source: Box::new(e),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Core(e) => e.kind(),
      Self::Store { kind, .. } => *kind,
      Self::EstablishmentNotFound(_) | Self::UserNotFound(_) => ErrorKind::NotFound,
      Self::CacheInvalidation(_) | Self::Task(_) => ErrorKind::Internal,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
