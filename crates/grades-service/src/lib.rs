//! Service layer for the restaurant grades store.
//!
//! [`GradeService`] composes an [`InspectionStore`] with the result cache,
//! applies invalidations after every write, serializes detection per
//! partition, and runs incremental detection after each ingestion batch.
//!
//! [`InspectionStore`]: grades_core::store::InspectionStore

pub mod cache;
pub mod config;
pub mod error;
pub mod service;

pub use cache::{CacheBackend, CacheError, MemoryCache, ResultCache, Ttl};
pub use config::{CacheSettings, Settings};
pub use error::{Error, Result};
pub use service::{GradeService, IngestOutcome};
