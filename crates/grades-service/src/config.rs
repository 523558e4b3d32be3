//! Runtime settings, deserialised from `grades.toml` and `GRADES_*`
//! environment variables by the binary.

use std::{path::PathBuf, time::Duration};

use grades_store_sqlite::StoreOptions;
use serde::Deserialize;

use crate::cache::Ttl;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub store_path:           PathBuf,
  pub db_timeout_ms:        u64,
  pub db_lock_wait_ms:      u64,
  pub busy_retries:         u32,
  pub similarity_threshold: f64,
  pub max_recent_searches:  usize,
  /// Lock stripes and parallel passes used by partitioned detection.
  pub detection_partitions: u32,
  pub cache:                CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub enabled:         bool,
  pub search_ttl_secs: u64,
  pub feed_ttl_secs:   u64,
}

impl Default for Settings {
  fn default() -> Self {
    let store = StoreOptions::default();
    Self {
      store_path:           PathBuf::from("grades.db"),
      db_timeout_ms:        5_000,
      db_lock_wait_ms:      500,
      busy_retries:         store.busy_retries,
      similarity_threshold: store.similarity_threshold,
      max_recent_searches:  store.max_recent_searches,
      detection_partitions: 8,
      cache:                CacheSettings::default(),
    }
  }
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      enabled:         true,
      search_ttl_secs: 300,
      feed_ttl_secs:   300,
    }
  }
}

impl Settings {
  pub fn store_options(&self) -> StoreOptions {
    StoreOptions {
      timeout:              Duration::from_millis(self.db_timeout_ms),
      lock_wait:            Duration::from_millis(self.db_lock_wait_ms),
      busy_retries:         self.busy_retries,
      similarity_threshold: self.similarity_threshold,
      max_recent_searches:  self.max_recent_searches.max(1),
    }
  }

  pub fn partitions(&self) -> u32 { self.detection_partitions.max(1) }
}

impl CacheSettings {
  pub fn search_ttl(&self) -> Ttl {
    Ttl::For(Duration::from_secs(self.search_ttl_secs))
  }

  pub fn feed_ttl(&self) -> Ttl {
    Ttl::For(Duration::from_secs(self.feed_ttl_secs))
  }
}
