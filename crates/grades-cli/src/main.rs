//! `grades`: maintenance binary for the inspection grade store.
//!
//! Reads `grades.toml` (or the path given with `--config`) and `GRADES_*`
//! environment variables, opens the SQLite store, runs one command and
//! prints its result as JSON.
//!
//! ```text
//! grades ingest --file batch.json
//! grades detect --partitioned
//! grades search --name "joe's pizza" --boro Manhattan --grade A
//! GRADES_CACHE__ENABLED=false grades recent --days 7
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use chrono::{Months, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use grades_core::{
  detect::{DetectionMode, DetectionScope},
  inspection::{Enrichment, NewInspection},
  query::SearchParams,
};
use grades_service::{GradeService, MemoryCache, Settings};
use grades_store_sqlite::SqliteStore;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "grades", version, about = "Restaurant inspection grade store")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "grades.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Upsert a JSON array of inspection records, then detect grade changes
  /// for the establishments it touched.
  Ingest {
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,
  },

  /// Run grade-change detection.
  Detect {
    /// Rebuild every event in scope instead of scanning past the watermarks.
    #[arg(long)]
    full_resync: bool,

    /// Restrict the pass to these establishments.
    #[arg(long = "establishment", value_name = "CAMIS", conflicts_with = "partitioned")]
    establishments: Vec<String>,

    /// Split the pass across the configured partitions.
    #[arg(long)]
    partitioned: bool,
  },

  /// Search establishments by name and filters.
  Search {
    #[arg(long)]
    name:     Option<String>,
    #[arg(long)]
    boro:     Option<String>,
    /// A single grade or `pending`.
    #[arg(long)]
    grade:    Option<String>,
    #[arg(long)]
    cuisine:  Option<String>,
    #[arg(long)]
    zipcode:  Option<String>,
    #[arg(long)]
    sort:     Option<String>,
    #[arg(long)]
    page:     Option<u32>,
    #[arg(long)]
    per_page: Option<u32>,
  },

  /// Full record of one establishment.
  Show { camis: String },

  /// Grade changes effective within the last N days.
  Recent {
    #[arg(long, default_value_t = 7)]
    days:  u32,
    #[arg(long, default_value_t = 50)]
    limit: usize,
  },

  /// Attach third-party enrichment from a JSON file.
  Enrich {
    camis: String,
    #[arg(short, long, value_name = "FILE")]
    file:  PathBuf,
  },

  /// Recompute every establishment's name key and trigram postings.
  RebuildNames,

  /// Delete violations from inspections older than N years.
  PruneViolations {
    #[arg(long, default_value_t = 3)]
    years: u32,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let settings: Settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("GRADES")
        .prefix_separator("_")
        .separator("__"),
    )
    .build()
    .context("failed to read config file")?
    .try_deserialize()
    .context("failed to deserialise Settings")?;

  let store_path = expand_tilde(&settings.store_path);
  let store = SqliteStore::open_with(&store_path, settings.store_options())
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let service = GradeService::new(store, Arc::new(MemoryCache::new()), &settings);

  run(&service, cli.command).await
}

async fn run(service: &GradeService<SqliteStore>, command: Command) -> anyhow::Result<()> {
  match command {
    Command::Ingest { file } => {
      let batch: Vec<NewInspection> = read_json(&file)?;
      let outcome = service.ingest(batch).await.context("ingestion failed")?;
      print_json(&outcome)
    }

    Command::Detect {
      full_resync,
      establishments,
      partitioned,
    } => {
      let mode = if full_resync {
        DetectionMode::FullResync
      } else {
        DetectionMode::Incremental
      };
      let report = if partitioned {
        service.detect_partitioned(mode).await
      } else if establishments.is_empty() {
        service.detect(mode, DetectionScope::All).await
      } else {
        let scope = DetectionScope::Establishments {
          camis: establishments,
        };
        service.detect(mode, scope).await
      }
      .context("detection failed")?;
      print_json(&report)
    }

    Command::Search {
      name,
      boro,
      grade,
      cuisine,
      zipcode,
      sort,
      page,
      per_page,
    } => {
      let params = SearchParams {
        name,
        boro,
        grade,
        cuisine,
        zipcode,
        sort,
        page,
        per_page,
      };
      let hits = service.search(params).await.context("search failed")?;
      print_json(&hits)
    }

    Command::Show { camis } => {
      let establishment = service
        .get_establishment(camis)
        .await
        .context("lookup failed")?;
      print_json(&establishment)
    }

    Command::Recent { days, limit } => {
      let feed = service
        .recently_graded(days, limit)
        .await
        .context("failed to load recently graded establishments")?;
      print_json(&feed)
    }

    Command::Enrich { camis, file } => {
      let enrichment: Enrichment = read_json(&file)?;
      service
        .set_enrichment(camis.clone(), enrichment)
        .await
        .with_context(|| format!("failed to enrich {camis}"))?;
      print_json(&camis)
    }

    Command::RebuildNames => {
      let rebuilt = service
        .rebuild_name_keys()
        .await
        .context("name key rebuild failed")?;
      print_json(&rebuilt)
    }

    Command::PruneViolations { years } => {
      let before = years_ago(years);
      let pruned = service
        .prune_violations(before)
        .await
        .context("violation pruning failed")?;
      tracing::info!(%before, pruned, "pruned violations");
      print_json(&pruned)
    }
  }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
  let raw = std::fs::read_to_string(path)
    .with_context(|| format!("reading {}", path.display()))?;
  serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  let out = serde_json::to_string_pretty(value).context("failed to encode output")?;
  println!("{out}");
  Ok(())
}

fn years_ago(years: u32) -> NaiveDate {
  let today = Utc::now().date_naive();
  today
    .checked_sub_months(Months::new(years.saturating_mul(12)))
    .unwrap_or(NaiveDate::MIN)
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
