//! Integration tests for `SqliteStore` against an in-memory database.

use std::{collections::BTreeSet, time::Duration};

use chrono::NaiveDate;
use grades_core::{
  ErrorKind,
  detect::{DetectionMode, DetectionScope},
  event::GradeUpdateEvent,
  grade::{Borough, Grade, GradeEventKind},
  inspection::{Enrichment, NewInspection, Violation},
  invalidation::{CacheKey, Invalidation},
  query::SearchParams,
  store::{InspectionStore, StoreError},
  user::UserId,
};

use crate::{Error, SqliteStore, StoreOptions};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn date(s: &str) -> NaiveDate { s.parse().unwrap() }

fn record(camis: &str, on: &str, name: &str, grade: Option<Grade>) -> NewInspection {
  let mut row = NewInspection::new(camis, date(on), name);
  row.grade = grade;
  row
}

fn located(mut row: NewInspection, boro: Borough) -> NewInspection {
  row.boro = Some(boro);
  row
}

fn user(id: &str) -> UserId { UserId::new(id).unwrap() }

/// Event identity without the generated id and timestamp.
fn transitions(
  events: &[GradeUpdateEvent],
) -> BTreeSet<(String, NaiveDate, Option<Grade>, Grade, &'static str)> {
  events
    .iter()
    .map(|e| {
      (
        e.camis.clone(),
        e.inspection_date,
        e.previous_grade,
        e.new_grade,
        e.kind.as_str(),
      )
    })
    .collect()
}

async fn all_events(s: &SqliteStore, ids: &[&str]) -> Vec<GradeUpdateEvent> {
  let mut out = Vec::new();
  for id in ids {
    out.extend(s.grade_events((*id).to_owned()).await.unwrap());
  }
  out
}

async fn detect(s: &SqliteStore, mode: DetectionMode) -> Vec<GradeUpdateEvent> {
  s.detect_grade_changes(mode, DetectionScope::All)
    .await
    .unwrap()
    .value
    .events
}

// ─── Ingestion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn ingest_and_read_back_history() {
  let s = store().await;

  let mut first = located(
    record("41000001", "2023-05-02", "Joe's Pizzeria", Some(Grade::A)),
    Borough::Manhattan,
  );
  first.violations = vec![Violation {
    code:        "10F".into(),
    description: Some("Non-food contact surface".into()),
  }];
  let mut second = located(
    record("41000001", "2024-02-11", "Joe's Pizzeria", Some(Grade::B)),
    Borough::Manhattan,
  );
  second.grade_date = Some(date("2024-02-15"));
  second.violations = vec![
    Violation {
      code:        "04L".into(),
      description: Some("Evidence of mice".into()),
    },
    Violation {
      code:        "08A".into(),
      description: None,
    },
  ];

  let written = s.upsert_inspections(vec![first, second]).await.unwrap();
  let report = written.value;
  assert_eq!(report.inserted, 2);
  assert_eq!(report.violations, 3);
  assert_eq!(report.establishments, vec!["41000001".to_owned()]);
  assert!(written.invalidate.iter().any(|i| *i == Invalidation::search_results()));

  let est = s
    .get_establishment("41000001".into())
    .await
    .unwrap()
    .expect("establishment exists");
  assert_eq!(est.summary.grade, Some(Grade::B));
  assert_eq!(est.summary.latest_inspection, date("2024-02-11"));
  assert_eq!(est.summary.boro, Some(Borough::Manhattan));
  assert_eq!(est.inspections.len(), 2);
  assert_eq!(est.inspections[0].violations.len(), 2);
  assert_eq!(est.inspections[1].violations[0].code, "10F");
}

#[tokio::test]
async fn unknown_establishment_is_none() {
  let s = store().await;
  assert!(s.get_establishment("nope".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn rows_with_grade_date_before_inspection_are_rejected() {
  let s = store().await;
  let mut bad = record("41000002", "2024-03-01", "Bad Dates", Some(Grade::A));
  bad.grade_date = Some(date("2024-02-01"));
  let good = record("41000003", "2024-03-01", "Good Dates", Some(Grade::A));

  let report = s.upsert_inspections(vec![bad, good]).await.unwrap().value;
  assert_eq!(report.inserted, 1);
  assert_eq!(report.rejected.len(), 1);
  assert_eq!(report.rejected[0].camis, "41000002");
  assert!(s.get_establishment("41000002".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn reingesting_a_row_updates_in_place() {
  let s = store().await;
  let row = record("41000004", "2024-03-01", "Cafe One", None);
  s.upsert_inspections(vec![row.clone()]).await.unwrap();

  let mut again = row;
  again.name = "Café Uno".into();
  let report = s.upsert_inspections(vec![again]).await.unwrap().value;
  assert_eq!((report.inserted, report.updated), (0, 1));

  let est = s.get_establishment("41000004".into()).await.unwrap().unwrap();
  assert_eq!(est.summary.name, "Café Uno");
  assert_eq!(est.inspections.len(), 1);
}

// ─── Search ──────────────────────────────────────────────────────────────────

async fn seeded_for_search() -> SqliteStore {
  let s = store().await;
  let mut pizza = located(
    record("1", "2024-01-10", "Joe's Pizzeria", Some(Grade::A)),
    Borough::Manhattan,
  );
  pizza.cuisine = Some("Pizza".into());
  pizza.zipcode = Some("10001".into());

  let mut twin = located(
    record("2", "2024-01-10", "Joe's Pizzeria", Some(Grade::B)),
    Borough::Brooklyn,
  );
  twin.cuisine = Some("Pizza/Italian".into());

  let mut sushi = located(
    record("3", "2024-01-10", "Sushi Palace", Some(Grade::Pending)),
    Borough::Manhattan,
  );
  sushi.cuisine = Some("Japanese".into());

  // Graded A once, B at the latest inspection.
  let old = located(
    record("4", "2023-01-10", "Burger Barn", Some(Grade::A)),
    Borough::Queens,
  );
  let new = located(
    record("4", "2024-01-10", "Burger Barn", Some(Grade::B)),
    Borough::Queens,
  );

  s.upsert_inspections(vec![pizza, twin, sushi, old, new])
    .await
    .unwrap();
  s
}

fn params(name: Option<&str>) -> SearchParams {
  SearchParams {
    name: name.map(str::to_owned),
    ..Default::default()
  }
}

fn ids(hits: &[grades_core::inspection::SearchHit]) -> Vec<&str> {
  hits.iter().map(|h| h.establishment.camis.as_str()).collect()
}

#[tokio::test]
async fn fuzzy_search_respects_borough() {
  let s = seeded_for_search().await;
  let request = SearchParams {
    boro: Some("manhattan".into()),
    ..params(Some("Joes Pizza"))
  }
  .into_request()
  .unwrap();

  let hits = s.search(&request).await.unwrap();
  assert_eq!(ids(&hits), vec!["1"]);
  assert!(hits[0].score.unwrap() > 0.5);
}

#[tokio::test]
async fn fuzzy_search_ranks_by_similarity() {
  let s = seeded_for_search().await;
  let request = params(Some("joe's pizzeria")).into_request().unwrap();
  let hits = s.search(&request).await.unwrap();
  // Equal scores fall back to id order; unrelated names are excluded.
  assert_eq!(ids(&hits), vec!["1", "2"]);
}

#[tokio::test]
async fn substring_matches_are_accepted() {
  let s = seeded_for_search().await;
  let request = params(Some("palace")).into_request().unwrap();
  assert_eq!(ids(&s.search(&request).await.unwrap()), vec!["3"]);
}

#[tokio::test]
async fn pending_grade_filter_matches_pending_codes() {
  let s = seeded_for_search().await;
  let request = SearchParams {
    grade: Some("pending".into()),
    ..params(None)
  }
  .into_request()
  .unwrap();
  assert_eq!(ids(&s.search(&request).await.unwrap()), vec!["3"]);
}

#[tokio::test]
async fn filters_apply_to_the_latest_inspection() {
  let s = seeded_for_search().await;
  let request = SearchParams {
    grade: Some("A".into()),
    ..params(None)
  }
  .into_request()
  .unwrap();
  assert_eq!(ids(&s.search(&request).await.unwrap()), vec!["1"]);
}

#[tokio::test]
async fn cuisine_prefix_and_zipcode_filters() {
  let s = seeded_for_search().await;
  let by_cuisine = SearchParams {
    cuisine: Some("PIZZA".into()),
    ..params(None)
  }
  .into_request()
  .unwrap();
  assert_eq!(ids(&s.search(&by_cuisine).await.unwrap()), vec!["1", "2"]);

  let by_zip = SearchParams {
    zipcode: Some("10001".into()),
    ..params(None)
  }
  .into_request()
  .unwrap();
  assert_eq!(ids(&s.search(&by_zip).await.unwrap()), vec!["1"]);
}

#[tokio::test]
async fn sort_orders() {
  let s = seeded_for_search().await;
  let sorted = |sort: &str| {
    SearchParams {
      sort: Some(sort.into()),
      ..params(None)
    }
    .into_request()
    .unwrap()
  };

  let by_name = s.search(&sorted("name_asc")).await.unwrap();
  assert_eq!(ids(&by_name), vec!["4", "1", "2", "3"]);

  let by_grade = s.search(&sorted("grade_asc")).await.unwrap();
  assert_eq!(ids(&by_grade), vec!["1", "4", "2", "3"]);
}

#[tokio::test]
async fn no_match_is_an_empty_page() {
  let s = seeded_for_search().await;
  let request = params(Some("zzzz qqqq")).into_request().unwrap();
  assert!(s.search(&request).await.unwrap().is_empty());
}

#[tokio::test]
async fn pages_are_disjoint_and_complete() {
  let s = store().await;
  let rows = (0..7)
    .map(|n| record(&format!("5000{n}"), "2024-01-10", &format!("Taco {n}"), None))
    .collect();
  s.upsert_inspections(rows).await.unwrap();

  let mut seen = BTreeSet::new();
  let mut sizes = Vec::new();
  for page in 1..=3 {
    let request = SearchParams {
      page: Some(page),
      per_page: Some(3),
      ..params(Some("taco"))
    }
    .into_request()
    .unwrap();
    let hits = s.search(&request).await.unwrap();
    sizes.push(hits.len());
    for hit in hits {
      assert!(seen.insert(hit.establishment.camis), "pages overlap");
    }
  }
  assert_eq!(sizes, vec![3, 3, 1]);
  assert_eq!(seen.len(), 7);
}

// ─── Detection ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn pending_then_final_is_one_finalized_event() {
  let s = store().await;
  s.upsert_inspections(vec![
    record("6", "2024-01-10", "Deli", Some(Grade::Pending)),
    record("6", "2024-03-01", "Deli", Some(Grade::A)),
  ])
  .await
  .unwrap();

  let events = detect(&s, DetectionMode::Incremental).await;
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].kind, GradeEventKind::PendingFinalized);
  assert_eq!(events[0].previous_grade, Some(Grade::Pending));
  assert_eq!(events[0].new_grade, Grade::A);
  assert_eq!(events[0].inspection_date, date("2024-03-01"));
}

#[tokio::test]
async fn grade_changes_and_repeats() {
  let s = store().await;
  s.upsert_inspections(vec![
    record("7", "2024-01-10", "Diner", Some(Grade::A)),
    record("7", "2024-06-01", "Diner", Some(Grade::B)),
    record("8", "2024-01-10", "Bistro", Some(Grade::A)),
    record("8", "2024-06-01", "Bistro", Some(Grade::A)),
  ])
  .await
  .unwrap();

  let events = detect(&s, DetectionMode::Incremental).await;
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].camis, "7");
  assert_eq!(events[0].kind, GradeEventKind::NewGrade);
  assert_eq!(events[0].previous_grade, Some(Grade::A));

  // Nothing new: a second incremental pass is a no-op.
  let written = s
    .detect_grade_changes(DetectionMode::Incremental, DetectionScope::All)
    .await
    .unwrap();
  assert!(written.value.events.is_empty());
  assert_eq!(written.value.records, 0);
  assert!(written.invalidate.is_empty());
}

fn history() -> Vec<NewInspection> {
  vec![
    record("9", "2023-01-10", "Noodle Bar", Some(Grade::Pending)),
    record("9", "2023-02-10", "Noodle Bar", Some(Grade::B)),
    record("9", "2023-08-10", "Noodle Bar", None),
    record("9", "2024-01-10", "Noodle Bar", Some(Grade::A)),
    record("10", "2023-03-01", "Taqueria", Some(Grade::C)),
    record("10", "2023-09-01", "Taqueria", Some(Grade::NotYetGraded)),
    record("10", "2024-02-01", "Taqueria", Some(Grade::A)),
  ]
}

#[tokio::test]
async fn full_resync_is_repeatable() {
  let s = store().await;
  s.upsert_inspections(history()).await.unwrap();

  detect(&s, DetectionMode::FullResync).await;
  let first = transitions(&all_events(&s, &["9", "10"]).await);
  detect(&s, DetectionMode::FullResync).await;
  let second = transitions(&all_events(&s, &["9", "10"]).await);

  assert_eq!(first, second);
  assert_eq!(first.len(), 4);
}

#[tokio::test]
async fn incremental_halves_equal_one_pass() {
  let whole = store().await;
  whole.upsert_inspections(history()).await.unwrap();
  detect(&whole, DetectionMode::Incremental).await;

  let split = store().await;
  let (early, late): (Vec<_>, Vec<_>) = history()
    .into_iter()
    .partition(|r| r.inspection_date < date("2023-08-01"));
  split.upsert_inspections(early).await.unwrap();
  detect(&split, DetectionMode::Incremental).await;
  split.upsert_inspections(late).await.unwrap();
  detect(&split, DetectionMode::Incremental).await;

  assert_eq!(
    transitions(&all_events(&whole, &["9", "10"]).await),
    transitions(&all_events(&split, &["9", "10"]).await),
  );
}

#[tokio::test]
async fn partitions_cover_the_whole_scan() {
  let whole = store().await;
  whole.upsert_inspections(history()).await.unwrap();
  detect(&whole, DetectionMode::Incremental).await;

  let parted = store().await;
  parted.upsert_inspections(history()).await.unwrap();
  let mut records = 0;
  for index in 0..3 {
    let report = parted
      .detect_grade_changes(
        DetectionMode::Incremental,
        DetectionScope::Partition { index, of: 3 },
      )
      .await
      .unwrap()
      .value;
    records += report.records;
  }

  assert_eq!(records, history().len());
  assert_eq!(
    transitions(&all_events(&whole, &["9", "10"]).await),
    transitions(&all_events(&parted, &["9", "10"]).await),
  );
}

#[tokio::test]
async fn explicit_scope_leaves_others_alone() {
  let s = store().await;
  s.upsert_inspections(history()).await.unwrap();

  let report = s
    .detect_grade_changes(
      DetectionMode::Incremental,
      DetectionScope::Establishments {
        camis: vec!["10".into()],
      },
    )
    .await
    .unwrap()
    .value;
  assert_eq!(report.establishments, 1);
  assert!(s.grade_events("9".into()).await.unwrap().is_empty());
  assert_eq!(s.grade_events("10".into()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn invalid_partition_is_a_validation_error() {
  let s = store().await;
  let err = s
    .detect_grade_changes(
      DetectionMode::Incremental,
      DetectionScope::Partition { index: 3, of: 3 },
    )
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn corrupt_grades_are_skipped_and_reported() {
  let s = store().await;
  s.upsert_inspections(vec![
    record("11", "2024-01-10", "Grill", Some(Grade::A)),
    record("11", "2024-03-01", "Grill", Some(Grade::C)),
    record("11", "2024-06-01", "Grill", Some(Grade::B)),
  ])
  .await
  .unwrap();
  s.execute_raw(
    "UPDATE inspections SET grade = 'Q'
     WHERE camis = '11' AND inspection_date = '2024-03-01'",
  )
  .await
  .unwrap();

  let report = s
    .detect_grade_changes(DetectionMode::FullResync, DetectionScope::All)
    .await
    .unwrap()
    .value;
  assert_eq!(report.anomalies.count, 1);
  assert_eq!(report.anomalies.examples[0].raw_grade, "Q");
  // The corrupt record is not a baseline: A is compared with B directly.
  assert_eq!(report.events.len(), 1);
  assert_eq!(report.events[0].previous_grade, Some(Grade::A));
  assert_eq!(report.events[0].new_grade, Grade::B);
}

#[tokio::test]
async fn in_place_finalization_emits_once() {
  let s = store().await;
  s.upsert_inspections(vec![
    record("12", "2024-01-10", "Bakery", Some(Grade::A)),
    record("12", "2024-04-10", "Bakery", Some(Grade::Pending)),
  ])
  .await
  .unwrap();
  detect(&s, DetectionMode::Incremental).await;

  let finalized = s
    .upsert_inspections(vec![record("12", "2024-04-10", "Bakery", Some(Grade::A))])
    .await
    .unwrap()
    .value
    .finalized;
  assert_eq!(finalized.len(), 1);
  assert_eq!(finalized[0].kind, GradeEventKind::PendingFinalized);
  assert_eq!(finalized[0].previous_grade, Some(Grade::Pending));

  // The watermark now carries A, so an A afterwards is no change.
  s.upsert_inspections(vec![record("12", "2024-09-10", "Bakery", Some(Grade::A))])
    .await
    .unwrap();
  assert!(detect(&s, DetectionMode::Incremental).await.is_empty());
}

/// Incremental detection over `first`, then `late`, against one full pass.
async fn late_arrival(
  first: Vec<NewInspection>,
  late: NewInspection,
) -> (Vec<GradeUpdateEvent>, Vec<GradeUpdateEvent>, usize) {
  let whole = store().await;
  whole.upsert_inspections(first.clone()).await.unwrap();
  whole.upsert_inspections(vec![late.clone()]).await.unwrap();
  detect(&whole, DetectionMode::FullResync).await;

  let s = store().await;
  s.upsert_inspections(first).await.unwrap();
  detect(&s, DetectionMode::Incremental).await;
  let rewound = s.upsert_inspections(vec![late]).await.unwrap().value.rewound;
  detect(&s, DetectionMode::Incremental).await;

  (
    all_events(&s, &["15"]).await,
    all_events(&whole, &["15"]).await,
    rewound,
  )
}

#[tokio::test]
async fn late_records_are_scanned_incrementally() {
  let (incremental, full, rewound) = late_arrival(
    vec![
      record("15", "2024-01-10", "Noodle Bar", Some(Grade::A)),
      record("15", "2024-06-01", "Noodle Bar", Some(Grade::A)),
    ],
    record("15", "2024-03-01", "Noodle Bar", Some(Grade::C)),
  )
  .await;

  assert_eq!(rewound, 1);
  assert_eq!(incremental.len(), 2);
  assert_eq!(transitions(&incremental), transitions(&full));
}

#[tokio::test]
async fn late_records_drop_events_they_supersede() {
  let (incremental, full, _) = late_arrival(
    vec![
      record("15", "2024-01-10", "Noodle Bar", Some(Grade::A)),
      record("15", "2024-06-01", "Noodle Bar", Some(Grade::B)),
    ],
    record("15", "2024-03-01", "Noodle Bar", Some(Grade::B)),
  )
  .await;

  // A to B now happens at the late record; June repeats B.
  assert_eq!(incremental.len(), 1);
  assert_eq!(incremental[0].inspection_date, date("2024-03-01"));
  assert_eq!(transitions(&incremental), transitions(&full));
}

#[tokio::test]
async fn records_past_the_watermark_do_not_rewind() {
  let s = store().await;
  s.upsert_inspections(vec![record("15", "2024-01-10", "Noodle Bar", Some(Grade::A))])
    .await
    .unwrap();
  detect(&s, DetectionMode::Incremental).await;
  let report = s
    .upsert_inspections(vec![record("15", "2024-06-01", "Noodle Bar", Some(Grade::B))])
    .await
    .unwrap()
    .value;
  assert_eq!(report.rewound, 0);
  let report = s
    .detect_grade_changes(DetectionMode::Incremental, DetectionScope::All)
    .await
    .unwrap()
    .value;
  assert_eq!(report.records, 1);
  assert_eq!(report.events.len(), 1);
}

#[tokio::test]
async fn recently_graded_orders_by_official_date() {
  let s = store().await;
  let mut b = record("13", "2024-06-01", "Pho House", Some(Grade::B));
  b.grade_date = Some(date("2024-06-05"));
  let mut c = record("14", "2024-05-01", "Kebab Stop", Some(Grade::C));
  c.grade_date = Some(date("2024-06-10"));
  s.upsert_inspections(vec![
    record("13", "2024-01-10", "Pho House", Some(Grade::A)),
    b,
    record("14", "2024-01-10", "Kebab Stop", Some(Grade::A)),
    c,
  ])
  .await
  .unwrap();
  detect(&s, DetectionMode::Incremental).await;

  let feed = s.recently_graded(date("2024-06-01"), 10).await.unwrap();
  let order: Vec<_> = feed.iter().map(|r| r.event.camis.as_str()).collect();
  assert_eq!(order, vec!["14", "13"]);
  assert_eq!(feed[0].effective_date, date("2024-06-10"));
  assert_eq!(feed[0].name, "Kebab Stop");

  assert!(s.recently_graded(date("2024-07-01"), 10).await.unwrap().is_empty());
}

// ─── Maintenance ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn rebuild_restores_name_keys() {
  let s = store().await;
  s.upsert_inspections(vec![record("15", "2024-01-10", "Ramen-Ya", None)])
    .await
    .unwrap();
  s.execute_raw("UPDATE inspections SET name_key = 'stale'")
    .await
    .unwrap();
  s.execute_raw("DELETE FROM name_trigrams").await.unwrap();

  let written = s.rebuild_name_keys().await.unwrap();
  assert_eq!(written.value, 1);
  assert!(!written.invalidate.is_empty());

  let request = params(Some("ramen ya")).into_request().unwrap();
  assert_eq!(ids(&s.search(&request).await.unwrap()), vec!["15"]);
}

#[tokio::test]
async fn prune_removes_only_old_violations() {
  let s = store().await;
  let cite = |row: &mut NewInspection| {
    row.violations = vec![Violation {
      code:        "02G".into(),
      description: None,
    }]
  };
  let mut old = record("16", "2019-01-10", "Old Spot", None);
  cite(&mut old);
  let mut recent = record("16", "2024-01-10", "Old Spot", None);
  cite(&mut recent);
  s.upsert_inspections(vec![old, recent]).await.unwrap();

  let removed = s.prune_violations(date("2020-01-01")).await.unwrap();
  assert_eq!(removed.value, 1);

  let est = s.get_establishment("16".into()).await.unwrap().unwrap();
  assert_eq!(est.inspections[0].violations.len(), 1);
  assert!(est.inspections[1].violations.is_empty());
}

#[tokio::test]
async fn enrichment_is_attached_to_the_summary() {
  let s = store().await;
  s.upsert_inspections(vec![record("17", "2024-01-10", "Tea Room", None)])
    .await
    .unwrap();

  let enrichment = Enrichment {
    rating: Some(4.5),
    website: Some("https://tea.example".into()),
    ..Default::default()
  };
  s.set_enrichment("17".into(), enrichment.clone()).await.unwrap();
  let est = s.get_establishment("17".into()).await.unwrap().unwrap();
  assert_eq!(est.summary.enrichment, Some(enrichment));

  let err = s
    .set_enrichment("missing".into(), Enrichment::default())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::EstablishmentNotFound(_)));
}

// ─── Users ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn favorites_are_idempotent() {
  let s = store().await;
  s.upsert_inspections(vec![record("18", "2024-01-10", "Soup Shop", None)])
    .await
    .unwrap();
  let alice = user("alice");
  s.register_user(alice.clone()).await.unwrap();

  let first = s.add_favorite(alice.clone(), "18".into()).await.unwrap();
  assert!(first.value);
  assert!(first.invalidate.iter().any(|i| {
    i.covers(CacheKey::favorites(&alice).as_str())
  }));
  let second = s.add_favorite(alice.clone(), "18".into()).await.unwrap();
  assert!(!second.value);

  assert_eq!(s.list_favorites(alice.clone()).await.unwrap().len(), 1);

  assert!(s.remove_favorite(alice.clone(), "18".into()).await.unwrap().value);
  assert!(s.list_favorites(alice).await.unwrap().is_empty());
}

#[tokio::test]
async fn favorites_require_known_rows() {
  let s = store().await;
  let alice = user("alice");

  let err = s.add_favorite(alice.clone(), "18".into()).await.unwrap_err();
  assert!(matches!(err, Error::UserNotFound(_)));
  assert_eq!(err.kind(), ErrorKind::NotFound);

  s.register_user(alice.clone()).await.unwrap();
  let err = s.add_favorite(alice, "18".into()).await.unwrap_err();
  assert!(matches!(err, Error::EstablishmentNotFound(_)));
}

#[tokio::test]
async fn register_is_idempotent() {
  let s = store().await;
  let first = s.register_user(user("bob")).await.unwrap().value;
  let again = s.register_user(user("bob")).await.unwrap().value;
  assert_eq!(first, again);
}

#[tokio::test]
async fn searches_deduplicate_on_normalized_term() {
  let s = store().await;
  let alice = user("alice");
  s.register_user(alice.clone()).await.unwrap();

  s.record_search(alice.clone(), "Joe's Pizza".into()).await.unwrap();
  s.record_search(alice.clone(), "tacos".into()).await.unwrap();
  s.record_search(alice.clone(), "joes pizza".into()).await.unwrap();

  let recent = s.list_recent_searches(alice, 10).await.unwrap();
  let terms: Vec<_> = recent.iter().map(|r| r.display_term.as_str()).collect();
  assert_eq!(terms, vec!["joes pizza", "tacos"]);
  assert_eq!(recent[0].term_key, "joes pizza");
}

#[tokio::test]
async fn blank_search_terms_are_rejected() {
  let s = store().await;
  let alice = user("alice");
  s.register_user(alice.clone()).await.unwrap();
  let err = s.record_search(alice, " ?! ".into()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn recent_searches_are_capped() {
  let s = SqliteStore::open_in_memory_with(StoreOptions {
    max_recent_searches: 3,
    ..StoreOptions::default()
  })
  .await
  .unwrap();
  let alice = user("alice");
  s.register_user(alice.clone()).await.unwrap();
  for term in ["one", "two", "three", "four", "five"] {
    s.record_search(alice.clone(), term.into()).await.unwrap();
  }

  let recent = s.list_recent_searches(alice.clone(), 100).await.unwrap();
  let terms: Vec<_> = recent.iter().map(|r| r.term_key.as_str()).collect();
  assert_eq!(terms, vec!["five", "four", "three"]);

  let err = s.list_recent_searches(alice, 0).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn deleting_a_user_cascades() {
  let s = store().await;
  s.upsert_inspections(vec![record("19", "2024-01-10", "Dumpling Den", None)])
    .await
    .unwrap();
  let alice = user("alice");
  s.register_user(alice.clone()).await.unwrap();
  s.add_favorite(alice.clone(), "19".into()).await.unwrap();
  s.record_search(alice.clone(), "dumplings".into()).await.unwrap();

  let deleted = s.delete_user(alice.clone()).await.unwrap();
  assert!(deleted.value);
  assert_eq!(
    deleted.invalidate.iter().next(),
    Some(&Invalidation::user(&alice))
  );

  s.register_user(alice.clone()).await.unwrap();
  assert!(s.list_favorites(alice.clone()).await.unwrap().is_empty());
  assert!(s.list_recent_searches(alice.clone(), 10).await.unwrap().is_empty());

  s.delete_user(alice.clone()).await.unwrap();
  let missing = s.delete_user(alice).await.unwrap();
  assert!(!missing.value);
  assert!(!missing.invalidate.is_empty());
}

// ─── Deadlines & contention ──────────────────────────────────────────────────

/// Counts a few million generated rows, outlasting a short deadline.
const SLOW_QUERY: &str = "WITH RECURSIVE n(x) AS (
     SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5000000
   )
   SELECT count(*) FROM n";

#[tokio::test]
async fn slow_calls_surface_as_timeouts() {
  let s = SqliteStore::open_in_memory_with(StoreOptions {
    timeout: Duration::from_millis(20),
    ..StoreOptions::default()
  })
  .await
  .unwrap();

  let err = s.execute_raw(SLOW_QUERY).await.unwrap_err();
  assert!(matches!(err, Error::Timeout(_)));
  assert_eq!(err.kind(), ErrorKind::Timeout);

  // The abandoned job still runs; later calls queue behind it.
  s.settled().await.unwrap();
  assert!(s.get_establishment("1".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn lock_contention_is_retried_then_unavailable() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("grades.db");
  let s = SqliteStore::open_with(&path, StoreOptions {
    lock_wait: Duration::ZERO,
    busy_retries: 2,
    ..StoreOptions::default()
  })
  .await
  .unwrap();

  let blocker = rusqlite::Connection::open(&path).unwrap();
  blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

  let err = s.register_user(user("alice")).await.unwrap_err();
  assert!(matches!(err, Error::Busy { attempts: 3 }));
  assert_eq!(err.kind(), ErrorKind::Unavailable);

  blocker.execute_batch("COMMIT").unwrap();
  let registered = s.register_user(user("alice")).await.unwrap();
  assert_eq!(registered.value.user_id, user("alice"));
}
