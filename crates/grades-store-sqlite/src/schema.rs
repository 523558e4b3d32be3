//! SQL schema for the grades SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per establishment per inspection date. Owned by ingestion; the
-- store only derives name_key and attaches enrichment.
CREATE TABLE IF NOT EXISTS inspections (
    camis           TEXT NOT NULL,
    inspection_date TEXT NOT NULL,   -- YYYY-MM-DD
    name            TEXT NOT NULL,
    name_key        TEXT NOT NULL,   -- normalized at write time
    boro            TEXT,
    building        TEXT,
    street          TEXT,
    zipcode         TEXT,
    phone           TEXT,
    latitude        REAL,
    longitude       REAL,
    cuisine         TEXT,
    critical_flag   TEXT,
    grade           TEXT,            -- A | B | C | P | Z | N | NULL
    grade_date      TEXT,
    inspection_type TEXT,
    action          TEXT,
    enrichment      TEXT,            -- JSON or NULL
    ingested_at     TEXT NOT NULL,
    PRIMARY KEY (camis, inspection_date),
    CHECK (grade_date IS NULL OR grade_date >= inspection_date)
);

CREATE TABLE IF NOT EXISTS violations (
    camis           TEXT NOT NULL,
    inspection_date TEXT NOT NULL,
    code            TEXT NOT NULL,
    description     TEXT,
    PRIMARY KEY (camis, inspection_date, code),
    FOREIGN KEY (camis, inspection_date)
        REFERENCES inspections(camis, inspection_date) ON DELETE CASCADE
);

-- Posting list: every trigram of every name key an establishment has used.
CREATE TABLE IF NOT EXISTS name_trigrams (
    trigram TEXT NOT NULL,
    camis   TEXT NOT NULL,
    PRIMARY KEY (trigram, camis)
) WITHOUT ROWID;

-- Derived by the detector. Rows are never updated.
CREATE TABLE IF NOT EXISTS grade_events (
    event_id        TEXT PRIMARY KEY,
    camis           TEXT NOT NULL,
    inspection_date TEXT NOT NULL,
    previous_grade  TEXT,
    new_grade       TEXT NOT NULL,
    kind            TEXT NOT NULL,   -- 'new_grade' | 'pending_finalized'
    detected_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS detection_watermarks (
    camis        TEXT PRIMARY KEY,
    through_date TEXT NOT NULL,
    last_grade   TEXT,
    has_baseline INTEGER NOT NULL DEFAULT 0,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    user_id    TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS favorites (
    user_id  TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    camis    TEXT NOT NULL,
    added_at TEXT NOT NULL,
    PRIMARY KEY (user_id, camis)
);

CREATE TABLE IF NOT EXISTS recent_searches (
    user_id      TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    term_key     TEXT NOT NULL,
    display_term TEXT NOT NULL,
    searched_at  TEXT NOT NULL,
    seq          INTEGER NOT NULL,   -- per-user, monotonic
    PRIMARY KEY (user_id, term_key)
);

CREATE INDEX IF NOT EXISTS inspections_name_key_idx ON inspections(name_key);
CREATE INDEX IF NOT EXISTS inspections_boro_idx     ON inspections(boro);
CREATE INDEX IF NOT EXISTS name_trigrams_camis_idx  ON name_trigrams(camis);
CREATE INDEX IF NOT EXISTS grade_events_camis_idx   ON grade_events(camis, inspection_date);
CREATE INDEX IF NOT EXISTS recent_searches_seq_idx  ON recent_searches(user_id, seq);

CREATE UNIQUE INDEX IF NOT EXISTS grade_events_transition_idx
    ON grade_events(camis, inspection_date, IFNULL(previous_grade, ''), new_grade);

PRAGMA user_version = 1;
";
