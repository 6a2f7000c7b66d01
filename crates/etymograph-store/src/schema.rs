//! SQLite Schema Definitions
//!
//! One database file carries the raw layer, the typed entries, the
//! transform log and the pipeline checkpoints. The raw table is append-only
//! with a unique content checksum; the entry table is keyed by the
//! deterministic entry id.

/// Schema version stored in the metadata table
pub const SCHEMA_VERSION: &str = "1.0";

/// SQL to create the raw record table
///
/// Append-only. `checksum` is the content hash of the canonical payload and
/// the deduplication key; `id` (rowid) doubles as the scan cursor.
pub const SCHEMA_CREATE_RAW: &str = r#"
CREATE TABLE IF NOT EXISTS raw_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    checksum TEXT NOT NULL UNIQUE,
    ingested_at INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    line_no INTEGER NOT NULL
)
"#;

/// SQL to create the transform log table
///
/// Append-only, partitioned by raw record checksum. One row per cleaner
/// application.
pub const SCHEMA_CREATE_TRANSFORM_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS transform_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    raw_ref TEXT NOT NULL,
    step_name TEXT NOT NULL,
    step_version INTEGER NOT NULL,
    params TEXT,
    at INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    ok INTEGER NOT NULL,
    error TEXT
)
"#;

/// SQL to create the typed entry table
///
/// `embedding` is a little-endian f32 blob; NULL until enrichment fills it.
/// `validation_errors` is a JSON string array.
pub const SCHEMA_CREATE_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY NOT NULL,
    headword TEXT NOT NULL,
    ipa TEXT,
    language_code TEXT NOT NULL,
    definition TEXT NOT NULL,
    etymology TEXT,
    pos_tag TEXT,
    embedding BLOB,
    raw_ref TEXT NOT NULL,
    source_id TEXT NOT NULL,
    pipeline_fingerprint TEXT NOT NULL,
    pipeline_seq INTEGER NOT NULL,
    quality REAL NOT NULL,
    validation_errors TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL
)
"#;

/// Staging table for bulk upserts; same shape as `entries`, TEMP so each
/// connection stages privately.
pub const SCHEMA_CREATE_STAGING: &str = r#"
CREATE TEMP TABLE IF NOT EXISTS staging_entries (
    id TEXT PRIMARY KEY NOT NULL,
    headword TEXT NOT NULL,
    ipa TEXT,
    language_code TEXT NOT NULL,
    definition TEXT NOT NULL,
    etymology TEXT,
    pos_tag TEXT,
    embedding BLOB,
    raw_ref TEXT NOT NULL,
    source_id TEXT NOT NULL,
    pipeline_fingerprint TEXT NOT NULL,
    pipeline_seq INTEGER NOT NULL,
    quality REAL NOT NULL,
    validation_errors TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL
)
"#;

/// SQL to create the headword trigram table
///
/// A plain b-tree trigram index: substring search intersects trigram
/// postings without requiring an FTS module.
pub const SCHEMA_CREATE_TRIGRAMS: &str = r#"
CREATE TABLE IF NOT EXISTS headword_trigrams (
    entry_id TEXT NOT NULL,
    trigram TEXT NOT NULL,
    UNIQUE(entry_id, trigram)
)
"#;

/// SQL to create the checkpoint table
pub const SCHEMA_CREATE_CHECKPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    pipeline_name TEXT PRIMARY KEY NOT NULL,
    at INTEGER NOT NULL,
    total INTEGER NOT NULL,
    processed INTEGER NOT NULL,
    succeeded INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    skipped INTEGER NOT NULL,
    per_source_cursor TEXT NOT NULL DEFAULT '{}'
)
"#;

/// SQL to create indexes for efficient queries
pub const SCHEMA_CREATE_INDEXES: &str = r#"
-- Scan raw records by source
CREATE INDEX IF NOT EXISTS idx_raw_source ON raw_records(source_id);

-- Transform log is read per raw record
CREATE INDEX IF NOT EXISTS idx_log_raw_ref ON transform_log(raw_ref);

-- Entry filters
CREATE INDEX IF NOT EXISTS idx_entries_language ON entries(language_code);
CREATE INDEX IF NOT EXISTS idx_entries_source ON entries(source_id);
CREATE INDEX IF NOT EXISTS idx_entries_headword ON entries(headword);

-- Trigram postings
CREATE INDEX IF NOT EXISTS idx_trigrams_trigram ON headword_trigrams(trigram);
"#;

/// SQL to create the metadata table
pub const SCHEMA_CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS store_metadata (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)
"#;

/// Apply pragmas and create every table on a fresh connection.
pub fn init_connection(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    // WAL allows concurrent readers while a writer commits batches.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(30))?;

    conn.execute_batch(SCHEMA_CREATE_RAW)?;
    conn.execute_batch(SCHEMA_CREATE_TRANSFORM_LOG)?;
    conn.execute_batch(SCHEMA_CREATE_ENTRIES)?;
    conn.execute_batch(SCHEMA_CREATE_TRIGRAMS)?;
    conn.execute_batch(SCHEMA_CREATE_CHECKPOINTS)?;
    conn.execute_batch(SCHEMA_CREATE_METADATA)?;
    conn.execute_batch(SCHEMA_CREATE_INDEXES)?;
    conn.execute(
        "INSERT OR IGNORE INTO store_metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}
