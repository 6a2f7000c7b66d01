//! Raw record store
//!
//! Immutable append-only layer keyed by content checksum. Bulk inserts are
//! one transaction per batch: readers never observe a half-written batch,
//! and a crash rolls the batch back to the previous boundary. No update, no
//! delete.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use etymograph_core::{now_millis, Origin, RawRecord};

use crate::error::{Result, StoreError};
use crate::schema;

/// Statistics from one bulk insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    /// Rows newly written
    pub inserted: usize,
    /// Rows skipped because their checksum already exists
    pub deduplicated: usize,
}

/// A raw record as read back from the store, with its scan cursor.
#[derive(Debug, Clone)]
pub struct StoredRaw {
    /// Scan cursor; rowids are assigned in insertion order
    pub cursor: u64,
    pub record: RawRecord,
}

/// Append-only raw record store.
///
/// Each instance owns one SQLite connection; pipeline workers open their
/// own instance rather than sharing one across a queue wait.
pub struct RawStore {
    conn: Connection,
}

impl RawStore {
    /// Open (and initialize) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::init_connection(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_connection(&conn)?;
        Ok(Self { conn })
    }

    /// Insert a batch atomically, deduplicating on checksum.
    ///
    /// Existing records are silently kept, except when the stored payload
    /// differs from the incoming one under the same checksum: that is a
    /// hash collision and an integrity failure, and the whole batch rolls
    /// back.
    pub fn bulk_insert(&mut self, records: &[RawRecord]) -> Result<InsertStats> {
        let mut stats = InsertStats::default();
        if records.is_empty() {
            return Ok(stats);
        }

        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO raw_records
                 (source_id, payload, checksum, ingested_at, file_path, line_no)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut lookup =
                tx.prepare_cached("SELECT payload FROM raw_records WHERE checksum = ?1")?;

            let now = now_millis();
            for record in records {
                let payload_text = serde_json::to_string(&record.payload)?;
                let changed = insert.execute(params![
                    record.source_id,
                    payload_text,
                    record.checksum,
                    now,
                    record.origin.file_path,
                    record.origin.line_no,
                ])?;

                if changed == 1 {
                    stats.inserted += 1;
                    continue;
                }

                // Ignored: verify the stored payload really is the same
                // content, not a colliding hash.
                let stored: String = lookup
                    .query_row([&record.checksum], |row| row.get(0))
                    .map_err(StoreError::Sqlite)?;
                let stored_value: Value = serde_json::from_str(&stored)?;
                if etymograph_core::canonical_bytes(&stored_value) != record.canonical_bytes() {
                    return Err(StoreError::ChecksumCollision {
                        checksum: record.checksum.clone(),
                    });
                }
                stats.deduplicated += 1;
            }
        }
        tx.commit()?;

        debug!(
            "raw bulk_insert: {} inserted, {} deduplicated",
            stats.inserted, stats.deduplicated
        );
        Ok(stats)
    }

    /// Scan records in insertion order, starting after `since_cursor`.
    ///
    /// Returns at most `limit` records plus the cursor to resume from.
    /// Scans see monotone growth: a record once returned is always returned
    /// again for the same cursor range.
    pub fn scan(
        &self,
        source_id: Option<&str>,
        since_cursor: u64,
        limit: usize,
    ) -> Result<(Vec<StoredRaw>, u64)> {
        let mut out = Vec::with_capacity(limit.min(4096));
        let mut next_cursor = since_cursor;

        let mut push_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            let cursor: u64 = row.get(0)?;
            let payload_text: String = row.get(2)?;
            let payload: Value = serde_json::from_str(&payload_text).unwrap_or(Value::Null);
            out.push(StoredRaw {
                cursor,
                record: RawRecord {
                    source_id: row.get(1)?,
                    payload,
                    checksum: row.get(3)?,
                    origin: Origin {
                        file_path: row.get(4)?,
                        line_no: row.get(5)?,
                    },
                },
            });
            Ok(())
        };

        match source_id {
            Some(source) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT id, source_id, payload, checksum, file_path, line_no
                     FROM raw_records WHERE id > ?1 AND source_id = ?2
                     ORDER BY id LIMIT ?3",
                )?;
                let mut rows = stmt.query(params![since_cursor, source, limit as i64])?;
                while let Some(row) = rows.next()? {
                    push_row(row)?;
                }
            }
            None => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT id, source_id, payload, checksum, file_path, line_no
                     FROM raw_records WHERE id > ?1
                     ORDER BY id LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![since_cursor, limit as i64])?;
                while let Some(row) = rows.next()? {
                    push_row(row)?;
                }
            }
        }

        if let Some(last) = out.last() {
            next_cursor = last.cursor;
        }
        Ok((out, next_cursor))
    }

    /// Count stored records, optionally per source.
    pub fn count(&self, source_id: Option<&str>) -> Result<u64> {
        let count: u64 = match source_id {
            Some(source) => self.conn.query_row(
                "SELECT COUNT(*) FROM raw_records WHERE source_id = ?1",
                [source],
                |row| row.get(0),
            )?,
            None => {
                self.conn
                    .query_row("SELECT COUNT(*) FROM raw_records", [], |row| row.get(0))?
            }
        };
        Ok(count)
    }

    /// Fetch a single record by checksum.
    pub fn get_by_checksum(&self, checksum: &str) -> Result<Option<RawRecord>> {
        self.conn
            .query_row(
                "SELECT source_id, payload, checksum, file_path, line_no
                 FROM raw_records WHERE checksum = ?1",
                [checksum],
                |row| {
                    let payload_text: String = row.get(1)?;
                    Ok(RawRecord {
                        source_id: row.get(0)?,
                        payload: serde_json::from_str(&payload_text).unwrap_or(Value::Null),
                        checksum: row.get(2)?,
                        origin: Origin {
                            file_path: row.get(3)?,
                            line_no: row.get(4)?,
                        },
                    })
                },
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(word: &str, line: u64) -> RawRecord {
        RawRecord::new(
            "test-src",
            json!({"word": word, "lang_code": "en"}),
            Origin {
                file_path: "test.jsonl".to_string(),
                line_no: line,
            },
        )
    }

    #[test]
    fn test_bulk_insert_and_scan() {
        let mut store = RawStore::open_in_memory().unwrap();
        let stats = store
            .bulk_insert(&[record("a", 1), record("b", 2), record("c", 3)])
            .unwrap();
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.deduplicated, 0);

        let (rows, cursor) = store.scan(None, 0, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].record.payload["word"], "a");
        assert_eq!(cursor, rows[2].cursor);

        // Resume after the second record
        let (rest, _) = store.scan(None, rows[1].cursor, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].record.payload["word"], "c");
    }

    #[test]
    fn test_duplicate_checksums_kept_once() {
        let mut store = RawStore::open_in_memory().unwrap();
        store.bulk_insert(&[record("a", 1)]).unwrap();
        // Same payload from a different origin is still the same content
        let stats = store.bulk_insert(&[record("a", 99)]).unwrap();
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(store.count(None).unwrap(), 1);
    }

    #[test]
    fn test_duplicates_within_one_batch() {
        let mut store = RawStore::open_in_memory().unwrap();
        let stats = store
            .bulk_insert(&[record("a", 1), record("a", 1), record("b", 2)])
            .unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.deduplicated, 1);
    }

    #[test]
    fn test_checksum_collision_rolls_back_batch() {
        let mut store = RawStore::open_in_memory().unwrap();
        store.bulk_insert(&[record("a", 1)]).unwrap();

        // Forge a record whose checksum matches but whose payload differs
        let mut forged = record("different", 7);
        forged.checksum = record("a", 1).checksum;

        let before = store.count(None).unwrap();
        let err = store
            .bulk_insert(&[record("b", 2), forged])
            .expect_err("collision must fail");
        assert!(matches!(err, StoreError::ChecksumCollision { .. }));
        // The whole batch rolled back, including the good record
        assert_eq!(store.count(None).unwrap(), before);
    }

    #[test]
    fn test_scan_filters_by_source() {
        let mut store = RawStore::open_in_memory().unwrap();
        store.bulk_insert(&[record("a", 1)]).unwrap();
        let other = RawRecord::new(
            "other-src",
            json!({"word": "x"}),
            Origin {
                file_path: "o.jsonl".to_string(),
                line_no: 1,
            },
        );
        store.bulk_insert(&[other]).unwrap();

        let (rows, _) = store.scan(Some("test-src"), 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.source_id, "test-src");
        assert_eq!(store.count(Some("other-src")).unwrap(), 1);
    }

    #[test]
    fn test_get_by_checksum() {
        let mut store = RawStore::open_in_memory().unwrap();
        let rec = record("a", 1);
        store.bulk_insert(std::slice::from_ref(&rec)).unwrap();
        let found = store.get_by_checksum(&rec.checksum).unwrap().unwrap();
        assert_eq!(found.payload, rec.payload);
        assert!(store.get_by_checksum("deadbeef").unwrap().is_none());
    }
}
