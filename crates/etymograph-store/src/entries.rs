//! Typed entry store
//!
//! Bulk upserts stream each batch into a TEMP staging table and merge with
//! a single `INSERT ... ON CONFLICT` statement. The merge discipline:
//!
//! - a row only overwrites when its `pipeline_seq` is not older than the
//!   stored one (later pipelines overwrite earlier, never the reverse)
//! - `embedding` coalesces: once present it never reverts to absent
//! - `validation_errors` accumulates as a set union
//!
//! A manual trigram table over headwords supports substring search.

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use etymograph_core::Entry;

use crate::error::{Result, StoreError};
use crate::schema;

/// Statistics from one bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    /// Rows newly inserted
    pub inserted: usize,
    /// Rows that hit an existing id (updated or skipped by the seq guard)
    pub upserted: usize,
}

/// Filter for entry scans.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub source_id: Option<String>,
    pub language_code: Option<String>,
    /// Only entries still lacking an embedding
    pub missing_embedding_only: bool,
}

/// Typed entry store; one SQLite connection per instance.
pub struct EntryStore {
    conn: Connection,
}

const ENTRY_COLUMNS: &str = "id, headword, ipa, language_code, definition, etymology, pos_tag, \
     embedding, raw_ref, source_id, pipeline_fingerprint, pipeline_seq, \
     quality, validation_errors, created_at";

impl EntryStore {
    /// Open (and initialize) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::init_connection(&conn)?;
        conn.execute_batch(schema::SCHEMA_CREATE_STAGING)?;
        Ok(Self { conn })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_connection(&conn)?;
        conn.execute_batch(schema::SCHEMA_CREATE_STAGING)?;
        Ok(Self { conn })
    }

    /// Upsert a batch: stage, merge in one statement, refresh trigrams.
    pub fn bulk_upsert(&mut self, entries: &[Entry]) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();
        if entries.is_empty() {
            return Ok(stats);
        }

        let tx = self.conn.transaction()?;
        {
            tx.execute("DELETE FROM staging_entries", [])?;

            let mut stage = tx.prepare_cached(
                "INSERT OR REPLACE INTO staging_entries
                 (id, headword, ipa, language_code, definition, etymology, pos_tag,
                  embedding, raw_ref, source_id, pipeline_fingerprint, pipeline_seq,
                  quality, validation_errors, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            for entry in entries {
                stage.execute(params![
                    entry.id,
                    entry.headword,
                    entry.ipa,
                    entry.language_code,
                    entry.definition,
                    entry.etymology,
                    entry.pos_tag,
                    entry.embedding.as_deref().map(encode_embedding),
                    entry.raw_ref,
                    entry.source_id,
                    entry.pipeline_fingerprint,
                    entry.pipeline_seq,
                    entry.quality,
                    serde_json::to_string(&entry.validation_errors)?,
                    entry.created_at,
                ])?;
            }

            let staged: usize =
                tx.query_row("SELECT COUNT(*) FROM staging_entries", [], |r| r.get(0))?;
            let existing: usize = tx.query_row(
                "SELECT COUNT(*) FROM entries WHERE id IN (SELECT id FROM staging_entries)",
                [],
                |r| r.get(0),
            )?;
            stats.inserted = staged - existing;
            stats.upserted = existing;

            // The one-statement merge. The WHERE guard keeps overwrites
            // monotone in pipeline_seq; validation errors union via the
            // staging row rather than `excluded` so the subquery stays on
            // plain tables.
            tx.execute(
                "INSERT INTO entries
                 (id, headword, ipa, language_code, definition, etymology, pos_tag,
                  embedding, raw_ref, source_id, pipeline_fingerprint, pipeline_seq,
                  quality, validation_errors, created_at)
                 SELECT id, headword, ipa, language_code, definition, etymology, pos_tag,
                        embedding, raw_ref, source_id, pipeline_fingerprint, pipeline_seq,
                        quality, validation_errors, created_at
                 FROM staging_entries WHERE true
                 ON CONFLICT(id) DO UPDATE SET
                     headword = excluded.headword,
                     ipa = excluded.ipa,
                     language_code = excluded.language_code,
                     definition = excluded.definition,
                     etymology = excluded.etymology,
                     pos_tag = excluded.pos_tag,
                     embedding = COALESCE(excluded.embedding, entries.embedding),
                     raw_ref = excluded.raw_ref,
                     source_id = excluded.source_id,
                     pipeline_fingerprint = excluded.pipeline_fingerprint,
                     pipeline_seq = excluded.pipeline_seq,
                     quality = excluded.quality,
                     validation_errors = COALESCE(
                         (SELECT json_group_array(value) FROM (
                             SELECT value FROM json_each(entries.validation_errors)
                             UNION
                             SELECT value FROM json_each(
                                 (SELECT s.validation_errors FROM staging_entries s
                                  WHERE s.id = entries.id)
                             )
                         )),
                         '[]'
                     ),
                     created_at = excluded.created_at
                 WHERE excluded.pipeline_seq >= entries.pipeline_seq",
                [],
            )?;

            // Refresh trigram postings from the stored headwords (which may
            // differ from the staged ones when the seq guard skipped).
            tx.execute(
                "DELETE FROM headword_trigrams
                 WHERE entry_id IN (SELECT id FROM staging_entries)",
                [],
            )?;
            {
                let mut select = tx.prepare_cached(
                    "SELECT id, headword FROM entries
                     WHERE id IN (SELECT id FROM staging_entries)",
                )?;
                let mut insert = tx.prepare_cached(
                    "INSERT OR IGNORE INTO headword_trigrams (entry_id, trigram) VALUES (?1, ?2)",
                )?;
                let mut rows = select.query([])?;
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let headword: String = row.get(1)?;
                    for tri in trigrams(&headword) {
                        insert.execute(params![id, tri])?;
                    }
                }
            }

            tx.execute("DELETE FROM staging_entries", [])?;
        }
        tx.commit()?;

        debug!(
            "entry bulk_upsert: {} inserted, {} upserted",
            stats.inserted, stats.upserted
        );
        Ok(stats)
    }

    /// Attach embeddings to existing entries in one transaction.
    ///
    /// Always sets a vector, so a committed embedding never reverts to
    /// absent.
    pub fn update_embeddings(&mut self, updates: &[(String, Vec<f32>)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut updated = 0usize;
        {
            let mut stmt =
                tx.prepare_cached("UPDATE entries SET embedding = ?2 WHERE id = ?1")?;
            for (id, vector) in updates {
                updated += stmt.execute(params![id, encode_embedding(vector)])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Fetch one entry by id.
    pub fn get(&self, id: &str) -> Result<Option<Entry>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                [id],
                decode_entry,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Scan entries in rowid order with a resumable cursor.
    pub fn scan(
        &self,
        filter: &EntryFilter,
        since_cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Entry>, u64)> {
        let rows = self.scan_with_cursors(filter, since_cursor, limit)?;
        let next_cursor = rows.last().map(|(c, _)| *c).unwrap_or(since_cursor);
        Ok((rows.into_iter().map(|(_, e)| e).collect(), next_cursor))
    }

    /// Scan entries, returning each row's cursor alongside it.
    pub fn scan_with_cursors(
        &self,
        filter: &EntryFilter,
        since_cursor: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Entry)>> {
        let mut sql = format!(
            "SELECT rowid, {} FROM entries WHERE rowid > ?1",
            ENTRY_COLUMNS
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(since_cursor), Box::new(limit as i64)];

        if let Some(ref source) = filter.source_id {
            sql.push_str(&format!(" AND source_id = ?{}", args.len() + 1));
            args.push(Box::new(source.clone()));
        }
        if let Some(ref lang) = filter.language_code {
            sql.push_str(&format!(" AND language_code = ?{}", args.len() + 1));
            args.push(Box::new(lang.clone()));
        }
        if filter.missing_embedding_only {
            sql.push_str(" AND embedding IS NULL");
        }
        sql.push_str(" ORDER BY rowid LIMIT ?2");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter().map(|a| a.as_ref())))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let cursor: u64 = row.get(0)?;
            out.push((cursor, decode_entry_offset(row, 1)?));
        }
        Ok(out)
    }

    /// Substring search over headwords via the trigram table.
    ///
    /// Queries shorter than one trigram fall back to a LIKE scan.
    pub fn search_headword(&self, query: &str, limit: usize) -> Result<Vec<Entry>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let tris = trigrams(&needle);
        if tris.len() < 2 {
            let mut stmt = self.conn.prepare_cached(&format!(
                "SELECT {} FROM entries WHERE headword LIKE ?1 LIMIT ?2",
                ENTRY_COLUMNS
            ))?;
            let pattern = format!("%{}%", needle);
            let rows = stmt.query_map(params![pattern, limit as i64], decode_entry)?;
            return rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into);
        }

        // Rank candidates by matched trigram count, then verify with LIKE
        // to drop false positives.
        let placeholders: Vec<String> = (1..=tris.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT e.rowid, {cols}
             FROM entries e
             JOIN (
                 SELECT entry_id, COUNT(*) AS matched
                 FROM headword_trigrams
                 WHERE trigram IN ({ins})
                 GROUP BY entry_id
                 ORDER BY matched DESC
                 LIMIT ?{lim}
             ) t ON t.entry_id = e.id
             WHERE e.headword LIKE ?{like}
             ORDER BY t.matched DESC",
            cols = ENTRY_COLUMNS
                .split(", ")
                .map(|c| format!("e.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
            ins = placeholders.join(", "),
            lim = tris.len() + 1,
            like = tris.len() + 2,
        );

        let mut args: Vec<Box<dyn rusqlite::ToSql>> = tris
            .iter()
            .map(|t| Box::new(t.clone()) as Box<dyn rusqlite::ToSql>)
            .collect();
        args.push(Box::new((limit * 4) as i64));
        args.push(Box::new(format!("%{}%", needle)));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter().map(|a| a.as_ref())))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(decode_entry_offset(row, 1)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Count entries, optionally per source.
    pub fn count(&self, source_id: Option<&str>) -> Result<u64> {
        let count: u64 = match source_id {
            Some(source) => self.conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE source_id = ?1",
                [source],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// Count entries that already carry an embedding.
    pub fn count_embedded(&self, source_id: Option<&str>) -> Result<u64> {
        let count: u64 = match source_id {
            Some(source) => self.conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE embedding IS NOT NULL AND source_id = ?1",
                [source],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE embedding IS NOT NULL",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }
}

/// Little-endian f32 blob encoding for embeddings.
fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Lowercased character trigrams; strings shorter than 3 chars produce
/// themselves as a single token.
fn trigrams(s: &str) -> Vec<String> {
    let chars: Vec<char> = s.to_lowercase().chars().collect();
    if chars.len() < 3 {
        return vec![chars.iter().collect()];
    }
    let mut out = Vec::with_capacity(chars.len() - 2);
    for window in chars.windows(3) {
        out.push(window.iter().collect());
    }
    out.sort_unstable();
    out.dedup();
    out
}

fn decode_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    decode_entry_offset(row, 0)
}

fn decode_entry_offset(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Entry> {
    let embedding: Option<Vec<u8>> = row.get(offset + 7)?;
    let errors_text: String = row.get(offset + 13)?;
    Ok(Entry {
        id: row.get(offset)?,
        headword: row.get(offset + 1)?,
        ipa: row.get(offset + 2)?,
        language_code: row.get(offset + 3)?,
        definition: row.get(offset + 4)?,
        etymology: row.get(offset + 5)?,
        pos_tag: row.get(offset + 6)?,
        embedding: embedding.map(|b| decode_embedding(&b)),
        raw_ref: row.get(offset + 8)?,
        source_id: row.get(offset + 9)?,
        pipeline_fingerprint: row.get(offset + 10)?,
        pipeline_seq: row.get(offset + 11)?,
        quality: row.get(offset + 12)?,
        validation_errors: serde_json::from_str(&errors_text).unwrap_or_default(),
        created_at: row.get(offset + 14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id_word: &str, seq: u64) -> Entry {
        Entry {
            id: etymograph_core::entry_id(id_word, "en", "gloss"),
            headword: id_word.to_string(),
            ipa: None,
            language_code: "en".to_string(),
            definition: "gloss".to_string(),
            etymology: None,
            pos_tag: None,
            embedding: None,
            raw_ref: format!("ref-{}", id_word),
            source_id: "test-src".to_string(),
            pipeline_fingerprint: format!("fp-{}", seq),
            pipeline_seq: seq,
            quality: 0.8,
            validation_errors: Vec::new(),
            created_at: 1,
        }
    }

    #[test]
    fn test_bulk_upsert_insert_then_update() {
        let mut store = EntryStore::open_in_memory().unwrap();
        let stats = store
            .bulk_upsert(&[entry("father", 1), entry("mother", 1)])
            .unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.upserted, 0);

        let mut updated = entry("father", 2);
        updated.definition = "male parent".to_string();
        let stats = store.bulk_upsert(&[updated]).unwrap();
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.upserted, 1);

        let got = store.get(&entry("father", 1).id).unwrap().unwrap();
        assert_eq!(got.definition, "male parent");
        assert_eq!(got.pipeline_seq, 2);
    }

    #[test]
    fn test_stale_pipeline_does_not_overwrite() {
        let mut store = EntryStore::open_in_memory().unwrap();
        let mut v2 = entry("father", 2);
        v2.definition = "new definition".to_string();
        store.bulk_upsert(&[v2]).unwrap();

        let mut v1 = entry("father", 1);
        v1.definition = "old definition".to_string();
        store.bulk_upsert(&[v1]).unwrap();

        let got = store.get(&entry("father", 1).id).unwrap().unwrap();
        assert_eq!(got.definition, "new definition");
        assert_eq!(got.pipeline_seq, 2);
    }

    #[test]
    fn test_embedding_never_reverts() {
        let mut store = EntryStore::open_in_memory().unwrap();
        store.bulk_upsert(&[entry("father", 1)]).unwrap();
        let id = entry("father", 1).id;

        store
            .update_embeddings(&[(id.clone(), vec![0.5f32; 8])])
            .unwrap();
        assert!(store.get(&id).unwrap().unwrap().embedding.is_some());

        // Re-upsert without an embedding at a later seq: embedding survives
        let reprocessed = entry("father", 3);
        store.bulk_upsert(&[reprocessed]).unwrap();
        let got = store.get(&id).unwrap().unwrap();
        assert_eq!(got.pipeline_seq, 3);
        assert_eq!(got.embedding.unwrap(), vec![0.5f32; 8]);
    }

    #[test]
    fn test_validation_errors_accumulate_as_set() {
        let mut store = EntryStore::open_in_memory().unwrap();
        let mut first = entry("father", 1);
        first.validation_errors = vec!["short definition".to_string()];
        store.bulk_upsert(&[first]).unwrap();

        let mut second = entry("father", 2);
        second.validation_errors =
            vec!["short definition".to_string(), "no ipa".to_string()];
        store.bulk_upsert(&[second]).unwrap();

        let got = store.get(&entry("father", 1).id).unwrap().unwrap();
        let mut errors = got.validation_errors;
        errors.sort();
        assert_eq!(errors, vec!["no ipa", "short definition"]);
    }

    #[test]
    fn test_scan_with_filter_and_cursor() {
        let mut store = EntryStore::open_in_memory().unwrap();
        let mut de = entry("vater", 1);
        de.language_code = "de".to_string();
        store
            .bulk_upsert(&[entry("father", 1), entry("mother", 1), de])
            .unwrap();

        let filter = EntryFilter {
            language_code: Some("en".to_string()),
            ..Default::default()
        };
        let (first, cursor) = store.scan(&filter, 0, 1).unwrap();
        assert_eq!(first.len(), 1);
        let (rest, _) = store.scan(&filter, cursor, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_ne!(first[0].id, rest[0].id);
    }

    #[test]
    fn test_scan_missing_embedding_only() {
        let mut store = EntryStore::open_in_memory().unwrap();
        store
            .bulk_upsert(&[entry("father", 1), entry("mother", 1)])
            .unwrap();
        store
            .update_embeddings(&[(entry("father", 1).id, vec![0.1f32; 4])])
            .unwrap();

        let filter = EntryFilter {
            missing_embedding_only: true,
            ..Default::default()
        };
        let (rows, _) = store.scan(&filter, 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].headword, "mother");
    }

    #[test]
    fn test_search_headword_trigram() {
        let mut store = EntryStore::open_in_memory().unwrap();
        store
            .bulk_upsert(&[entry("father", 1), entry("mother", 1), entry("brother", 1)])
            .unwrap();

        let hits = store.search_headword("other", 10).unwrap();
        let words: Vec<&str> = hits.iter().map(|e| e.headword.as_str()).collect();
        assert!(words.contains(&"mother"));
        assert!(words.contains(&"brother"));
        assert!(!words.contains(&"father"));

        // Short queries fall back to LIKE
        let hits = store.search_headword("fa", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].headword, "father");
    }

    #[test]
    fn test_duplicate_ids_in_one_batch_last_wins() {
        let mut store = EntryStore::open_in_memory().unwrap();
        let mut a = entry("father", 1);
        a.quality = 0.1;
        let mut b = entry("father", 1);
        b.quality = 0.9;
        // Both rows share an id; staging keeps the later one
        store.bulk_upsert(&[a, b]).unwrap();
        let got = store.get(&entry("father", 1).id).unwrap().unwrap();
        assert!((got.quality - 0.9).abs() < 1e-6);
    }
}
