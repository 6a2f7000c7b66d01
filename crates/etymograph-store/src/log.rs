//! Transform log store
//!
//! Append-only record of every cleaner application, partitioned by raw
//! record checksum. No cross-worker coordination is required: each writer
//! appends rows for the records it processed.

use std::path::Path;

use rusqlite::{params, Connection};
use serde_json::Value;

use etymograph_core::{TransformLog, TransformStep};

use crate::error::Result;
use crate::schema;

/// Append-only transform log store.
pub struct TransformLogStore {
    conn: Connection,
}

impl TransformLogStore {
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

    /// Append a batch of logs in one transaction.
    pub fn append_many(&mut self, logs: &[TransformLog]) -> Result<usize> {
        if logs.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO transform_log
                 (raw_ref, step_name, step_version, params, at, duration_ms, ok, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for log in logs {
                for step in &log.steps {
                    stmt.execute(params![
                        log.raw_ref,
                        step.step_name,
                        step.step_version,
                        serde_json::to_string(&step.parameters)?,
                        step.at,
                        step.duration_ms,
                        step.success as i64,
                        step.error,
                    ])?;
                    written += 1;
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Read the ordered step history of one raw record.
    pub fn fetch(&self, raw_ref: &str) -> Result<TransformLog> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT step_name, step_version, params, at, duration_ms, ok, error
             FROM transform_log WHERE raw_ref = ?1 ORDER BY id",
        )?;
        let steps = stmt
            .query_map([raw_ref], |row| {
                let params_text: String = row.get(2)?;
                let ok: i64 = row.get(5)?;
                Ok(TransformStep {
                    step_name: row.get(0)?,
                    step_version: row.get(1)?,
                    parameters: serde_json::from_str(&params_text).unwrap_or(Value::Null),
                    at: row.get(3)?,
                    duration_ms: row.get(4)?,
                    success: ok != 0,
                    error: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(TransformLog {
            raw_ref: raw_ref.to_string(),
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(raw_ref: &str, names: &[&str]) -> TransformLog {
        TransformLog {
            raw_ref: raw_ref.to_string(),
            steps: names
                .iter()
                .enumerate()
                .map(|(i, name)| TransformStep {
                    step_name: name.to_string(),
                    step_version: 1,
                    parameters: json!({ "order": i }),
                    at: 1000 + i as u64,
                    duration_ms: 3,
                    success: true,
                    error: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_append_and_fetch_preserves_order() {
        let mut store = TransformLogStore::open_in_memory().unwrap();
        let written = store
            .append_many(&[log("aaa", &["strip", "normalize"]), log("bbb", &["strip"])])
            .unwrap();
        assert_eq!(written, 3);

        let fetched = store.fetch("aaa").unwrap();
        assert_eq!(fetched.steps.len(), 2);
        assert_eq!(fetched.steps[0].step_name, "strip");
        assert_eq!(fetched.steps[1].step_name, "normalize");
        assert_eq!(fetched.steps[1].parameters["order"], 1);
    }

    #[test]
    fn test_append_only_accumulates() {
        let mut store = TransformLogStore::open_in_memory().unwrap();
        store.append_many(&[log("aaa", &["strip"])]).unwrap();
        store.append_many(&[log("aaa", &["normalize"])]).unwrap();
        let fetched = store.fetch("aaa").unwrap();
        assert_eq!(fetched.steps.len(), 2);
    }
}
