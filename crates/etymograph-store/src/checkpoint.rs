//! Pipeline checkpoint store
//!
//! A checkpoint records how far a named pipeline has committed: aggregate
//! counters plus a per-source cursor into the raw store. On restart the
//! source-side reader resumes after the committed cursor; downstream stages
//! are idempotent under replay because all writes key on deterministic ids.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use etymograph_core::now_millis;

use crate::error::{Result, StoreError};
use crate::schema;

/// Progress state of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pipeline_name: String,
    /// Unix millis of the last commit
    pub at: u64,
    /// Total records known, when the source size is known
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Raw-store scan cursor per source id
    pub per_source_cursor: HashMap<String, u64>,
}

impl Checkpoint {
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            ..Default::default()
        }
    }

    /// Cursor to resume a source from (0 = from the beginning).
    pub fn cursor_for(&self, source_id: &str) -> u64 {
        self.per_source_cursor.get(source_id).copied().unwrap_or(0)
    }
}

/// Durable checkpoint store.
pub struct CheckpointStore {
    conn: Connection,
}

impl CheckpointStore {
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

    /// Persist a checkpoint, replacing any previous one for the pipeline.
    pub fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.conn.execute(
            "INSERT INTO checkpoints
             (pipeline_name, at, total, processed, succeeded, failed, skipped, per_source_cursor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(pipeline_name) DO UPDATE SET
                 at = excluded.at,
                 total = excluded.total,
                 processed = excluded.processed,
                 succeeded = excluded.succeeded,
                 failed = excluded.failed,
                 skipped = excluded.skipped,
                 per_source_cursor = excluded.per_source_cursor",
            params![
                checkpoint.pipeline_name,
                if checkpoint.at == 0 {
                    now_millis()
                } else {
                    checkpoint.at
                },
                checkpoint.total,
                checkpoint.processed,
                checkpoint.succeeded,
                checkpoint.failed,
                checkpoint.skipped,
                serde_json::to_string(&checkpoint.per_source_cursor)?,
            ],
        )?;
        Ok(())
    }

    /// Load the checkpoint for a pipeline, if one exists.
    pub fn load(&self, pipeline_name: &str) -> Result<Option<Checkpoint>> {
        self.conn
            .query_row(
                "SELECT pipeline_name, at, total, processed, succeeded, failed, skipped,
                        per_source_cursor
                 FROM checkpoints WHERE pipeline_name = ?1",
                [pipeline_name],
                |row| {
                    let cursors_text: String = row.get(7)?;
                    Ok(Checkpoint {
                        pipeline_name: row.get(0)?,
                        at: row.get(1)?,
                        total: row.get(2)?,
                        processed: row.get(3)?,
                        succeeded: row.get(4)?,
                        failed: row.get(5)?,
                        skipped: row.get(6)?,
                        per_source_cursor: serde_json::from_str(&cursors_text)
                            .unwrap_or_default(),
                    })
                },
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Load a checkpoint or fail with a typed error.
    pub fn require(&self, pipeline_name: &str) -> Result<Checkpoint> {
        self.load(pipeline_name)?
            .ok_or_else(|| StoreError::CheckpointNotFound(pipeline_name.to_string()))
    }

    /// Remove a checkpoint (after a completed run).
    pub fn clear(&mut self, pipeline_name: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM checkpoints WHERE pipeline_name = ?1",
            [pipeline_name],
        )?;
        Ok(())
    }
}
