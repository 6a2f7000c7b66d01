//! Line-delimited JSON loader
//!
//! One JSON object per line, Wiktionary-extract style. The payload already
//! uses the common key shape, so lines pass through unmodified apart from
//! checksum computation.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::record::{Origin, RawRecord};

use super::{Loader, LoaderFormat, RecordIter};

/// Loader for line-delimited JSON objects.
pub struct JsonlLoader;

impl Loader for JsonlLoader {
    fn format(&self) -> LoaderFormat {
        LoaderFormat::Json
    }

    fn load(&self, path: &Path, source_id: &str) -> Result<RecordIter> {
        let file = File::open(path).map_err(|e| CoreError::SourceFormat {
            path: path.display().to_string(),
            message: format!("cannot open: {}", e),
        })?;
        debug!("streaming jsonl source {}", path.display());

        let reader = BufReader::new(file);
        let file_path = path.display().to_string();
        let source_id = source_id.to_string();

        let iter = reader
            .lines()
            .enumerate()
            .filter_map(move |(idx, line)| {
                let line_no = idx as u64 + 1;
                let origin = Origin {
                    file_path: file_path.clone(),
                    line_no,
                };
                match line {
                    Err(e) => Some(Err(CoreError::SourceFormat {
                        path: origin.file_path,
                        message: format!("read failed at line {}: {}", line_no, e),
                    })),
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => match serde_json::from_str::<Value>(&line) {
                        Ok(Value::Object(obj)) => Some(Ok(RawRecord::new(
                            source_id.clone(),
                            Value::Object(obj),
                            origin,
                        ))),
                        Ok(_) => Some(Err(CoreError::RecordParse {
                            origin: origin.to_string(),
                            message: "line is not a JSON object".to_string(),
                        })),
                        Err(e) => Some(Err(CoreError::RecordParse {
                            origin: origin.to_string(),
                            message: e.to_string(),
                        })),
                    },
                }
            });

        Ok(Box::new(iter))
    }
}
