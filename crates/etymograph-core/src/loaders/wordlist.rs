//! CSV wordlist loader
//!
//! Comparative wordlists put one semantic concept per row: the first column
//! names the concept, every other column is a language, and each non-empty
//! cell is one word. A row therefore fans out into up to `columns - 1`
//! records.

use std::path::Path;

use serde_json::{json, Map, Value};

use crate::error::{CoreError, Result};
use crate::record::{Origin, RawRecord};

use super::{Loader, LoaderFormat, RecordIter};

/// Loader for concept-by-language CSV wordlists.
pub struct CsvWordlistLoader;

impl Loader for CsvWordlistLoader {
    fn format(&self) -> LoaderFormat {
        LoaderFormat::Csv
    }

    fn load(&self, path: &Path, source_id: &str) -> Result<RecordIter> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| CoreError::SourceFormat {
            path: path.display().to_string(),
            message: format!("cannot open: {}", e),
        })?;
        let headers = reader
            .headers()
            .map_err(|e| CoreError::SourceFormat {
                path: path.display().to_string(),
                message: format!("missing header row: {}", e),
            })?
            .clone();
        if headers.len() < 2 {
            return Err(CoreError::SourceFormat {
                path: path.display().to_string(),
                message: "wordlist needs a concept column and at least one language column"
                    .to_string(),
            });
        }

        let languages: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();
        let file_path = path.display().to_string();
        let source_id = source_id.to_string();

        let iter = reader
            .into_records()
            .enumerate()
            .flat_map(move |(idx, row)| {
                let line_no = idx as u64 + 2;
                let origin = Origin {
                    file_path: file_path.clone(),
                    line_no,
                };
                let row = match row {
                    Ok(row) => row,
                    Err(e) => {
                        return vec![Err(CoreError::RecordParse {
                            origin: origin.to_string(),
                            message: e.to_string(),
                        })];
                    }
                };
                let concept = row.get(0).map(str::trim).unwrap_or("").to_string();
                if concept.is_empty() {
                    return vec![Err(CoreError::RecordParse {
                        origin: origin.to_string(),
                        message: "empty concept column".to_string(),
                    })];
                }

                languages
                    .iter()
                    .enumerate()
                    .filter_map(|(lang_idx, lang)| {
                        let word = row.get(lang_idx + 1).map(str::trim).unwrap_or("");
                        if word.is_empty() {
                            return None;
                        }
                        let mut map = Map::new();
                        map.insert("word".to_string(), json!(word));
                        map.insert("lang_code".to_string(), json!(lang));
                        map.insert(
                            "senses".to_string(),
                            json!([{ "glosses": [concept.clone()] }]),
                        );
                        Some(Ok(RawRecord::new(
                            source_id.clone(),
                            Value::Object(map),
                            origin.clone(),
                        )))
                    })
                    .collect::<Vec<_>>()
            });

        Ok(Box::new(iter))
    }
}
