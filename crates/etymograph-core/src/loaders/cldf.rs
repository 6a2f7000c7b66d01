//! CLDF dataset loader
//!
//! A CLDF dataset is a JSON metadata descriptor referencing delimited
//! tables. The loader resolves the FormTable (streamed row by row) against
//! the LanguageTable and ParameterTable (small reference tables held in
//! memory), producing one record per form.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::record::{Origin, RawRecord};

use super::{Loader, LoaderFormat, RecordIter};

const FORM_TABLE: &str = "FormTable";
const LANGUAGE_TABLE: &str = "LanguageTable";
const PARAMETER_TABLE: &str = "ParameterTable";

/// Loader for CLDF datasets (metadata descriptor + delimited tables).
pub struct CldfLoader;

impl Loader for CldfLoader {
    fn format(&self) -> LoaderFormat {
        LoaderFormat::Cldf
    }

    fn load(&self, path: &Path, source_id: &str) -> Result<RecordIter> {
        let descriptor: Value = serde_json::from_reader(File::open(path).map_err(|e| {
            CoreError::SourceFormat {
                path: path.display().to_string(),
                message: format!("cannot open descriptor: {}", e),
            }
        })?)
        .map_err(|e| CoreError::SourceFormat {
            path: path.display().to_string(),
            message: format!("bad descriptor JSON: {}", e),
        })?;

        let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

        let form_path = table_path(&descriptor, &base_dir, FORM_TABLE).ok_or_else(|| {
            CoreError::SourceFormat {
                path: path.display().to_string(),
                message: "descriptor has no FormTable".to_string(),
            }
        })?;

        // Reference tables are bounded by the number of languages/concepts
        // in the dataset, not by the number of forms.
        let languages = table_path(&descriptor, &base_dir, LANGUAGE_TABLE)
            .map(|p| load_reference(&p, &["ISO639P3code", "Glottocode"]))
            .transpose()?
            .unwrap_or_default();
        let parameters = table_path(&descriptor, &base_dir, PARAMETER_TABLE)
            .map(|p| load_reference(&p, &["Name", "Concepticon_Gloss"]))
            .transpose()?
            .unwrap_or_default();
        debug!(
            "cldf reference tables: {} languages, {} parameters",
            languages.len(),
            parameters.len()
        );

        let mut reader = csv::Reader::from_path(&form_path).map_err(|e| CoreError::SourceFormat {
            path: form_path.display().to_string(),
            message: format!("cannot open form table: {}", e),
        })?;
        let headers = reader
            .headers()
            .map_err(|e| CoreError::SourceFormat {
                path: form_path.display().to_string(),
                message: format!("form table has no header: {}", e),
            })?
            .clone();

        let file_path = form_path.display().to_string();
        let source_id = source_id.to_string();
        let col = |name: &str| headers.iter().position(|h| h == name);
        let form_col = col("Form");
        let lang_col = col("Language_ID");
        let param_col = col("Parameter_ID");
        let segments_col = col("Segments");

        let iter = reader
            .into_records()
            .enumerate()
            .map(move |(idx, row)| {
                let line_no = idx as u64 + 2; // header is line 1
                let origin = Origin {
                    file_path: file_path.clone(),
                    line_no,
                };
                let row = row.map_err(|e| CoreError::RecordParse {
                    origin: origin.to_string(),
                    message: e.to_string(),
                })?;

                let cell = |i: Option<usize>| i.and_then(|i| row.get(i)).map(str::trim);
                let form = cell(form_col).filter(|s| !s.is_empty()).ok_or_else(|| {
                    CoreError::RecordParse {
                        origin: origin.to_string(),
                        message: "missing Form".to_string(),
                    }
                })?;

                let mut map = Map::new();
                map.insert("word".to_string(), json!(form));
                if let Some(lang_id) = cell(lang_col).filter(|s| !s.is_empty()) {
                    let code = languages
                        .get(lang_id)
                        .map(String::as_str)
                        .unwrap_or(lang_id);
                    map.insert("lang_code".to_string(), json!(code));
                }
                if let Some(param_id) = cell(param_col).filter(|s| !s.is_empty()) {
                    let gloss = parameters
                        .get(param_id)
                        .map(String::as_str)
                        .unwrap_or(param_id);
                    map.insert("senses".to_string(), json!([{ "glosses": [gloss] }]));
                }
                if let Some(segments) = cell(segments_col).filter(|s| !s.is_empty()) {
                    let ipa: String = segments.split_whitespace().collect();
                    map.insert("sounds".to_string(), json!([{ "ipa": ipa }]));
                }

                Ok(RawRecord::new(
                    source_id.clone(),
                    Value::Object(map),
                    origin,
                ))
            });

        Ok(Box::new(iter))
    }
}

/// Resolve a table's file path by its `dc:conformsTo` term.
fn table_path(descriptor: &Value, base_dir: &Path, term: &str) -> Option<PathBuf> {
    descriptor
        .get("tables")
        .and_then(Value::as_array)?
        .iter()
        .find(|t| {
            t.get("dc:conformsTo")
                .and_then(Value::as_str)
                .is_some_and(|c| c.ends_with(term))
        })
        .and_then(|t| t.get("url").and_then(Value::as_str))
        .map(|url| base_dir.join(url))
}

/// Load an ID → display-value map from a reference table.
///
/// The first of `value_columns` that exists and is non-empty per row wins;
/// rows with none keep their ID.
fn load_reference(path: &Path, value_columns: &[&str]) -> Result<HashMap<String, String>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| CoreError::SourceFormat {
        path: path.display().to_string(),
        message: format!("cannot open reference table: {}", e),
    })?;
    let headers = reader
        .headers()
        .map_err(|e| CoreError::SourceFormat {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .clone();

    let id_col = headers
        .iter()
        .position(|h| h == "ID")
        .ok_or_else(|| CoreError::SourceFormat {
            path: path.display().to_string(),
            message: "reference table has no ID column".to_string(),
        })?;
    let value_cols: Vec<usize> = value_columns
        .iter()
        .filter_map(|name| headers.iter().position(|h| h == *name))
        .collect();

    let mut map = HashMap::new();
    for row in reader.into_records() {
        let row = row.map_err(|e| CoreError::SourceFormat {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let Some(id) = row.get(id_col).map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        let value = value_cols
            .iter()
            .filter_map(|&i| row.get(i))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .unwrap_or(id);
        map.insert(id.to_string(), value.to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn dataset(dir: &Path) -> PathBuf {
        write_file(
            dir,
            "forms.csv",
            "ID,Language_ID,Parameter_ID,Form,Segments\n1,lat,father,pater,p a t e r\n2,deu,father,vater,f aː t ɐ\n3,lat,mother,,\n",
        );
        write_file(
            dir,
            "languages.csv",
            "ID,Name,ISO639P3code\nlat,Latin,lat\ndeu,German,deu\n",
        );
        write_file(
            dir,
            "parameters.csv",
            "ID,Name\nfather,male parent\nmother,female parent\n",
        );
        write_file(
            dir,
            "metadata.json",
            r#"{"tables": [
                {"url": "forms.csv", "dc:conformsTo": "http://cldf.clld.org/v1.0/terms.rdf#FormTable"},
                {"url": "languages.csv", "dc:conformsTo": "http://cldf.clld.org/v1.0/terms.rdf#LanguageTable"},
                {"url": "parameters.csv", "dc:conformsTo": "http://cldf.clld.org/v1.0/terms.rdf#ParameterTable"}
            ]}"#,
        )
    }

    #[test]
    fn test_forms_joined_with_references() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dataset(dir.path());
        let records: Vec<_> = CldfLoader.load(&descriptor, "cldf").unwrap().collect();
        assert_eq!(records.len(), 3);

        let first = records[0].as_ref().unwrap();
        assert_eq!(first.payload["word"], "pater");
        assert_eq!(first.payload["lang_code"], "lat");
        assert_eq!(first.payload["senses"][0]["glosses"][0], "male parent");
        assert_eq!(first.payload["sounds"][0]["ipa"], "pater");

        // Empty Form is a per-record error, not a fatal one
        assert!(records[2].is_err());
    }

    #[test]
    fn test_missing_form_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = write_file(dir.path(), "metadata.json", r#"{"tables": []}"#);
        assert!(CldfLoader.load(&descriptor, "cldf").is_err());
    }
}
