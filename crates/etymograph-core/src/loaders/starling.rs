//! Starling flat-file loader
//!
//! Starling databases export as blocks of `\<marker> <value>` lines
//! terminated by a blank line. The markers used by etymological databases:
//!
//! | marker | meaning |
//! |--------|---------|
//! | `lx` | lexeme (headword) |
//! | `ph` | phonetic form (IPA) |
//! | `lg` | language code |
//! | `ps` | part of speech |
//! | `de` | definition/gloss |
//! | `et` | etymology |

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use serde_json::{json, Map, Value};

use crate::error::{CoreError, Result};
use crate::record::{Origin, RawRecord};

use super::{Loader, LoaderFormat, RecordIter};

/// Loader for Starling backslash-marker blocks.
pub struct StarlingLoader;

impl Loader for StarlingLoader {
    fn format(&self) -> LoaderFormat {
        LoaderFormat::Starling
    }

    fn load(&self, path: &Path, source_id: &str) -> Result<RecordIter> {
        let file = File::open(path).map_err(|e| CoreError::SourceFormat {
            path: path.display().to_string(),
            message: format!("cannot open: {}", e),
        })?;

        Ok(Box::new(BlockIter {
            lines: BufReader::new(file).lines(),
            file_path: path.display().to_string(),
            source_id: source_id.to_string(),
            line_no: 0,
            done: false,
        }))
    }
}

struct BlockIter {
    lines: Lines<BufReader<File>>,
    file_path: String,
    source_id: String,
    line_no: u64,
    done: bool,
}

impl Iterator for BlockIter {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            // Accumulate one block: marker lines until a blank line or EOF.
            let mut markers: Vec<(String, String)> = Vec::new();
            let mut block_start = 0u64;
            let mut malformed: Option<String> = None;

            loop {
                match self.lines.next() {
                    None => {
                        self.done = true;
                        break;
                    }
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(CoreError::SourceFormat {
                            path: self.file_path.clone(),
                            message: format!("read failed at line {}: {}", self.line_no + 1, e),
                        }));
                    }
                    Some(Ok(line)) => {
                        self.line_no += 1;
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            if markers.is_empty() && malformed.is_none() {
                                continue; // leading blank lines
                            }
                            break;
                        }
                        if markers.is_empty() && malformed.is_none() {
                            block_start = self.line_no;
                        }
                        match parse_marker_line(trimmed) {
                            Some((marker, value)) => markers.push((marker, value)),
                            None => {
                                malformed
                                    .get_or_insert_with(|| format!("bad marker line: {}", trimmed));
                            }
                        }
                    }
                }
            }

            let origin = Origin {
                file_path: self.file_path.clone(),
                line_no: block_start,
            };
            if let Some(message) = malformed {
                return Some(Err(CoreError::RecordParse {
                    origin: origin.to_string(),
                    message,
                }));
            }
            if markers.is_empty() {
                if self.done {
                    return None;
                }
                continue;
            }
            return Some(Ok(RawRecord::new(
                self.source_id.clone(),
                block_payload(&markers),
                origin,
            )));
        }
    }
}

/// Parse one `\<marker> <value>` line.
fn parse_marker_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix('\\')?;
    let (marker, value) = rest.split_once(char::is_whitespace)?;
    if marker.is_empty() {
        return None;
    }
    Some((marker.to_string(), value.trim().to_string()))
}

/// Map a marker block onto the common payload shape.
fn block_payload(markers: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (marker, value) in markers {
        match marker.as_str() {
            "lx" => {
                map.insert("word".to_string(), json!(value));
            }
            "ph" => {
                map.insert("sounds".to_string(), json!([{ "ipa": value }]));
            }
            "lg" => {
                map.insert("lang_code".to_string(), json!(value));
            }
            "ps" => {
                map.insert("pos".to_string(), json!(value));
            }
            "de" => {
                map.insert("senses".to_string(), json!([{ "glosses": [value] }]));
            }
            "et" => {
                map.insert("etymology_text".to_string(), json!(value));
            }
            other => {
                // Unknown markers ride along under their own name.
                map.insert(format!("starling_{}", other), json!(value));
            }
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_blocks_become_records() {
        let f = write_temp(
            "\\lx pater\n\\lg la\n\\ps noun\n\\de male parent\n\\ph ˈpa.ter\n\n\\lx mater\n\\lg la\n\\de female parent\n",
        );
        let records: Vec<_> = StarlingLoader.load(f.path(), "star").unwrap().collect();
        assert_eq!(records.len(), 2);

        let first = records[0].as_ref().unwrap();
        assert_eq!(first.payload["word"], "pater");
        assert_eq!(first.payload["lang_code"], "la");
        assert_eq!(first.payload["senses"][0]["glosses"][0], "male parent");
        assert_eq!(first.payload["sounds"][0]["ipa"], "ˈpa.ter");
        assert_eq!(first.origin.line_no, 1);

        let second = records[1].as_ref().unwrap();
        assert_eq!(second.payload["word"], "mater");
        assert_eq!(second.origin.line_no, 7);
    }

    #[test]
    fn test_malformed_block_is_per_record_error() {
        let f = write_temp("\\lx pater\nno marker here\n\n\\lx mater\n\\lg la\n");
        let records: Vec<_> = StarlingLoader.load(f.path(), "star").unwrap().collect();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_err());
        assert!(records[1].is_ok());
    }

    #[test]
    fn test_unknown_marker_preserved() {
        let f = write_temp("\\lx pater\n\\lg la\n\\nt see also mater\n");
        let records: Vec<_> = StarlingLoader.load(f.path(), "star").unwrap().collect();
        let rec = records[0].as_ref().unwrap();
        assert_eq!(rec.payload["starling_nt"], "see also mater");
    }
}
