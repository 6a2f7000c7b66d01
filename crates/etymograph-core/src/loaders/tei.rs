//! TEI XML lexicon loader
//!
//! Streams `<entry>` elements from a TEI dictionary without building a DOM.
//! Inside an entry the loader collects `<orth>` (headword), `<pron>` (IPA),
//! `<gramGrp>` text (part of speech) and the first `<def>` (gloss); the
//! entry's `xml:lang` attribute supplies the language code. Origin offsets
//! are byte positions, since XML has no useful line discipline.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{json, Map, Value};

use crate::error::{CoreError, Result};
use crate::record::{Origin, RawRecord};

use super::{Loader, LoaderFormat, RecordIter};

/// Loader for TEI-style XML lexicons.
pub struct TeiLoader;

impl Loader for TeiLoader {
    fn format(&self) -> LoaderFormat {
        LoaderFormat::Tei
    }

    fn load(&self, path: &Path, source_id: &str) -> Result<RecordIter> {
        let reader = Reader::from_file(path).map_err(|e| CoreError::SourceFormat {
            path: path.display().to_string(),
            message: format!("cannot open: {}", e),
        })?;

        Ok(Box::new(EntryIter {
            reader,
            buf: Vec::with_capacity(256),
            file_path: path.display().to_string(),
            source_id: source_id.to_string(),
            done: false,
        }))
    }
}

struct EntryIter {
    reader: Reader<BufReader<File>>,
    buf: Vec<u8>,
    file_path: String,
    source_id: String,
    done: bool,
}

/// Per-entry accumulation state.
#[derive(Default)]
struct EntryState {
    lang: Option<String>,
    orth: Option<String>,
    pron: Option<String>,
    pos: Option<String>,
    def: Option<String>,
    /// Leaf element currently capturing text
    capture: Option<Field>,
    in_gram_grp: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Orth,
    Pron,
    Pos,
    Def,
}

impl Iterator for EntryIter {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut state: Option<EntryState> = None;
        let mut entry_offset = 0u64;

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(ev) => ev,
                Err(e) => {
                    // Structural XML breakage is fatal for the whole source.
                    self.done = true;
                    return Some(Err(CoreError::SourceFormat {
                        path: self.file_path.clone(),
                        message: format!(
                            "malformed XML near offset {}: {}",
                            self.reader.buffer_position(),
                            e
                        ),
                    }));
                }
            };

            match event {
                Event::Eof => {
                    self.done = true;
                    return None;
                }
                Event::Start(ref e) => {
                    let name = e.local_name();
                    match name.as_ref() {
                        b"entry" => {
                            entry_offset = self.reader.buffer_position() as u64;
                            let mut st = EntryState::default();
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"xml:lang" {
                                    if let Ok(v) = attr.unescape_value() {
                                        st.lang = Some(v.into_owned());
                                    }
                                }
                            }
                            state = Some(st);
                        }
                        b"orth" => set_capture(&mut state, Field::Orth),
                        b"pron" => set_capture(&mut state, Field::Pron),
                        b"def" => set_capture(&mut state, Field::Def),
                        b"gramGrp" => {
                            if let Some(st) = state.as_mut() {
                                st.in_gram_grp = true;
                            }
                        }
                        b"pos" => {
                            if state.as_ref().is_some_and(|st| st.in_gram_grp) {
                                set_capture(&mut state, Field::Pos);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(ref t) => {
                    if let Some(st) = state.as_mut() {
                        if let Some(field) = st.capture {
                            if let Ok(text) = t.unescape() {
                                append_text(st, field, text.trim());
                            }
                        }
                    }
                }
                Event::End(ref e) => {
                    let name = e.local_name();
                    match name.as_ref() {
                        b"entry" => {
                            if let Some(st) = state.take() {
                                return Some(Ok(RawRecord::new(
                                    self.source_id.clone(),
                                    entry_payload(st),
                                    Origin {
                                        file_path: self.file_path.clone(),
                                        line_no: entry_offset,
                                    },
                                )));
                            }
                        }
                        b"orth" | b"pron" | b"def" | b"pos" => {
                            if let Some(st) = state.as_mut() {
                                st.capture = None;
                            }
                        }
                        b"gramGrp" => {
                            if let Some(st) = state.as_mut() {
                                st.in_gram_grp = false;
                                st.capture = None;
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }
}

fn set_capture(state: &mut Option<EntryState>, field: Field) {
    if let Some(st) = state.as_mut() {
        st.capture = Some(field);
    }
}

fn append_text(st: &mut EntryState, field: Field, text: &str) {
    if text.is_empty() {
        return;
    }
    let slot = match field {
        Field::Orth => &mut st.orth,
        Field::Pron => &mut st.pron,
        Field::Pos => &mut st.pos,
        Field::Def => &mut st.def,
    };
    match slot {
        // First <def> wins; repeated text nodes within one element concatenate.
        Some(existing) if field == Field::Def && !existing.is_empty() => {}
        Some(existing) => {
            existing.push(' ');
            existing.push_str(text);
        }
        None => *slot = Some(text.to_string()),
    }
}

fn entry_payload(st: EntryState) -> Value {
    let mut map = Map::new();
    if let Some(orth) = st.orth {
        map.insert("word".to_string(), json!(orth));
    }
    if let Some(lang) = st.lang {
        map.insert("lang_code".to_string(), json!(lang));
    }
    if let Some(pos) = st.pos {
        map.insert("pos".to_string(), json!(pos));
    }
    if let Some(def) = st.def {
        map.insert("senses".to_string(), json!([{ "glosses": [def] }]));
    }
    if let Some(pron) = st.pron {
        map.insert("sounds".to_string(), json!([{ "ipa": pron }]));
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
    fn test_entries_extracted() {
        let f = write_temp(
            r#"<TEI><body>
            <entry xml:lang="la">
              <form><orth>pater</orth><pron>ˈpa.ter</pron></form>
              <gramGrp><pos>noun</pos></gramGrp>
              <sense><def>male parent</def></sense>
            </entry>
            <entry xml:lang="la">
              <form><orth>mater</orth></form>
              <sense><def>female parent</def></sense>
            </entry>
            </body></TEI>"#,
        );
        let records: Vec<_> = TeiLoader.load(f.path(), "tei").unwrap().collect();
        assert_eq!(records.len(), 2);

        let first = records[0].as_ref().unwrap();
        assert_eq!(first.payload["word"], "pater");
        assert_eq!(first.payload["lang_code"], "la");
        assert_eq!(first.payload["pos"], "noun");
        assert_eq!(first.payload["senses"][0]["glosses"][0], "male parent");
        assert_eq!(first.payload["sounds"][0]["ipa"], "ˈpa.ter");

        let second = records[1].as_ref().unwrap();
        assert_eq!(second.payload["word"], "mater");
        assert!(second.payload.get("pos").is_none());
    }

    #[test]
    fn test_malformed_xml_is_fatal() {
        let f = write_temp("<TEI><entry><orth>broken</TEI>");
        let records: Vec<_> = TeiLoader.load(f.path(), "tei").unwrap().collect();
        assert_eq!(records.len(), 1);
        let err = records[0].as_ref().err().unwrap();
        assert!(matches!(err, CoreError::SourceFormat { .. }));
    }
}
