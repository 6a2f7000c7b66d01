//! Source loaders
//!
//! A loader turns one input file into a lazy, finite stream of
//! [`RawRecord`]s. Loaders never buffer the whole file: each implementation
//! holds only per-record parsing state (plus, for CLDF, the small reference
//! tables the form rows point into).
//!
//! Whatever the source format, loaders emit payloads in the common key shape
//! (`word`, `lang_code`, `pos`, `senses[].glosses[]`, `sounds[].ipa`,
//! `etymology_text`) so the cleaner pipeline probes one schema. Extra keys
//! from the source are preserved verbatim.
//!
//! Per-record failures surface as `Err` items in the stream and are counted
//! and skipped downstream; a broken file or descriptor is a fatal
//! [`CoreError::SourceFormat`](crate::CoreError::SourceFormat).

mod cldf;
mod jsonl;
mod starling;
mod tei;
mod wordlist;

pub use cldf::CldfLoader;
pub use jsonl::JsonlLoader;
pub use starling::StarlingLoader;
pub use tei::TeiLoader;
pub use wordlist::CsvWordlistLoader;

use std::path::Path;

use crate::error::Result;
use crate::record::RawRecord;

/// Supported source formats, as selected by `--format` on the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderFormat {
    /// Line-delimited JSON objects (Wiktionary-style extracts)
    Json,
    /// CLDF dataset: JSON descriptor referencing delimited tables
    Cldf,
    /// Starling flat-file: backslash-marker blocks
    Starling,
    /// TEI XML lexicon entries
    Tei,
    /// CSV wordlist: concept column plus language columns
    Csv,
}

impl LoaderFormat {
    /// Parse a CLI format name.
    pub fn detect(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" | "jsonl" => Ok(LoaderFormat::Json),
            "cldf" => Ok(LoaderFormat::Cldf),
            "starling" => Ok(LoaderFormat::Starling),
            "tei" | "xml" => Ok(LoaderFormat::Tei),
            "csv" => Ok(LoaderFormat::Csv),
            other => Err(crate::CoreError::UnknownFormat(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderFormat::Json => "json",
            LoaderFormat::Cldf => "cldf",
            LoaderFormat::Starling => "starling",
            LoaderFormat::Tei => "tei",
            LoaderFormat::Csv => "csv",
        }
    }
}

impl std::fmt::Display for LoaderFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lazy stream of raw records; `Err` items are per-record failures.
pub type RecordIter = Box<dyn Iterator<Item = Result<RawRecord>> + Send>;

/// A source loader: one input path in, a lazy record stream out.
pub trait Loader: Send + Sync {
    /// The format this loader handles.
    fn format(&self) -> LoaderFormat;

    /// Open `path` and stream records attributed to `source_id`.
    fn load(&self, path: &Path, source_id: &str) -> Result<RecordIter>;
}

/// Construct the loader for a format.
pub fn loader_for(format: LoaderFormat) -> Box<dyn Loader> {
    match format {
        LoaderFormat::Json => Box::new(JsonlLoader),
        LoaderFormat::Cldf => Box::new(CldfLoader),
        LoaderFormat::Starling => Box::new(StarlingLoader),
        LoaderFormat::Tei => Box::new(TeiLoader),
        LoaderFormat::Csv => Box::new(CsvWordlistLoader),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detect() {
        assert_eq!(LoaderFormat::detect("json").unwrap(), LoaderFormat::Json);
        assert_eq!(LoaderFormat::detect("JSONL").unwrap(), LoaderFormat::Json);
        assert_eq!(LoaderFormat::detect("tei").unwrap(), LoaderFormat::Tei);
        assert!(LoaderFormat::detect("parquet").is_err());
    }

    #[test]
    fn test_loader_for_reports_format() {
        for format in [
            LoaderFormat::Json,
            LoaderFormat::Cldf,
            LoaderFormat::Starling,
            LoaderFormat::Tei,
            LoaderFormat::Csv,
        ] {
            assert_eq!(loader_for(format).format(), format);
        }
    }
}
