//! The standard cleaners
//!
//! Each cleaner touches the narrowest set of fields it can. Versions are
//! bumped on any behavioral change; the pipeline fingerprint depends on
//! them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use unicode_normalization::UnicodeNormalization;

use crate::entry::EntryDraft;
use crate::validate::{is_iso639_shaped, is_valid_ipa};

use super::Cleaner;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static WIKI_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[(?:[^|\]]*\|)?([^\]]*)\]\]").expect("valid regex"));
static TEMPLATE_MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{[^}]*\}\}").expect("valid regex"));

fn collapse_whitespace(s: &str) -> String {
    WHITESPACE_RUN.replace_all(s.trim(), " ").into_owned()
}

// ============================================================================
// headword-stripper
// ============================================================================

/// Strips editorial markup off headwords: bracket characters, glottal
/// markup, and the leading `*` that marks reconstructed proto-forms.
pub struct HeadwordStripper;

impl Cleaner for HeadwordStripper {
    fn name(&self) -> &'static str {
        "headword-stripper"
    }

    fn version(&self) -> u32 {
        1
    }

    fn apply(&self, mut draft: EntryDraft) -> EntryDraft {
        let stripped: String = draft
            .headword
            .trim()
            .trim_start_matches('*')
            .chars()
            .filter(|c| !matches!(c, '[' | ']' | '(' | ')' | '{' | '}' | '<' | '>' | 'ˀ'))
            .collect();
        draft.headword = collapse_whitespace(&stripped);
        draft
    }

    fn validate(&self, draft: &EntryDraft) -> bool {
        !draft.headword.is_empty()
    }
}

// ============================================================================
// text-normalizer
// ============================================================================

/// Unicode NFC, optional casefold, whitespace collapse over the text fields.
pub struct TextNormalizer {
    pub casefold: bool,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self { casefold: true }
    }
}

impl Cleaner for TextNormalizer {
    fn name(&self) -> &'static str {
        "text-normalizer"
    }

    fn version(&self) -> u32 {
        2
    }

    fn parameters(&self) -> Value {
        json!({ "casefold": self.casefold })
    }

    fn apply(&self, mut draft: EntryDraft) -> EntryDraft {
        let normalize = |s: &str| -> String {
            let nfc: String = s.nfc().collect();
            let folded = if self.casefold {
                nfc.to_lowercase()
            } else {
                nfc
            };
            collapse_whitespace(&folded)
        };
        draft.headword = normalize(&draft.headword);
        draft.definition = normalize(&draft.definition);
        if let Some(ety) = draft.etymology.take() {
            draft.etymology = Some(normalize(&ety)).filter(|s| !s.is_empty());
        }
        draft
    }
}

// ============================================================================
// ipa-normalizer
// ============================================================================

/// Strips phonemic/phonetic delimiters, NFC-normalizes, and removes
/// whitespace from the IPA field. Diacritics are retained; the whitelist
/// check happens in `validate`.
pub struct IpaNormalizer;

impl Cleaner for IpaNormalizer {
    fn name(&self) -> &'static str {
        "ipa-normalizer"
    }

    fn version(&self) -> u32 {
        1
    }

    fn apply(&self, mut draft: EntryDraft) -> EntryDraft {
        if let Some(ipa) = draft.ipa.take() {
            let cleaned: String = ipa
                .nfc()
                .filter(|c| !matches!(c, '/' | '[' | ']') && !c.is_whitespace())
                .collect();
            draft.ipa = Some(cleaned).filter(|s| !s.is_empty());
        }
        draft
    }

    fn validate(&self, draft: &EntryDraft) -> bool {
        match &draft.ipa {
            Some(ipa) => is_valid_ipa(ipa),
            None => true,
        }
    }
}

// ============================================================================
// language-canonicalizer
// ============================================================================

/// ISO-639 3→2 mapping with an alias table for language names that show up
/// where a code should be.
pub struct LanguageCanonicalizer;

/// ISO-639-3 → ISO-639-1 for the languages that have a two-letter code.
static ISO_3_TO_2: Lazy<std::collections::HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("eng", "en"),
        ("deu", "de"),
        ("ger", "de"),
        ("fra", "fr"),
        ("fre", "fr"),
        ("spa", "es"),
        ("ita", "it"),
        ("por", "pt"),
        ("nld", "nl"),
        ("dut", "nl"),
        ("rus", "ru"),
        ("pol", "pl"),
        ("ces", "cs"),
        ("cze", "cs"),
        ("ell", "el"),
        ("gre", "el"),
        ("lat", "la"),
        ("san", "sa"),
        ("hin", "hi"),
        ("ben", "bn"),
        ("fas", "fa"),
        ("per", "fa"),
        ("ara", "ar"),
        ("heb", "he"),
        ("tur", "tr"),
        ("jpn", "ja"),
        ("kor", "ko"),
        ("zho", "zh"),
        ("chi", "zh"),
        ("swe", "sv"),
        ("nor", "no"),
        ("dan", "da"),
        ("isl", "is"),
        ("fin", "fi"),
        ("hun", "hu"),
        ("est", "et"),
        ("lav", "lv"),
        ("lit", "lt"),
        ("ukr", "uk"),
        ("bul", "bg"),
        ("ron", "ro"),
        ("rum", "ro"),
        ("srp", "sr"),
        ("hrv", "hr"),
        ("slk", "sk"),
        ("slv", "sl"),
        ("gle", "ga"),
        ("cym", "cy"),
        ("wel", "cy"),
        ("eus", "eu"),
        ("kat", "ka"),
        ("hye", "hy"),
        ("tam", "ta"),
        ("tel", "te"),
        ("tha", "th"),
        ("vie", "vi"),
        ("ind", "id"),
        ("msa", "ms"),
        ("swa", "sw"),
    ]
    .into_iter()
    .collect()
});

/// Full language names (and a few legacy labels) → ISO-639-1.
static LANGUAGE_ALIASES: Lazy<std::collections::HashMap<&'static str, &'static str>> =
    Lazy::new(|| {
        [
            ("english", "en"),
            ("german", "de"),
            ("french", "fr"),
            ("spanish", "es"),
            ("italian", "it"),
            ("portuguese", "pt"),
            ("dutch", "nl"),
            ("russian", "ru"),
            ("greek", "el"),
            ("latin", "la"),
            ("sanskrit", "sa"),
            ("hindi", "hi"),
            ("arabic", "ar"),
            ("hebrew", "he"),
            ("turkish", "tr"),
            ("japanese", "ja"),
            ("korean", "ko"),
            ("chinese", "zh"),
            ("mandarin", "zh"),
            ("swedish", "sv"),
            ("norwegian", "no"),
            ("danish", "da"),
            ("icelandic", "is"),
            ("finnish", "fi"),
            ("hungarian", "hu"),
            ("polish", "pl"),
            ("czech", "cs"),
            ("ukrainian", "uk"),
            ("welsh", "cy"),
            ("irish", "ga"),
            ("basque", "eu"),
            ("georgian", "ka"),
            ("armenian", "hy"),
            ("tamil", "ta"),
            ("thai", "th"),
            ("vietnamese", "vi"),
        ]
        .into_iter()
        .collect()
    });

impl Cleaner for LanguageCanonicalizer {
    fn name(&self) -> &'static str {
        "language-canonicalizer"
    }

    fn version(&self) -> u32 {
        1
    }

    fn apply(&self, mut draft: EntryDraft) -> EntryDraft {
        let lowered = draft.language_code.trim().to_lowercase();
        draft.language_code = if let Some(&two) = ISO_3_TO_2.get(lowered.as_str()) {
            two.to_string()
        } else if let Some(&two) = LANGUAGE_ALIASES.get(lowered.as_str()) {
            two.to_string()
        } else {
            lowered
        };
        draft
    }

    fn validate(&self, draft: &EntryDraft) -> bool {
        is_iso639_shaped(&draft.language_code)
    }
}

// ============================================================================
// definition-cleaner
// ============================================================================

/// Strips HTML and wiki markup from definitions and collapses whitespace.
pub struct DefinitionCleaner;

impl Cleaner for DefinitionCleaner {
    fn name(&self) -> &'static str {
        "definition-cleaner"
    }

    fn version(&self) -> u32 {
        1
    }

    fn apply(&self, mut draft: EntryDraft) -> EntryDraft {
        let stripped = HTML_TAG.replace_all(&draft.definition, "");
        let stripped = TEMPLATE_MARKUP.replace_all(&stripped, "");
        let stripped = WIKI_LINK.replace_all(&stripped, "$1");
        draft.definition = collapse_whitespace(&stripped);
        draft
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_with(headword: &str) -> EntryDraft {
        EntryDraft {
            headword: headword.to_string(),
            language_code: "en".to_string(),
            definition: "x".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_headword_stripper() {
        let out = HeadwordStripper.apply(draft_with("*bʰréh₂tēr"));
        assert_eq!(out.headword, "bʰréh₂tēr");
        let out = HeadwordStripper.apply(draft_with("fa[d]er (archaic)"));
        assert_eq!(out.headword, "fader archaic");
    }

    #[test]
    fn test_text_normalizer_folds_and_collapses() {
        let mut d = draft_with("  FaDēr  ");
        d.definition = "Male\t\tParent ".to_string();
        let out = TextNormalizer::default().apply(d);
        assert_eq!(out.headword, "fadēr");
        assert_eq!(out.definition, "male parent");
    }

    #[test]
    fn test_text_normalizer_nfc() {
        // decomposed e + combining acute
        let d = draft_with("cafe\u{0301}");
        let out = TextNormalizer { casefold: false }.apply(d);
        assert_eq!(out.headword, "caf\u{00e9}");
    }

    #[test]
    fn test_ipa_normalizer_strips_delimiters() {
        let mut d = draft_with("father");
        d.ipa = Some("/ˈfɑː.ðər/".to_string());
        let out = IpaNormalizer.apply(d);
        assert_eq!(out.ipa.as_deref(), Some("ˈfɑː.ðər"));
        assert!(IpaNormalizer.validate(&out));
    }

    #[test]
    fn test_ipa_normalizer_rejects_junk() {
        let mut d = draft_with("father");
        d.ipa = Some("f%th3r!".to_string());
        let out = IpaNormalizer.apply(d);
        assert!(!IpaNormalizer.validate(&out));
    }

    #[test]
    fn test_language_canonicalizer() {
        let mut d = draft_with("x");
        d.language_code = "ENG".to_string();
        assert_eq!(LanguageCanonicalizer.apply(d).language_code, "en");

        let mut d = draft_with("x");
        d.language_code = "German".to_string();
        assert_eq!(LanguageCanonicalizer.apply(d).language_code, "de");

        // Codes without a 2-letter equivalent stay 3-letter
        let mut d = draft_with("x");
        d.language_code = "grc".to_string();
        let out = LanguageCanonicalizer.apply(d);
        assert_eq!(out.language_code, "grc");
        assert!(LanguageCanonicalizer.validate(&out));
    }

    #[test]
    fn test_definition_cleaner_strips_markup() {
        let mut d = draft_with("x");
        d.definition = "a <b>male</b> {{qualifier|dated}} [[parent|Parent]]".to_string();
        let out = DefinitionCleaner.apply(d);
        assert_eq!(out.definition, "a male Parent");
    }
}
