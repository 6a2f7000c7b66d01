//! Entry validation
//!
//! Pure, stateless rule composition over [`EntryDraft`]s. The validator
//! produces a verdict plus the full error list; it never mutates the draft
//! and never short-circuits, so the recorded errors are complete.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::entry::EntryDraft;

/// ISO-639-1 two-letter codes.
static ISO_639_1: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "aa", "ab", "af", "am", "ar", "as", "ay", "az", "ba", "be", "bg", "bn", "bo", "br", "bs",
        "ca", "co", "cs", "cy", "da", "de", "dz", "el", "en", "eo", "es", "et", "eu", "fa", "fi",
        "fj", "fo", "fr", "fy", "ga", "gd", "gl", "gn", "gu", "ha", "he", "hi", "hr", "hu", "hy",
        "id", "is", "it", "ja", "jv", "ka", "kk", "kl", "km", "kn", "ko", "ks", "ku", "ky", "la",
        "lb", "ln", "lo", "lt", "lv", "mg", "mi", "mk", "ml", "mn", "mr", "ms", "mt", "my", "ne",
        "nl", "no", "oc", "om", "or", "pa", "pl", "ps", "pt", "qu", "rm", "rn", "ro", "ru", "rw",
        "sa", "sd", "si", "sk", "sl", "sm", "sn", "so", "sq", "sr", "ss", "st", "su", "sv", "sw",
        "ta", "te", "tg", "th", "ti", "tk", "tl", "tn", "to", "tr", "ts", "tt", "ug", "uk", "ur",
        "uz", "vi", "wo", "xh", "yi", "yo", "zh", "zu",
    ]
    .into_iter()
    .collect()
});

/// Whether a string is a plausible IPA transcription.
pub fn is_valid_ipa(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_ipa_char)
}

fn is_ipa_char(c: char) -> bool {
    c.is_ascii_lowercase()
        || matches!(c, '.' | 'ˈ' | 'ˌ' | '|' | '‖' | '‿')
        || matches!(c, 'æ' | 'ç' | 'ð' | 'ø' | 'ħ' | 'ŋ' | 'œ' | 'θ' | 'β' | 'χ')
        || ('\u{0250}'..='\u{02AF}').contains(&c) // IPA extensions
        || ('\u{02B0}'..='\u{02FF}').contains(&c) // spacing modifiers (ː, ʰ, …)
        || ('\u{0300}'..='\u{036F}').contains(&c) // combining diacritics
        || ('\u{01C0}'..='\u{01C3}').contains(&c) // clicks
        || ('\u{1D00}'..='\u{1DBF}').contains(&c) // phonetic extensions
        // Latin letters with composed diacritics survive NFC; keep them.
        || (('\u{00E0}'..='\u{024F}').contains(&c) && c.is_alphabetic())
}

/// Whether a code has the shape of an ISO-639 code.
///
/// Two-letter codes are checked against the full ISO-639-1 table;
/// three-letter codes get a shape check only, since carrying the complete
/// ISO-639-3 registry (~8000 entries) buys little at the cleaning boundary.
pub fn is_iso639_shaped(code: &str) -> bool {
    match code.len() {
        2 => ISO_639_1.contains(code),
        3 => code.bytes().all(|b| b.is_ascii_lowercase()),
        _ => false,
    }
}

/// Fields a rule can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Headword,
    LanguageCode,
    Definition,
    Ipa,
}

impl Field {
    fn get<'a>(&self, draft: &'a EntryDraft) -> Option<&'a str> {
        match self {
            Field::Headword => Some(&draft.headword),
            Field::LanguageCode => Some(&draft.language_code),
            Field::Definition => Some(&draft.definition),
            Field::Ipa => draft.ipa.as_deref(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Field::Headword => "headword",
            Field::LanguageCode => "language_code",
            Field::Definition => "definition",
            Field::Ipa => "ipa",
        }
    }
}

/// A single validation rule.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Field must be present and non-empty
    RequiredField(Field),
    /// Field must not exceed a length in chars
    MaxLength(Field, usize),
    /// The IPA field, when present, must pass the character whitelist
    IpaCharset,
    /// The language code must be an ISO-639 code
    Iso639Membership,
}

impl Rule {
    /// Check one rule; `None` means pass.
    fn check(&self, draft: &EntryDraft) -> Option<String> {
        match self {
            Rule::RequiredField(field) => match field.get(draft) {
                Some(v) if !v.trim().is_empty() => None,
                _ => Some(format!("required field '{}' is missing", field.name())),
            },
            Rule::MaxLength(field, max) => field.get(draft).and_then(|v| {
                let len = v.chars().count();
                (len > *max).then(|| {
                    format!("field '{}' exceeds max length {} ({})", field.name(), max, len)
                })
            }),
            Rule::IpaCharset => draft.ipa.as_deref().and_then(|ipa| {
                (!is_valid_ipa(ipa)).then(|| format!("ipa contains non-IPA characters: {}", ipa))
            }),
            Rule::Iso639Membership => (!is_iso639_shaped(&draft.language_code))
                .then(|| format!("language code '{}' is not ISO-639", draft.language_code)),
        }
    }
}

/// Outcome of validating a draft.
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    pub ok: bool,
    pub errors: Vec<String>,
}

/// Composes rules; pure and stateless.
#[derive(Debug, Clone)]
pub struct Validator {
    rules: Vec<Rule>,
}

impl Validator {
    /// The standard rule set applied by the ingest pipeline.
    pub fn standard() -> Self {
        Self {
            rules: vec![
                Rule::RequiredField(Field::Headword),
                Rule::RequiredField(Field::LanguageCode),
                Rule::MaxLength(Field::Headword, 128),
                Rule::MaxLength(Field::Definition, 4096),
                Rule::IpaCharset,
                Rule::Iso639Membership,
            ],
        }
    }

    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Run every rule; the verdict carries all failures.
    pub fn check(&self, draft: &EntryDraft) -> Verdict {
        let errors: Vec<String> = self.rules.iter().filter_map(|r| r.check(draft)).collect();
        Verdict {
            ok: errors.is_empty(),
            errors,
        }
    }
}
