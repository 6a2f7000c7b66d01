//! Cleaner pipeline
//!
//! A [`Cleaner`] is a pure, versioned, deterministic `EntryDraft →
//! EntryDraft` transformation with a post-condition check. A
//! [`CleanerPipeline`] composes cleaners in order, recording one
//! [`TransformStep`] per application; the ordered `(name, version)` list is
//! hashed into the pipeline fingerprint that stamps every entry the
//! pipeline produces.

mod cleaners;

pub use cleaners::{
    DefinitionCleaner, HeadwordStripper, IpaNormalizer, LanguageCanonicalizer, TextNormalizer,
};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::entry::{now_millis, EntryDraft, TransformStep};
use crate::record::hex_encode;

/// A pure, versioned transformation over entry drafts.
///
/// Purity is a hard contract: `apply` must not depend on call order,
/// parallelism, or any global state, and `apply(x)` must equal `apply(x)`
/// for all `x`. The runtime relies on this to reprocess and to parallelize
/// freely.
pub trait Cleaner: Send + Sync {
    /// Stable machine name, part of the pipeline fingerprint.
    fn name(&self) -> &'static str;

    /// Version, bumped whenever behavior changes.
    fn version(&self) -> u32;

    /// Parameters as JSON for the transform log; `null` when parameterless.
    fn parameters(&self) -> Value {
        Value::Null
    }

    /// Transform the draft.
    fn apply(&self, draft: EntryDraft) -> EntryDraft;

    /// Post-condition on the transformed draft.
    fn validate(&self, _draft: &EntryDraft) -> bool {
        true
    }
}

/// Result of running one draft through the pipeline.
#[derive(Debug)]
pub struct CleanOutcome {
    pub draft: EntryDraft,
    /// One step per cleaner that ran, in order
    pub steps: Vec<TransformStep>,
    /// Name of the first cleaner whose validation failed, if any
    pub failed_step: Option<String>,
}

impl CleanOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed_step.is_none()
    }
}

/// Ordered composition of cleaners.
pub struct CleanerPipeline {
    cleaners: Vec<Box<dyn Cleaner>>,
    /// When strict, a failing validation short-circuits the rest
    strict: bool,
    /// Monotone ordering used by the typed store's upsert discipline
    seq: u64,
}

impl CleanerPipeline {
    /// The standard pipeline, in its canonical order.
    pub fn standard(seq: u64) -> Self {
        Self::new(
            vec![
                Box::new(HeadwordStripper),
                Box::new(TextNormalizer::default()),
                Box::new(IpaNormalizer),
                Box::new(LanguageCanonicalizer),
                Box::new(DefinitionCleaner),
            ],
            false,
            seq,
        )
    }

    pub fn new(cleaners: Vec<Box<dyn Cleaner>>, strict: bool, seq: u64) -> Self {
        Self {
            cleaners,
            strict,
            seq,
        }
    }

    /// Short-circuit on the first failing validation.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Identity of this composition: SHA-256 of the ordered
    /// `name:version` list. Order matters; the same cleaners composed
    /// differently are different pipelines.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for cleaner in &self.cleaners {
            hasher.update(cleaner.name().as_bytes());
            hasher.update(b":");
            hasher.update(cleaner.version().to_string().as_bytes());
            hasher.update(b"\n");
        }
        hex_encode(&hasher.finalize())
    }

    /// Run one draft through every cleaner in order.
    pub fn apply(&self, mut draft: EntryDraft) -> CleanOutcome {
        let mut steps = Vec::with_capacity(self.cleaners.len());
        let mut failed_step = None;

        for cleaner in &self.cleaners {
            let started = std::time::Instant::now();
            draft = cleaner.apply(draft);
            let ok = cleaner.validate(&draft);
            steps.push(TransformStep {
                step_name: cleaner.name().to_string(),
                step_version: cleaner.version(),
                parameters: cleaner.parameters(),
                at: now_millis(),
                duration_ms: started.elapsed().as_millis() as u64,
                success: ok,
                error: (!ok).then(|| format!("{} validation failed", cleaner.name())),
            });
            if !ok && failed_step.is_none() {
                failed_step = Some(cleaner.name().to_string());
                if self.strict {
                    break;
                }
            }
        }

        CleanOutcome {
            draft,
            steps,
            failed_step,
        }
    }

    /// Batch form; output order matches input order.
    pub fn apply_many(&self, drafts: Vec<EntryDraft>) -> Vec<CleanOutcome> {
        drafts.into_iter().map(|d| self.apply(d)).collect()
    }
}
