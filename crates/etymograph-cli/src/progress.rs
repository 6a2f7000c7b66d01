//! Progress feedback utilities for CLI commands
//!
//! Spinners and progress bars for long-running pipeline runs, driven by
//! the pipeline's progress snapshots. All output is suppressed under
//! --quiet.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use etymograph_pipeline::ProgressSnapshot;

/// Create a spinner with a message
pub fn spinner(message: &str, quiet: bool) -> Option<ProgressBar> {
    if quiet {
        return None;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.cyan} {msg}")
            .expect("Invalid spinner template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

/// Update a spinner from a pipeline snapshot
pub fn update_from_snapshot(pb: &Option<ProgressBar>, snapshot: &ProgressSnapshot) {
    if let Some(pb) = pb {
        let rate = snapshot
            .stages
            .first()
            .map(|s| s.rate)
            .unwrap_or(0.0);
        let mut message = format!(
            "{}: {} processed, {} failed ({:.0}/s)",
            snapshot.pipeline,
            snapshot.input_processed(),
            snapshot.total_failed(),
            rate
        );
        if let Some(eta) = snapshot.eta_secs {
            message.push_str(&format!(", ~{:.0}s left", eta));
        }
        pb.set_message(message);
    }
}

/// Finish a spinner with a success message
pub fn finish_spinner(pb: Option<ProgressBar>, message: &str) {
    if let Some(pb) = pb {
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:.green} {msg}")
                .expect("Invalid finish template"),
        );
        pb.set_prefix("✓");
        pb.finish_with_message(message.to_string());
    }
}

/// Finish a spinner with a warning message
pub fn finish_spinner_warn(pb: Option<ProgressBar>, message: &str) {
    if let Some(pb) = pb {
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:.yellow} {msg}")
                .expect("Invalid warn template"),
        );
        pb.set_prefix("!");
        pb.finish_with_message(message.to_string());
    }
}
