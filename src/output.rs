//! CLI output formatting for all pipeline stages.
//!
//! # Counts first
//!
//! Every stage reports what happened to the asset set as counts, with the
//! individual assets behind a count shown as indented context lines. Paths are
//! the merged, lowercase relative paths, so a line in the output can be looked
//! up directly in the delivered tree or in the stage log.
//!
//! # Output Format
//!
//! ## Sources
//!
//! ```text
//! Sources (3 units, rank 000 wins)
//! 000 Better Rocks
//!     Source: /mods/Better Rocks
//! 001 HD Trees (archive)
//!     Source: /mods/HD Trees.7z
//! 002 <base game>
//!     Source: /games/skyrim/Data
//! ```
//!
//! ## Merge
//!
//! ```text
//! Merged 1842 files from 3 units (211 overrides)
//! Extraction failures
//!     HD Trees: HD Trees - Textures.bsa
//!         bsarch exited with Some(1)
//! ```
//!
//! ## Summary
//!
//! ```text
//! Outcomes
//!     Kept: 1500
//!     Resized: 290
//!     Skipped: 40
//!     Failed: 2
//!     Corrupt removed: 0
//!     Empty removed: 1
//! ```
//!
//! # Architecture
//!
//! Each stage has a `format_*` function (returns `Vec<String>`) for testability
//! and a `print_*` wrapper that writes to stdout. Format functions are pure
//! and do no I/O. [`stage_progress`] is the one exception: it builds
//! the per-stage progress bar shown on stderr.

use crate::analyze::AnalyzeSummary;
use crate::execute::ExecuteSummary;
use crate::finalize::{QcReport, RunSummary};
use crate::merge::MergeReport;
use crate::plan::PlanSummary;
use crate::sources::{SourceUnit, UnitKind};
use crate::store::AssetStatus;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::time::Duration;

/// Longest list of individual assets printed under a count.
const MAX_LISTED: usize = 20;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a rank as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// `Label: value` at depth 1.
fn field(label: &str, value: impl std::fmt::Display) -> String {
    format!("{}{}: {}", indent(1), label, value)
}

/// Indented list of items, truncated with a `… and N more` line.
fn listed(items: impl ExactSizeIterator<Item = String>, depth: usize) -> Vec<String> {
    let total = items.len();
    let mut lines: Vec<String> = items
        .take(MAX_LISTED)
        .map(|item| format!("{}{}", indent(depth), item))
        .collect();
    if total > MAX_LISTED {
        lines.push(format!("{}… and {} more", indent(depth), total - MAX_LISTED));
    }
    lines
}

/// Progress bar for one stage, drawn on stderr. Hidden when stderr is not a
/// terminal or there is nothing to do.
pub fn stage_progress(stage: &str, len: usize) -> ProgressBar {
    if len == 0 || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix:>9} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}",
    ) {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.set_prefix(stage.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

// ============================================================================
// Sources
// ============================================================================

/// Format the resolved units, rank 0 first.
pub fn format_sources(units: &[SourceUnit]) -> Vec<String> {
    let mut lines = vec![format!(
        "Sources ({} units, rank {} wins)",
        units.len(),
        format_index(0)
    )];
    for unit in units {
        let kind = match unit.kind {
            UnitKind::Directory => "",
            UnitKind::Archive => " (archive)",
        };
        lines.push(format!("{} {}{}", format_index(unit.rank), unit.name, kind));
        lines.push(format!("{}Source: {}", indent(1), unit.root.display()));
    }
    lines
}

pub fn print_sources(units: &[SourceUnit]) {
    for line in format_sources(units) {
        println!("{}", line);
    }
}

// ============================================================================
// Merge
// ============================================================================

pub fn format_merge(report: &MergeReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Merged {} files from {} units ({} overrides)",
        report.assets.len(),
        report.units,
        report.overrides
    )];
    lines.push(field("Hard-linked", report.hard_linked));
    lines.push(field("Copied", report.copied));
    if !report.failures.is_empty() {
        lines.push("Extraction failures".to_string());
        for failure in &report.failures {
            lines.push(format!("{}{}: {}", indent(1), failure.unit, failure.archive));
            lines.push(format!("{}{}", indent(2), failure.error));
        }
    }
    lines
}

pub fn print_merge(report: &MergeReport) {
    for line in format_merge(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Analyze / plan / transform
// ============================================================================

pub fn format_analyze(summary: &AnalyzeSummary) -> Vec<String> {
    let mut lines = vec![format!("Analyzed {} assets", summary.analyzed)];
    lines.push(field("Excluded", summary.excluded));
    lines.push(field("From header", summary.by_header));
    lines.push(field("From identify", summary.by_tool));
    lines.push(field("Estimated", summary.estimated));
    if summary.unfinished > 0 {
        lines.push(field("Unfinished", summary.unfinished));
    }
    if summary.safe_mode {
        lines.push(format!("{}Safe mode: used", indent(1)));
    }
    lines
}

pub fn print_analyze(summary: &AnalyzeSummary) {
    for line in format_analyze(summary) {
        println!("{}", line);
    }
}

pub fn format_plan(summary: &PlanSummary) -> Vec<String> {
    let mut lines = vec![format!(
        "Planned {} assets",
        summary.keep + summary.resize
    )];
    lines.push(field("Keep", summary.keep));
    lines.push(field("Resize", summary.resize));
    for (format, count) in &summary.by_format {
        lines.push(format!("{}{}: {}", indent(2), format, count));
    }
    lines
}

pub fn print_plan(summary: &PlanSummary) {
    for line in format_plan(summary) {
        println!("{}", line);
    }
}

pub fn format_execute(summary: &ExecuteSummary) -> Vec<String> {
    let mut lines = vec![format!("Transformed {} assets", summary.transformed)];
    lines.push(field("Failed", summary.failed));
    lines.push(field("Fallback codec", summary.fallback_used));
    if summary.unfinished > 0 {
        lines.push(field("Unfinished", summary.unfinished));
    }
    lines
}

pub fn print_execute(summary: &ExecuteSummary) {
    for line in format_execute(summary) {
        println!("{}", line);
    }
}

// ============================================================================
// Quality control / status / summary
// ============================================================================

pub fn format_qc(report: &QcReport) -> Vec<String> {
    let mut lines = vec!["Quality control".to_string()];
    lines.push(field("Empty removed", report.empty_removed.len()));
    lines.extend(listed(report.empty_removed.iter().cloned(), 2));
    lines.push(field("Corrupt removed", report.corrupt_removed.len()));
    lines.extend(listed(report.corrupt_removed.iter().cloned(), 2));
    if !report.unreadable.is_empty() {
        lines.push(field("Unreadable (kept)", report.unreadable.len()));
        lines.extend(listed(report.unreadable.iter().cloned(), 2));
    }
    lines.push(field("Undersized", report.undersized.len()));
    lines.extend(listed(report.undersized.iter().cloned(), 2));
    lines.push(field(
        "Validated",
        format!(
            "{} sampled, {} failed",
            report.sampled,
            report.validation_failures.len()
        ),
    ));
    lines.extend(listed(report.validation_failures.iter().cloned(), 2));
    lines
}

pub fn print_qc(report: &QcReport) {
    for line in format_qc(report) {
        println!("{}", line);
    }
}

/// Asset counts by lifecycle status.
pub fn format_status(counts: &BTreeMap<AssetStatus, usize>) -> Vec<String> {
    let total: usize = counts.values().sum();
    let mut lines = vec![format!("{} assets", total)];
    for (status, count) in counts {
        lines.push(field(&status.to_string(), count));
    }
    lines
}

pub fn print_status(counts: &BTreeMap<AssetStatus, usize>) {
    for line in format_status(counts) {
        println!("{}", line);
    }
}

/// The run summary, as printed and written to `summary.txt`.
pub fn format_summary(summary: &RunSummary) -> Vec<String> {
    let mut lines = vec![
        "Sources".to_string(),
        field("Units", summary.units),
        field("Merged files", summary.merged_files),
        field("Overrides", summary.overrides),
        "Outcomes".to_string(),
        field("Kept", summary.kept),
        field("Resized", summary.resized),
        field("Skipped", summary.skipped),
        field("Failed", summary.failed),
        field("Corrupt removed", summary.corrupt_removed),
        field("Empty removed", summary.empty_removed),
        "Warnings".to_string(),
        field("Undersized", summary.undersized),
        field("Estimated dimensions", summary.estimated),
        field("Validation failures", summary.validation_failures),
        field(
            "Safe mode",
            if summary.safe_mode_used { "used" } else { "not needed" },
        ),
    ];
    if !summary.extraction_failures.is_empty() {
        lines.push(format!(
            "Extraction failures ({})",
            summary.extraction_failures.len()
        ));
        lines.extend(listed(
            summary
                .extraction_failures
                .iter()
                .map(|f| format!("{}: {} ({})", f.unit, f.archive, f.error)),
            1,
        ));
    }
    if !summary.failed_assets.is_empty() {
        lines.push(format!("Failed assets ({})", summary.failed_assets.len()));
        lines.extend(listed(
            summary
                .failed_assets
                .iter()
                .map(|(path, reason)| format!("{}: {}", path, reason)),
            1,
        ));
    }
    lines
}

pub fn print_summary(summary: &RunSummary) {
    for line in format_summary(summary) {
        println!("{}", line);
    }
}

// ============================================================================
// Tests
// ============================================================================
