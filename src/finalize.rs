//! Quality control and delivery.
//!
//! [`quality_check`] sweeps the output tree after transformation:
//!
//! - zero-byte files are deleted and counted as `empty-removed`;
//! - transformed `.dds` files whose header no longer parses are deleted and
//!   counted as `corrupt-removed`. Originals the executor kept (`PlannedKeep`,
//!   `Failed`) are never deleted; an unparsable one is flagged as unreadable;
//! - files under `quality.min_file_bytes` are flagged only;
//! - a deterministic sample (ordered by SHA-256 of the path) is re-validated
//!   with the identify tool. Failures are logged and counted, never repaired.
//!
//! [`finalize_stage`] then refuses to continue while any record is unfinished,
//! strips empty directories and the state store, renames the output directory
//! to its final name and writes `summary.txt`.

use crate::codec::{Identifier, dds};
use crate::config::QualityConfig;
use crate::fs_utils::{FsError, list_files, remove_empty_dirs};
use crate::merge::ExtractionFailure;
use crate::output::{format_summary, stage_progress};
use crate::store::{AssetStatus, StateStore, StoreError};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Plain-text report written into the delivered directory.
pub const SUMMARY_FILENAME: &str = "summary.txt";

#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("{0} assets have not reached a final state; finish the earlier stages first")]
    NotReady(usize),
    #[error("final directory already exists: {0}")]
    FinalDirExists(PathBuf),
}

/// What quality control found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QcReport {
    pub empty_removed: Vec<String>,
    pub corrupt_removed: Vec<String>,
    /// Kept originals whose header doesn't parse. Left in place.
    pub unreadable: Vec<String>,
    pub undersized: Vec<String>,
    pub sampled: usize,
    pub validation_failures: Vec<String>,
}

/// Counts by outcome, as written to `summary.txt`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub units: usize,
    pub merged_files: usize,
    pub overrides: usize,
    pub kept: usize,
    pub resized: usize,
    pub skipped: usize,
    pub failed: usize,
    pub corrupt_removed: usize,
    pub empty_removed: usize,
    pub undersized: usize,
    pub estimated: usize,
    pub validation_failures: usize,
    pub safe_mode_used: bool,
    pub extraction_failures: Vec<ExtractionFailure>,
    /// Assets whose codec chain failed, with the reason.
    pub failed_assets: Vec<(String, String)>,
}

fn sample_order(key: &str) -> Vec<u8> {
    Sha256::digest(key.as_bytes()).to_vec()
}

/// Choose up to `size` keys, deterministically but spread across the tree.
pub fn choose_sample(keys: &[String], size: usize) -> Vec<String> {
    let mut ordered: Vec<(&String, Vec<u8>)> = keys.iter().map(|k| (k, sample_order(k))).collect();
    ordered.sort_by(|a, b| a.1.cmp(&b.1));
    ordered.into_iter().take(size).map(|(k, _)| k.clone()).collect()
}

fn is_dds(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("dds"))
}

/// Sweep the output tree. Deleted files have their records removed.
pub fn quality_check(
    store: &StateStore,
    output_dir: &Path,
    asset_root: &str,
    identifier: Option<&dyn Identifier>,
    quality: &QualityConfig,
) -> Result<QcReport, FinalizeError> {
    let prefix = format!("{}/", asset_root.to_ascii_lowercase());
    let files: Vec<(String, PathBuf)> = list_files(output_dir)?
        .into_iter()
        .filter(|(key, _)| key.starts_with(&prefix))
        .collect();

    let mut report = QcReport::default();
    let mut survivors = Vec::with_capacity(files.len());
    for (key, path) in files {
        let len = fs::metadata(&path)?.len();
        if len == 0 {
            warn!(asset = %key, "empty file removed");
            fs::remove_file(&path)?;
            report.empty_removed.push(key);
            continue;
        }
        if is_dds(&path)
            && let Err(e) = dds::read_header(&path)
        {
            let transformed = store
                .get(&key)
                .is_some_and(|r| r.status == AssetStatus::Transformed);
            if transformed {
                warn!(asset = %key, error = %e, "corrupt texture removed");
                fs::remove_file(&path)?;
                report.corrupt_removed.push(key);
                continue;
            }
            warn!(asset = %key, error = %e, "original texture header unreadable; kept");
            report.unreadable.push(key.clone());
        }
        if len < quality.min_file_bytes {
            warn!(asset = %key, bytes = len, "suspiciously small file");
            report.undersized.push(key.clone());
        }
        survivors.push((key, path));
    }

    let removed: Vec<String> = report
        .empty_removed
        .iter()
        .chain(&report.corrupt_removed)
        .cloned()
        .collect();
    store.remove(&removed)?;

    match identifier {
        Some(identifier) => {
            let keys: Vec<String> = survivors.iter().map(|(k, _)| k.clone()).collect();
            let sample = choose_sample(&keys, quality.sample_size);
            let progress = stage_progress("validate", sample.len());
            for key in &sample {
                let path = output_dir.join(key);
                if let Err(e) = identifier.identify(&path) {
                    warn!(asset = %key, error = %e, "validation failed");
                    report.validation_failures.push(key.clone());
                }
                progress.inc(1);
            }
            progress.finish_and_clear();
            report.sampled = sample.len();
        }
        None => warn!("no identify tool; skipping sample validation"),
    }

    store.update_notes(|n| {
        n.empty_removed += report.empty_removed.len();
        n.corrupt_removed += report.corrupt_removed.len();
        n.undersized = report.undersized.clone();
        n.validation_failures = report.validation_failures.clone();
    })?;
    info!(
        empty = report.empty_removed.len(),
        corrupt = report.corrupt_removed.len(),
        undersized = report.undersized.len(),
        sampled = report.sampled,
        validation_failures = report.validation_failures.len(),
        "quality control complete"
    );
    Ok(report)
}

/// Collect the outcome counts from the store.
pub fn build_summary(store: &StateStore) -> RunSummary {
    let counts = store.status_counts();
    let count = |status| counts.get(&status).copied().unwrap_or(0);
    let notes = store.notes();
    RunSummary {
        units: notes.units,
        merged_files: notes.merged_files,
        overrides: notes.overrides,
        kept: count(AssetStatus::PlannedKeep),
        resized: count(AssetStatus::Transformed),
        skipped: notes.excluded,
        failed: count(AssetStatus::Failed),
        corrupt_removed: notes.corrupt_removed,
        empty_removed: notes.empty_removed,
        undersized: notes.undersized.len(),
        estimated: notes.estimated,
        validation_failures: notes.validation_failures.len(),
        safe_mode_used: notes.safe_mode_used,
        extraction_failures: notes.extraction_failures,
        failed_assets: store
            .by_status(AssetStatus::Failed)
            .into_iter()
            .map(|r| (r.rel_path, r.note.unwrap_or_default()))
            .collect(),
    }
}

/// Package the output tree as the final deliverable.
///
/// Consumes the store: its file is deleted before the rename.
pub fn finalize_stage(
    store: StateStore,
    output_dir: &Path,
    final_dir: &Path,
) -> Result<RunSummary, FinalizeError> {
    let unfinished: usize = store
        .status_counts()
        .into_iter()
        .filter(|(status, _)| !status.is_terminal())
        .map(|(_, n)| n)
        .sum();
    if unfinished > 0 {
        return Err(FinalizeError::NotReady(unfinished));
    }
    if final_dir.exists() {
        return Err(FinalizeError::FinalDirExists(final_dir.to_path_buf()));
    }

    let summary = build_summary(&store);
    let removed_dirs = remove_empty_dirs(output_dir)?;
    fs::remove_file(store.path())?;
    drop(store);

    if let Some(parent) = final_dir.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(output_dir, final_dir)?;
    let mut text = format_summary(&summary).join("\n");
    text.push('\n');
    fs::write(final_dir.join(SUMMARY_FILENAME), text)?;

    info!(
        final_dir = %final_dir.display(),
        removed_dirs,
        kept = summary.kept,
        resized = summary.resized,
        failed = summary.failed,
        "delivered"
    );
    Ok(summary)
}
