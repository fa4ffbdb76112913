//! Exclusion, classification and dimension analysis.
//!
//! Runs over every `Pending` record in two passes:
//!
//! 1. **Exclusion**: assets matching an exclusion rule are deleted from the
//!    output tree and their records dropped, before any I/O is spent on them.
//! 2. **Analysis**: every remaining asset gets a `(width, height, confidence)`
//!    triple from the first tier that succeeds:
//!
//! | Tier | Source | Confidence |
//! |---|---|---|
//! | 1 | DDS header or `image` header | `header` |
//! | 2 | identify tool | `tool` |
//! | 3 | file-size bucket | `estimate` |
//!
//! An asset is never left without dimensions. The pass runs on a bounded
//! [`StagePool`]; if it fails systemically (a worker panics, or most identify
//! calls error) the whole pass is repeated single-threaded. Failing again is
//! fatal.

use crate::classify::Classifier;
use crate::codec::calculations::estimate_edge_from_size;
use crate::codec::{Identifier, dds};
use crate::config::{ProcessingConfig, effective_threads};
use crate::fs_utils::{FsError, safe_join};
use crate::output::stage_progress;
use crate::plan::PlanDecision;
use crate::pool::{CancelToken, PoolError, StagePool};
use crate::store::{AnalysisUpdate, AssetStatus, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tier-2 attempts needed before the failure ratio is trusted.
const MIN_TOOL_ATTEMPTS: usize = 8;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("analysis failed in single-threaded safe mode: {0}")]
    SafeModeFailed(String),
}

/// Which tier produced an asset's dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisConfidence {
    Header,
    Tool,
    /// Guessed from file size; planning on it is best effort.
    Estimate,
}

impl fmt::Display for AnalysisConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnalysisConfidence::Header => "header",
            AnalysisConfidence::Tool => "tool",
            AnalysisConfidence::Estimate => "estimate",
        })
    }
}

/// How the identify tool fared on one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAttempt {
    NotNeeded,
    Succeeded,
    /// The tool ran but could not read this file.
    Rejected,
    /// The tool itself could not run (spawn error, timeout).
    Unavailable,
}

/// Dimensions of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
    pub confidence: AnalysisConfidence,
    pub tool: ToolAttempt,
}

fn is_dds(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dds"))
}

fn read_dimensions(path: &Path) -> Option<(u32, u32, Option<String>)> {
    if is_dds(path) {
        match dds::read_header(path) {
            Ok(info) => Some((info.width, info.height, info.format)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "DDS header unreadable");
                None
            }
        }
    } else {
        image::image_dimensions(path)
            .ok()
            .filter(|(w, h)| *w > 0 && *h > 0)
            .map(|(w, h)| (w, h, None))
    }
}

/// Measure one file through the three tiers.
pub fn measure(path: &Path, identifier: Option<&dyn Identifier>) -> Measurement {
    if let Some((width, height, format)) = read_dimensions(path) {
        return Measurement {
            width,
            height,
            format,
            confidence: AnalysisConfidence::Header,
            tool: ToolAttempt::NotNeeded,
        };
    }

    let mut tool = ToolAttempt::NotNeeded;
    if let Some(identifier) = identifier {
        match identifier.identify(path) {
            Ok(found) if found.width > 0 && found.height > 0 => {
                return Measurement {
                    width: found.width,
                    height: found.height,
                    format: found.format,
                    confidence: AnalysisConfidence::Tool,
                    tool: ToolAttempt::Succeeded,
                };
            }
            Ok(found) => {
                debug!(path = %path.display(), ?found, "identify reported a zero dimension");
                tool = ToolAttempt::Rejected;
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, tool = identifier.name(), "identify failed");
                tool = if e.is_systemic() {
                    ToolAttempt::Unavailable
                } else {
                    ToolAttempt::Rejected
                };
            }
        }
    }

    let bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let edge = estimate_edge_from_size(bytes);
    warn!(
        path = %path.display(),
        bytes,
        edge,
        "dimensions estimated from file size"
    );
    Measurement {
        width: edge,
        height: edge,
        format: None,
        confidence: AnalysisConfidence::Estimate,
        tool,
    }
}

/// Result of one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyzeSummary {
    pub excluded: usize,
    pub analyzed: usize,
    pub by_header: usize,
    pub by_tool: usize,
    pub estimated: usize,
    /// Left `Pending` because the run was cancelled.
    pub unfinished: usize,
    pub safe_mode: bool,
}

enum PassOutcome {
    Done(Vec<Option<Measurement>>),
    Systemic(String),
}

fn run_pass(
    pool: &StagePool,
    items: &[(String, PathBuf)],
    identifier: Option<&dyn Identifier>,
    failure_ratio: f64,
    cancel: &CancelToken,
) -> Result<PassOutcome, AnalyzeError> {
    let progress = stage_progress(pool.stage(), items.len());
    let result = pool.map(items, cancel, &progress, |(_, path)| measure(path, identifier));
    progress.finish_and_clear();

    let results = match result {
        Ok(results) => results,
        Err(PoolError::WorkerPanicked { message, .. }) => {
            return Ok(PassOutcome::Systemic(format!("worker panicked: {message}")));
        }
        Err(e) => return Err(e.into()),
    };

    let attempted = results
        .iter()
        .flatten()
        .filter(|m| m.tool != ToolAttempt::NotNeeded)
        .count();
    // Only a tool that cannot run counts against the pass
    let failed = results
        .iter()
        .flatten()
        .filter(|m| m.tool == ToolAttempt::Unavailable)
        .count();
    if attempted >= MIN_TOOL_ATTEMPTS && failed as f64 / attempted as f64 > failure_ratio {
        return Ok(PassOutcome::Systemic(format!(
            "identify could not run for {failed} of {attempted} calls"
        )));
    }
    Ok(PassOutcome::Done(results))
}

/// Delete excluded assets and drop their records. Returns how many went.
fn apply_exclusions(
    store: &StateStore,
    output_dir: &Path,
    classifier: &Classifier,
) -> Result<usize, AnalyzeError> {
    let mut skips = Vec::new();
    for record in store.by_status(AssetStatus::Pending) {
        let Some(rule) = classifier.exclusion(&record.rel_path) else {
            continue;
        };
        let path = safe_join(output_dir, &record.rel_path)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(asset = %record.rel_path, %rule, "excluded");
        skips.push((
            record.rel_path,
            PlanDecision::Skip {
                reason: rule.to_string(),
            },
        ));
    }
    if skips.is_empty() {
        return Ok(0);
    }

    let keys: Vec<String> = skips.iter().map(|(k, _)| k.clone()).collect();
    store.record_plans(skips)?;
    store.remove(&keys)?;
    store.update_notes(|n| n.excluded += keys.len())?;
    info!(count = keys.len(), "excluded assets removed");
    Ok(keys.len())
}

/// Exclude, classify and measure every `Pending` record.
pub fn analyze_stage(
    store: &StateStore,
    output_dir: &Path,
    classifier: &Classifier,
    identifier: Option<&dyn Identifier>,
    processing: &ProcessingConfig,
    cancel: &CancelToken,
) -> Result<AnalyzeSummary, AnalyzeError> {
    let mut summary = AnalyzeSummary {
        excluded: apply_exclusions(store, output_dir, classifier)?,
        ..AnalyzeSummary::default()
    };

    let items = store
        .by_status(AssetStatus::Pending)
        .into_iter()
        .map(|r| {
            let path = safe_join(output_dir, &r.rel_path)?;
            Ok((r.rel_path, path))
        })
        .collect::<Result<Vec<_>, FsError>>()?;
    if items.is_empty() {
        return Ok(summary);
    }

    let pool = StagePool::new("analyze", effective_threads(processing))?;
    info!(assets = items.len(), threads = pool.threads(), "analyzing");
    let measurements = match run_pass(
        &pool,
        &items,
        identifier,
        processing.tool_failure_ratio,
        cancel,
    )? {
        PassOutcome::Done(results) => results,
        PassOutcome::Systemic(reason) => {
            warn!(%reason, "parallel analysis failed, retrying in safe mode");
            summary.safe_mode = true;
            let safe = StagePool::new("analyze-safe", 1)?;
            match run_pass(
                &safe,
                &items,
                identifier,
                processing.tool_failure_ratio,
                cancel,
            )? {
                PassOutcome::Done(results) => results,
                PassOutcome::Systemic(reason) => return Err(AnalyzeError::SafeModeFailed(reason)),
            }
        }
    };

    let mut updates = Vec::with_capacity(items.len());
    for ((key, _), measured) in items.into_iter().zip(measurements) {
        let Some(m) = measured else {
            summary.unfinished += 1;
            continue;
        };
        match m.confidence {
            AnalysisConfidence::Header => summary.by_header += 1,
            AnalysisConfidence::Tool => summary.by_tool += 1,
            AnalysisConfidence::Estimate => summary.estimated += 1,
        }
        let class = classifier.classify(&key);
        updates.push(AnalysisUpdate {
            key,
            semantic: class.semantic,
            category: class.category,
            width: m.width,
            height: m.height,
            confidence: m.confidence,
            format: m.format,
        });
    }
    summary.analyzed = updates.len();
    store.record_analysis(updates)?;
    store.update_notes(|n| {
        n.estimated += summary.estimated;
        n.safe_mode_used |= summary.safe_mode;
    })?;

    info!(
        analyzed = summary.analyzed,
        header = summary.by_header,
        tool = summary.by_tool,
        estimated = summary.estimated,
        unfinished = summary.unfinished,
        "analysis complete"
    );
    Ok(summary)
}
