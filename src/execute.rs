//! Concurrent transformation executor.
//!
//! Every `PlannedResize` record becomes a [`TransformationJob`] on a bounded
//! [`StagePool`]. A job works only inside its own scratch directory:
//!
//! ```text
//! <work_dir>/texsquash-job-XXXX/<file>.dds   ← codec output
//!            │ exists, non-empty, header parses
//!            ▼
//! <output_dir>/textures/…/<file>.dds        ← replaced by rename
//! ```
//!
//! The primary codec runs first; on any error or unusable output the fallback
//! codec gets the same job. If both fail the record becomes `Failed` and the
//! original file is left exactly as it was.
//!
//! Outcomes are folded into the store in one batch after the pool drains.
//! Jobs skipped by cancellation are not recorded and stay `PlannedResize`, so
//! rerunning the stage resumes them.

use crate::codec::{Codec, TargetFormat, Toolset, TransformParams, dds};
use crate::config::{ProcessingConfig, effective_threads};
use crate::fs_utils::{FsError, move_into_place, safe_join};
use crate::output::stage_progress;
use crate::pool::{CancelToken, PoolError, StagePool};
use crate::store::{AssetRecord, AssetStatus, StateStore, StoreError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("no codec available for {0} planned transformations")]
    NoCodec(usize),
}

/// Result of one job, folded back into the asset's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Transformed {
        width: u32,
        height: u32,
        format: TargetFormat,
        codec: String,
    },
    Failed {
        reason: String,
    },
}

impl JobOutcome {
    pub fn status(&self) -> AssetStatus {
        match self {
            JobOutcome::Transformed { .. } => AssetStatus::Transformed,
            JobOutcome::Failed { .. } => AssetStatus::Failed,
        }
    }
}

/// One planned resize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationJob {
    pub key: String,
    pub source: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: TargetFormat,
}

impl TransformationJob {
    fn from_record(record: &AssetRecord, output_dir: &Path) -> Result<Option<Self>, FsError> {
        let (Some(width), Some(height), Some(format)) = (
            record.target_width,
            record.target_height,
            record.target_format,
        ) else {
            return Ok(None);
        };
        Ok(Some(Self {
            key: record.rel_path.clone(),
            source: safe_join(output_dir, &record.rel_path)?,
            width,
            height,
            format,
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteSummary {
    pub transformed: usize,
    pub failed: usize,
    /// Transformed by the fallback codec after the primary failed.
    pub fallback_used: usize,
    /// Left `PlannedResize` by cancellation.
    pub unfinished: usize,
}

/// Run one codec and check what it left behind. Returns the output dimensions.
fn attempt(codec: &dyn Codec, params: &TransformParams) -> Result<(u32, u32), String> {
    codec.transform(params).map_err(|e| e.to_string())?;
    let len = std::fs::metadata(&params.output)
        .map(|m| m.len())
        .map_err(|_| format!("{} left no output", codec.name()))?;
    if len == 0 {
        return Err(format!("{} wrote an empty file", codec.name()));
    }
    let is_dds = params
        .output
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("dds"));
    if is_dds {
        let info = dds::read_header(&params.output)
            .map_err(|e| format!("{} wrote an unreadable DDS: {e}", codec.name()))?;
        return Ok((info.width, info.height));
    }
    Ok((params.width, params.height))
}

/// Run a job through the codec chain. Never touches the original unless a
/// codec succeeded.
pub fn run_job(job: &TransformationJob, codecs: &[&dyn Codec], work_dir: &Path) -> JobOutcome {
    let scratch = match tempfile::Builder::new()
        .prefix("texsquash-job-")
        .tempdir_in(work_dir)
    {
        Ok(dir) => dir,
        Err(e) => {
            return JobOutcome::Failed {
                reason: format!("could not create scratch directory: {e}"),
            };
        }
    };
    let file_name = job
        .source
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("output.dds"));
    let params = TransformParams {
        source: job.source.clone(),
        output: scratch.path().join(file_name),
        width: job.width,
        height: job.height,
        format: job.format,
    };

    let mut errors = Vec::new();
    for codec in codecs {
        match attempt(*codec, &params) {
            Ok((width, height)) => {
                if let Err(e) = move_into_place(&params.output, &job.source) {
                    return JobOutcome::Failed {
                        reason: format!("could not replace original: {e}"),
                    };
                }
                debug!(asset = %job.key, codec = codec.name(), width, height, "transformed");
                return JobOutcome::Transformed {
                    width,
                    height,
                    format: job.format,
                    codec: codec.name().to_string(),
                };
            }
            Err(error) => {
                warn!(asset = %job.key, codec = codec.name(), %error, "codec failed");
                let _ = std::fs::remove_file(&params.output);
                errors.push(error);
            }
        }
    }
    JobOutcome::Failed {
        reason: errors.join("; "),
    }
}

/// Transform every `PlannedResize` record.
pub fn execute_stage(
    store: &StateStore,
    output_dir: &Path,
    toolset: &Toolset,
    processing: &ProcessingConfig,
    work_dir: &Path,
    cancel: &CancelToken,
) -> Result<ExecuteSummary, ExecuteError> {
    let mut outcomes = Vec::new();
    let mut jobs = Vec::new();
    for record in store.by_status(AssetStatus::PlannedResize) {
        match TransformationJob::from_record(&record, output_dir)? {
            Some(job) => jobs.push(job),
            None => outcomes.push((
                record.rel_path,
                JobOutcome::Failed {
                    reason: "plan has no target dimensions".into(),
                },
            )),
        }
    }
    let mut summary = ExecuteSummary {
        failed: outcomes.len(),
        ..ExecuteSummary::default()
    };
    if jobs.is_empty() {
        store.record_outcomes(outcomes)?;
        return Ok(summary);
    }

    let codecs: Vec<&dyn Codec> = [toolset.primary_codec(), toolset.fallback_codec()]
        .into_iter()
        .flatten()
        .collect();
    let Some(primary) = codecs.first() else {
        return Err(ExecuteError::NoCodec(jobs.len()));
    };
    let primary_name = primary.name().to_string();
    std::fs::create_dir_all(work_dir)?;

    let pool = StagePool::new("transform", effective_threads(processing))?;
    info!(
        jobs = jobs.len(),
        threads = pool.threads(),
        codecs = ?codecs.iter().map(|c| c.name()).collect::<Vec<_>>(),
        "transforming"
    );
    let progress = stage_progress(pool.stage(), jobs.len());
    let results = pool.map(&jobs, cancel, &progress, |job| run_job(job, &codecs, work_dir));
    progress.finish_and_clear();
    let results = results?;

    for (job, result) in jobs.into_iter().zip(results) {
        let Some(outcome) = result else {
            summary.unfinished += 1;
            continue;
        };
        match &outcome {
            JobOutcome::Transformed { codec, .. } => {
                summary.transformed += 1;
                if *codec != primary_name {
                    summary.fallback_used += 1;
                }
            }
            JobOutcome::Failed { reason } => {
                warn!(asset = %job.key, %reason, "transformation failed, original kept");
                summary.failed += 1;
            }
        }
        outcomes.push((job.key, outcome));
    }
    store.record_outcomes(outcomes)?;

    info!(
        transformed = summary.transformed,
        failed = summary.failed,
        fallback = summary.fallback_used,
        unfinished = summary.unfinished,
        "transformation complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::AnalysisConfidence;
    use crate::classify::{Category, SemanticType};
    use crate::codec::backend::tests::{MockBehavior, MockCodec};
    use crate::codec::dds::synth_header;
    use crate::plan::PlanDecision;
    use crate::store::AnalysisUpdate;
    use tempfile::TempDir;

    const ORIGINAL: &[u8] = b"original texture bytes";

    /// Output tree with `count` planned 4096→2048 diffuse resizes.
    fn planned(count: usize) -> (TempDir, StateStore, Vec<String>) {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let keys: Vec<String> = (0..count).map(|i| format!("textures/t{i}_d.dds")).collect();
        for key in &keys {
            let path = out.join(key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, ORIGINAL).unwrap();
        }
        let store = StateStore::create(&out).unwrap();
        store
            .insert_pending(keys.iter().map(|k| (k.clone(), "Mod".to_string())))
            .unwrap();
        store
            .record_analysis(
                keys.iter()
                    .map(|k| AnalysisUpdate {
                        key: k.clone(),
                        semantic: SemanticType::Diffuse,
                        category: Category::Misc,
                        width: 4096,
                        height: 4096,
                        confidence: AnalysisConfidence::Header,
                        format: None,
                    })
                    .collect(),
            )
            .unwrap();
        store
            .record_plans(
                keys.iter()
                    .map(|k| {
                        (
                            k.clone(),
                            PlanDecision::Resize {
                                target_size: 2048,
                                width: 2048,
                                height: 2048,
                                format: TargetFormat::Bc7Unorm,
                            },
                        )
                    })
                    .collect(),
            )
            .unwrap();
        (tmp, store, keys)
    }

    fn toolset(primary: MockCodec, fallback: MockCodec) -> Toolset {
        Toolset {
            extractors: Vec::new(),
            identifier: None,
            codecs: vec![Box::new(primary), Box::new(fallback)],
        }
    }

    fn run(store: &StateStore, tmp: &TempDir, tools: &Toolset) -> ExecuteSummary {
        execute_stage(
            store,
            &tmp.path().join("out"),
            tools,
            &ProcessingConfig {
                threads: Some(2),
                ..ProcessingConfig::default()
            },
            &tmp.path().join("work"),
            &CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn primary_codec_transforms_in_place() {
        let (tmp, store, keys) = planned(3);
        let tools = toolset(
            MockCodec::new("texconv", MockBehavior::Succeed),
            MockCodec::new("magick", MockBehavior::Succeed),
        );
        let summary = run(&store, &tmp, &tools);
        assert_eq!(summary.transformed, 3);
        assert_eq!(summary.fallback_used, 0);

        for key in &keys {
            let record = store.get(key).unwrap();
            assert_eq!(record.status, AssetStatus::Transformed);
            assert_eq!(record.dimensions(), Some((2048, 2048)));
            assert_eq!(record.codec.as_deref(), Some("texconv"));
            let info = dds::read_header(&tmp.path().join("out").join(key)).unwrap();
            assert_eq!((info.width, info.height), (2048, 2048));
        }
    }

    #[test]
    fn fallback_runs_when_primary_fails() {
        let (tmp, store, keys) = planned(2);
        let tools = toolset(
            MockCodec::new("texconv", MockBehavior::Fail),
            MockCodec::new("magick", MockBehavior::Succeed),
        );
        let summary = run(&store, &tmp, &tools);
        assert_eq!(summary.transformed, 2);
        assert_eq!(summary.fallback_used, 2);
        assert_eq!(store.get(&keys[0]).unwrap().codec.as_deref(), Some("magick"));
    }

    #[test]
    fn missing_output_counts_as_failure() {
        let (tmp, store, _) = planned(1);
        let tools = toolset(
            MockCodec::new("texconv", MockBehavior::NoOutput),
            MockCodec::new("magick", MockBehavior::Succeed),
        );
        assert_eq!(run(&store, &tmp, &tools).fallback_used, 1);
    }

    #[test]
    fn both_failing_keeps_original() {
        let (tmp, store, keys) = planned(2);
        let tools = toolset(
            MockCodec::new("texconv", MockBehavior::Fail),
            MockCodec::new("magick", MockBehavior::NoOutput),
        );
        let summary = run(&store, &tmp, &tools);
        assert_eq!(summary.failed, 2);
        for key in &keys {
            let record = store.get(key).unwrap();
            assert_eq!(record.status, AssetStatus::Failed);
            assert!(record.note.unwrap().contains("magick left no output"));
            assert_eq!(
                std::fs::read(tmp.path().join("out").join(key)).unwrap(),
                ORIGINAL
            );
        }
    }

    #[test]
    fn rerun_is_a_no_op() {
        let (tmp, store, _) = planned(2);
        let primary = MockCodec::new("texconv", MockBehavior::Succeed);
        let tools = toolset(primary, MockCodec::new("magick", MockBehavior::Succeed));
        run(&store, &tmp, &tools);
        let second = run(&store, &tmp, &tools);
        assert_eq!(second, ExecuteSummary::default());
    }

    #[test]
    fn cancelled_jobs_stay_planned() {
        let (tmp, store, keys) = planned(2);
        let tools = toolset(
            MockCodec::new("texconv", MockBehavior::Succeed),
            MockCodec::new("magick", MockBehavior::Succeed),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let summary = execute_stage(
            &store,
            &tmp.path().join("out"),
            &tools,
            &ProcessingConfig::default(),
            &tmp.path().join("work"),
            &cancel,
        )
        .unwrap();
        assert_eq!(summary.unfinished, 2);
        assert_eq!(
            store.get(&keys[0]).unwrap().status,
            AssetStatus::PlannedResize
        );
    }

    #[test]
    fn no_codec_is_an_error_only_with_jobs() {
        let (tmp, store, _) = planned(1);
        let empty = Toolset {
            extractors: Vec::new(),
            identifier: None,
            codecs: Vec::new(),
        };
        let err = execute_stage(
            &store,
            &tmp.path().join("out"),
            &empty,
            &ProcessingConfig::default(),
            &tmp.path().join("work"),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecuteError::NoCodec(1)));
    }

    #[test]
    fn run_job_records_codec_arguments() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("wall_n.dds");
        std::fs::write(&source, synth_header(1024, 512, b"ATI2")).unwrap();
        let codec = MockCodec::new("texconv", MockBehavior::Succeed);
        let job = TransformationJob {
            key: "textures/wall_n.dds".into(),
            source: source.clone(),
            width: 512,
            height: 256,
            format: TargetFormat::Bc5Unorm,
        };

        let outcome = run_job(&job, &[&codec], tmp.path());
        assert_eq!(outcome.status(), AssetStatus::Transformed);
        let ops = codec.get_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].source, "wall_n.dds");
        assert_eq!((ops[0].width, ops[0].height), (512, 256));
        assert_eq!(ops[0].format, "BC5_UNORM");
    }
}
