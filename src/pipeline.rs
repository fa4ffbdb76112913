//! Stage orchestration.
//!
//! [`Pipeline`] holds the resolved, immutable [`PipelineConfig`] and the
//! cancellation token, and exposes one method per stage. `run` chains them:
//!
//! ```text
//! sources → merge → analyze → plan → transform → quality → finalize
//! ```
//!
//! Every stage after the merge reads and writes the persisted state store, so
//! the single-stage CLI commands can pick up where an earlier invocation
//! stopped. Cancellation is checked between stages.

use crate::analyze::{AnalyzeError, AnalyzeSummary, analyze_stage};
use crate::classify::{ClassifyError, Classifier};
use crate::codec::Toolset;
use crate::codec::external::ToolContext;
use crate::config::{ConfigError, PipelineConfig};
use crate::execute::{ExecuteError, ExecuteSummary, execute_stage};
use crate::finalize::{FinalizeError, QcReport, RunSummary, finalize_stage, quality_check};
use crate::merge::{MergeError, MergeOptions, MergeReport, merge_stage, seed_store};
use crate::plan::{PlanSummary, plan_stage};
use crate::pool::CancelToken;
use crate::sources::{SourceError, SourceUnit, resolve_sources};
use crate::store::{StateStore, StoreError};
use crate::tools::ResolveError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("tools: {0}")]
    Tools(#[from] ResolveError),
    #[error("sources: {0}")]
    Sources(#[from] SourceError),
    #[error("merge: {0}")]
    Merge(#[from] MergeError),
    #[error("classify: {0}")]
    Classify(#[from] ClassifyError),
    #[error("analyze: {0}")]
    Analyze(#[from] AnalyzeError),
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("transform: {0}")]
    Execute(#[from] ExecuteError),
    #[error("finalize: {0}")]
    Finalize(#[from] FinalizeError),
    #[error("cancelled by user")]
    Cancelled,
}

/// Everything a full run reports, stage by stage.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub merge: MergeReport,
    pub analyze: AnalyzeSummary,
    pub plan: PlanSummary,
    pub execute: ExecuteSummary,
    pub qc: QcReport,
    pub summary: RunSummary,
    pub final_dir: PathBuf,
}

/// Subprocess settings derived from the config.
pub fn tool_context(config: &PipelineConfig) -> ToolContext {
    ToolContext {
        work_dir: config.paths.resolve_work_dir(),
        timeout: Duration::from_secs(config.processing.job_timeout_secs),
    }
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &PipelineConfig {
        self.config
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    pub fn sources(&self) -> Result<Vec<SourceUnit>, PipelineError> {
        let paths = &self.config.paths;
        Ok(resolve_sources(
            paths.require_mods_dir()?,
            paths.require_game_dir()?,
            paths.load_order.as_deref(),
        )?)
    }

    /// Resolve sources, merge them and seed a fresh store.
    pub fn merge(&self, toolset: &Toolset) -> Result<(MergeReport, StateStore), PipelineError> {
        let units = self.sources()?;
        let output_dir = self.config.paths.require_output_dir()?;
        let work_dir = self.config.paths.resolve_work_dir();
        let options = MergeOptions {
            output_dir,
            work_dir: &work_dir,
            assets: &self.config.assets,
            processing: &self.config.processing,
        };
        let report = merge_stage(&units, toolset, &options, &self.cancel)?;
        let store = seed_store(output_dir, &report)?;
        Ok((report, store))
    }

    /// Open the store a previous merge left in the output directory.
    pub fn open_store(&self) -> Result<StateStore, PipelineError> {
        Ok(StateStore::open(self.config.paths.require_output_dir()?)?)
    }

    pub fn analyze(
        &self,
        store: &StateStore,
        toolset: &Toolset,
    ) -> Result<AnalyzeSummary, PipelineError> {
        let classifier = Classifier::new(&self.config.exclusions, &self.config.classify)?;
        Ok(analyze_stage(
            store,
            self.config.paths.require_output_dir()?,
            &classifier,
            toolset.identifier(),
            &self.config.processing,
            &self.cancel,
        )?)
    }

    pub fn plan(&self, store: &StateStore) -> Result<PlanSummary, PipelineError> {
        let budgets = self.config.preset.budgets();
        info!(preset = ?self.config.preset.name, ?budgets, "planning");
        Ok(plan_stage(store, &budgets)?)
    }

    pub fn transform(
        &self,
        store: &StateStore,
        toolset: &Toolset,
    ) -> Result<ExecuteSummary, PipelineError> {
        Ok(execute_stage(
            store,
            self.config.paths.require_output_dir()?,
            toolset,
            &self.config.processing,
            &self.config.paths.resolve_work_dir(),
            &self.cancel,
        )?)
    }

    pub fn quality(&self, store: &StateStore, toolset: &Toolset) -> Result<QcReport, PipelineError> {
        Ok(quality_check(
            store,
            self.config.paths.require_output_dir()?,
            &self.config.assets.root,
            toolset.identifier(),
            &self.config.quality,
        )?)
    }

    /// Package the output. Returns the summary and where it was delivered.
    pub fn finalize(&self, store: StateStore) -> Result<(RunSummary, PathBuf), PipelineError> {
        let final_dir = self.config.paths.resolve_final_dir()?;
        let summary = finalize_stage(store, self.config.paths.require_output_dir()?, &final_dir)?;
        Ok((summary, final_dir))
    }

    /// The whole pipeline, start to finish.
    pub fn run(&self, toolset: &Toolset) -> Result<RunReport, PipelineError> {
        let (merge, store) = self.merge(toolset)?;
        self.check_cancelled()?;
        let analyze = self.analyze(&store, toolset)?;
        self.check_cancelled()?;
        let plan = self.plan(&store)?;
        self.check_cancelled()?;
        let execute = self.transform(&store, toolset)?;
        self.check_cancelled()?;
        let qc = self.quality(&store, toolset)?;
        let (summary, final_dir) = self.finalize(store)?;
        Ok(RunReport {
            merge,
            analyze,
            plan,
            execute,
            qc,
            summary,
            final_dir,
        })
    }
}
