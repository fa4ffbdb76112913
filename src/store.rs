//! Persistent per-asset state.
//!
//! One [`AssetRecord`] per merged relative path, each carrying an
//! [`AssetStatus`] that only moves along the lifecycle:
//!
//! ```text
//! Pending ──▶ Classified ──▶ PlannedKeep
//!    │            │     ├──▶ PlannedResize ──▶ Transformed
//!    │            │     │          │      └──▶ Failed ──▶ (re-plan)
//!    └────────────┴─────┴──▶ PlannedSkip (deleted, record removed)
//! ```
//!
//! Every bulk mutation checks all transitions first and applies none if any is
//! illegal. Writes are serialized by a `parking_lot::RwLock`; readers run
//! concurrently.
//!
//! ## Storage
//!
//! A versioned JSON document at `<output_dir>/.texsquash-state.json`, written
//! to a temporary file in the same directory and renamed over the old one, so
//! a crash never leaves a half-written store. The finalizer deletes it before
//! delivery.

use crate::analyze::AnalysisConfidence;
use crate::classify::{Category, SemanticType};
use crate::codec::TargetFormat;
use crate::execute::JobOutcome;
use crate::merge::ExtractionFailure;
use crate::plan::PlanDecision;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the store file within the output directory.
pub const STORE_FILENAME: &str = ".texsquash-state.json";

/// Version of the store format. Stores written by another version are refused
/// rather than silently reinterpreted.
const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not replace store file: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("state store not found at {0} (run the merge stage first)")]
    NotFound(PathBuf),
    #[error("state store version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("{key}: illegal transition {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: AssetStatus,
        to: AssetStatus,
    },
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Pending,
    Classified,
    PlannedKeep,
    PlannedResize,
    PlannedSkip,
    Transformed,
    Failed,
}

impl AssetStatus {
    pub const ALL: [AssetStatus; 7] = [
        AssetStatus::Pending,
        AssetStatus::Classified,
        AssetStatus::PlannedKeep,
        AssetStatus::PlannedResize,
        AssetStatus::PlannedSkip,
        AssetStatus::Transformed,
        AssetStatus::Failed,
    ];

    /// No further stage touches an asset in this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AssetStatus::PlannedKeep
                | AssetStatus::PlannedSkip
                | AssetStatus::Transformed
                | AssetStatus::Failed
        )
    }

    pub fn can_become(self, next: AssetStatus) -> bool {
        use AssetStatus::*;
        matches!(
            (self, next),
            (Pending, Classified)
                | (Pending | Classified, PlannedSkip)
                | (
                    Classified | PlannedKeep | PlannedResize | Failed,
                    PlannedKeep | PlannedResize
                )
                | (PlannedResize, Transformed | Failed)
        )
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssetStatus::Pending => "pending",
            AssetStatus::Classified => "classified",
            AssetStatus::PlannedKeep => "planned-keep",
            AssetStatus::PlannedResize => "planned-resize",
            AssetStatus::PlannedSkip => "planned-skip",
            AssetStatus::Transformed => "transformed",
            AssetStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One merged asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Lowercase, `/`-separated path below the output directory.
    pub rel_path: String,
    /// Name of the source unit whose copy survived the merge.
    pub source_unit: String,
    pub status: AssetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<SemanticType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<AnalysisConfidence>,
    /// Format reported by the header or identify tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_format: Option<TargetFormat>,
    /// Codec that produced a transformed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    /// Why planning skipped it or both codecs failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AssetRecord {
    pub fn pending(rel_path: String, source_unit: String) -> Self {
        Self {
            rel_path,
            source_unit,
            status: AssetStatus::Pending,
            semantic: None,
            category: None,
            width: None,
            height: None,
            confidence: None,
            source_format: None,
            target_size: None,
            target_width: None,
            target_height: None,
            target_format: None,
            codec: None,
            note: None,
        }
    }

    /// `(width, height)` once analysis has run.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

/// Analysis result for one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisUpdate {
    pub key: String,
    pub semantic: SemanticType,
    pub category: Category,
    pub width: u32,
    pub height: u32,
    pub confidence: AnalysisConfidence,
    pub format: Option<String>,
}

/// Run-level facts that outlive a single CLI invocation and feed the summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunNotes {
    pub units: usize,
    pub merged_files: usize,
    pub overrides: usize,
    pub extraction_failures: Vec<ExtractionFailure>,
    pub excluded: usize,
    pub estimated: usize,
    pub safe_mode_used: bool,
    pub corrupt_removed: usize,
    pub empty_removed: usize,
    pub undersized: Vec<String>,
    pub validation_failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    notes: RunNotes,
    records: BTreeMap<String, AssetRecord>,
}

impl StoreDocument {
    fn empty() -> Self {
        Self {
            version: STORE_VERSION,
            notes: RunNotes::default(),
            records: BTreeMap::new(),
        }
    }
}

/// The asset state store.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    doc: RwLock<StoreDocument>,
}

impl StateStore {
    /// Start a fresh, empty store in `output_dir`, replacing any previous one.
    pub fn create(output_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(output_dir)?;
        let store = Self {
            path: output_dir.join(STORE_FILENAME),
            doc: RwLock::new(StoreDocument::empty()),
        };
        store.save()?;
        Ok(store)
    }

    /// Load the store written by an earlier stage.
    pub fn open(output_dir: &Path) -> Result<Self, StoreError> {
        let path = output_dir.join(STORE_FILENAME);
        if !path.exists() {
            return Err(StoreError::NotFound(path));
        }
        let content = std::fs::read_to_string(&path)?;
        let doc: StoreDocument = serde_json::from_str(&content)?;
        if doc.version != STORE_VERSION {
            return Err(StoreError::Version {
                found: doc.version,
                expected: STORE_VERSION,
            });
        }
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the document atomically. Callers hold at least a read lock's worth
    /// of consistency: the snapshot is serialized under the lock.
    pub fn save(&self) -> Result<(), StoreError> {
        let doc = self.doc.read();
        self.persist(&doc)
    }

    fn persist(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let json = serde_json::to_string_pretty(doc)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }

    /// Apply a mutation under the write lock and persist the result.
    ///
    /// Every `(key, status)` in `changes` is checked against the current
    /// document first; if any is illegal nothing is applied. The mutation runs
    /// on a copy that replaces the live document only once it is on disk.
    fn update<F>(&self, changes: &[(String, AssetStatus)], apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreDocument),
    {
        let mut doc = self.doc.write();
        Self::check_transitions(&doc, changes)?;
        let mut next = doc.clone();
        apply(&mut next);
        self.persist(&next)?;
        *doc = next;
        Ok(())
    }

    fn check_transitions(
        doc: &StoreDocument,
        changes: &[(String, AssetStatus)],
    ) -> Result<(), StoreError> {
        for (key, to) in changes {
            let to = *to;
            let record = doc
                .records
                .get(key)
                .ok_or_else(|| StoreError::UnknownAsset(key.clone()))?;
            if !record.status.can_become(to) {
                return Err(StoreError::InvalidTransition {
                    key: key.clone(),
                    from: record.status,
                    to,
                });
            }
        }
        Ok(())
    }

    /// Insert (or reset) records as `Pending`. Input is `(rel_path, source_unit)`.
    pub fn insert_pending(
        &self,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Result<usize, StoreError> {
        let entries: Vec<(String, String)> = entries.into_iter().collect();
        let count = entries.len();
        self.update(&[], |doc| {
            for (key, unit) in entries {
                doc.records
                    .insert(key.clone(), AssetRecord::pending(key, unit));
            }
        })?;
        Ok(count)
    }

    /// Record classification + dimensions: `Pending → Classified`.
    pub fn record_analysis(&self, updates: Vec<AnalysisUpdate>) -> Result<(), StoreError> {
        let changes: Vec<(String, AssetStatus)> = updates
            .iter()
            .map(|u| (u.key.clone(), AssetStatus::Classified))
            .collect();
        self.update(&changes, |doc| {
            for u in updates {
                if let Some(record) = doc.records.get_mut(&u.key) {
                    record.status = AssetStatus::Classified;
                    record.semantic = Some(u.semantic);
                    record.category = Some(u.category);
                    record.width = Some(u.width);
                    record.height = Some(u.height);
                    record.confidence = Some(u.confidence);
                    record.source_format = u.format;
                }
            }
        })
    }

    /// Record planner decisions.
    pub fn record_plans(&self, plans: Vec<(String, PlanDecision)>) -> Result<(), StoreError> {
        let changes: Vec<(String, AssetStatus)> =
            plans.iter().map(|(k, p)| (k.clone(), p.status())).collect();
        self.update(&changes, |doc| {
            for (key, plan) in plans {
                let Some(record) = doc.records.get_mut(&key) else {
                    continue;
                };
                record.status = plan.status();
                record.note = None;
                match plan {
                    PlanDecision::Resize {
                        target_size,
                        width,
                        height,
                        format,
                    } => {
                        record.target_size = Some(target_size);
                        record.target_width = Some(width);
                        record.target_height = Some(height);
                        record.target_format = Some(format);
                    }
                    PlanDecision::Keep => {
                        record.target_size = None;
                        record.target_width = None;
                        record.target_height = None;
                        record.target_format = None;
                    }
                    PlanDecision::Skip { reason } => record.note = Some(reason),
                }
            }
        })
    }

    /// Fold executor outcomes back in, as one batch.
    pub fn record_outcomes(&self, outcomes: Vec<(String, JobOutcome)>) -> Result<(), StoreError> {
        let changes: Vec<(String, AssetStatus)> =
            outcomes.iter().map(|(k, o)| (k.clone(), o.status())).collect();
        self.update(&changes, |doc| {
            for (key, outcome) in outcomes {
                let Some(record) = doc.records.get_mut(&key) else {
                    continue;
                };
                record.status = outcome.status();
                match outcome {
                    JobOutcome::Transformed {
                        width,
                        height,
                        format,
                        codec,
                    } => {
                        record.width = Some(width);
                        record.height = Some(height);
                        record.source_format = Some(format.dxgi_name().to_string());
                        record.codec = Some(codec);
                        record.note = None;
                    }
                    JobOutcome::Failed { reason } => record.note = Some(reason),
                }
            }
        })
    }

    /// Drop records whose files were physically removed. Returns how many existed.
    pub fn remove(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        self.update(&[], |doc| {
            for key in keys {
                if doc.records.remove(key).is_some() {
                    removed += 1;
                }
            }
        })?;
        Ok(removed)
    }

    /// Mutate the run notes and persist.
    pub fn update_notes(&self, f: impl FnOnce(&mut RunNotes)) -> Result<(), StoreError> {
        self.update(&[], |doc| f(&mut doc.notes))
    }

    pub fn notes(&self) -> RunNotes {
        self.doc.read().notes.clone()
    }

    pub fn get(&self, key: &str) -> Option<AssetRecord> {
        self.doc.read().records.get(key).cloned()
    }

    /// Records in the given status, ordered by path.
    pub fn by_status(&self, status: AssetStatus) -> Vec<AssetRecord> {
        self.doc
            .read()
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub fn status_counts(&self) -> BTreeMap<AssetStatus, usize> {
        let doc = self.doc.read();
        let mut counts: BTreeMap<AssetStatus, usize> =
            AssetStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for record in doc.records.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        counts
    }

    /// Every record, ordered by path.
    pub fn all(&self) -> Vec<AssetRecord> {
        self.doc.read().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.doc.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
