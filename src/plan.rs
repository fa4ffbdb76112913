//! Transformation planning.
//!
//! [`plan_asset`] is a pure function of semantic type, dimensions and the
//! preset budgets. [`plan_stage`] applies it to every record that is ready for a
//! decision and writes all decisions back in one batch.
//!
//! | Semantic type | Budget | Target format |
//! |---|---|---|
//! | diffuse | `diffuse` | `BC7_UNORM` |
//! | material | `material` | `BC7_UNORM` |
//! | normal | `normal` | `BC5_UNORM` |
//! | parallax | `parallax` | `BC4_UNORM` |
//! | skin, other | none (always kept) | |
//!
//! A record is resized only when its longer edge exceeds the budget. Only
//! `.dds` files are ever resized: the codecs write DDS, and a converted
//! `.png` or `.tga` would no longer be found under its original name.

use crate::classify::SemanticType;
use crate::codec::TargetFormat;
use crate::codec::calculations::calculate_resize_dimensions;
use crate::config::Budgets;
use crate::store::{AssetStatus, StateStore, StoreError};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What to do with one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    Keep,
    Resize {
        target_size: u32,
        width: u32,
        height: u32,
        format: TargetFormat,
    },
    /// Delete the asset. Only produced by exclusion, never by the budget rule.
    Skip { reason: String },
}

impl PlanDecision {
    /// Store status this decision moves a record into.
    pub fn status(&self) -> AssetStatus {
        match self {
            PlanDecision::Keep => AssetStatus::PlannedKeep,
            PlanDecision::Resize { .. } => AssetStatus::PlannedResize,
            PlanDecision::Skip { .. } => AssetStatus::PlannedSkip,
        }
    }
}

/// Budget and target format for a semantic type, or `None` for types that are
/// never resized.
pub fn budget_for(semantic: SemanticType, budgets: &Budgets) -> Option<(u32, TargetFormat)> {
    match semantic {
        SemanticType::Diffuse => Some((budgets.diffuse, TargetFormat::Bc7Unorm)),
        SemanticType::Material => Some((budgets.material, TargetFormat::Bc7Unorm)),
        SemanticType::Normal => Some((budgets.normal, TargetFormat::Bc5Unorm)),
        SemanticType::Parallax => Some((budgets.parallax, TargetFormat::Bc4Unorm)),
        SemanticType::Skin | SemanticType::Other => None,
    }
}

/// Decide keep or resize for one asset.
///
/// # Examples
/// ```
/// # use texsquash::classify::SemanticType;
/// # use texsquash::codec::TargetFormat;
/// # use texsquash::config::PresetName;
/// # use texsquash::plan::{plan_asset, PlanDecision};
/// let budgets = PresetName::Quality.budgets();
/// assert_eq!(
///     plan_asset(SemanticType::Diffuse, (4096, 4096), &budgets),
///     PlanDecision::Resize {
///         target_size: 2048,
///         width: 2048,
///         height: 2048,
///         format: TargetFormat::Bc7Unorm,
///     }
/// );
/// assert_eq!(
///     plan_asset(SemanticType::Normal, (800, 600), &budgets),
///     PlanDecision::Keep
/// );
/// ```
pub fn plan_asset(semantic: SemanticType, dims: (u32, u32), budgets: &Budgets) -> PlanDecision {
    let Some((budget, format)) = budget_for(semantic, budgets) else {
        return PlanDecision::Keep;
    };
    if dims.0.max(dims.1) <= budget {
        return PlanDecision::Keep;
    }
    let (width, height) = calculate_resize_dimensions(dims, budget);
    PlanDecision::Resize {
        target_size: budget,
        width,
        height,
        format,
    }
}

/// Tally of one planning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub keep: usize,
    pub resize: usize,
    /// Resizes per target format.
    pub by_format: BTreeMap<String, usize>,
}

/// Plan every record awaiting a decision.
///
/// `Classified` records are planned for the first time. `PlannedKeep`,
/// `PlannedResize` and `Failed` records are re-planned so a changed preset takes
/// effect on a rerun; `Transformed` records are already final and untouched.
pub fn plan_stage(store: &StateStore, budgets: &Budgets) -> Result<PlanSummary, StoreError> {
    let candidates: Vec<_> = [
        AssetStatus::Classified,
        AssetStatus::PlannedKeep,
        AssetStatus::PlannedResize,
        AssetStatus::Failed,
    ]
    .into_iter()
    .flat_map(|status| store.by_status(status))
    .collect();

    let mut summary = PlanSummary::default();
    let mut plans = Vec::with_capacity(candidates.len());
    for record in candidates {
        let (Some(semantic), Some(dims)) = (record.semantic, record.dimensions()) else {
            warn!(asset = %record.rel_path, "classified record without dimensions, keeping");
            plans.push((record.rel_path, PlanDecision::Keep));
            summary.keep += 1;
            continue;
        };
        if !is_dds(&record.rel_path) {
            debug!(asset = %record.rel_path, "not a DDS, keeping");
            plans.push((record.rel_path, PlanDecision::Keep));
            summary.keep += 1;
            continue;
        }
        let decision = plan_asset(semantic, dims, budgets);
        match &decision {
            PlanDecision::Resize {
                width,
                height,
                format,
                ..
            } => {
                debug!(
                    asset = %record.rel_path,
                    from = ?dims,
                    to = ?(width, height),
                    %format,
                    "resize"
                );
                summary.resize += 1;
                *summary.by_format.entry(format.to_string()).or_default() += 1;
            }
            PlanDecision::Keep => summary.keep += 1,
            PlanDecision::Skip { .. } => {}
        }
        plans.push((record.rel_path, decision));
    }

    store.record_plans(plans)?;
    info!(
        keep = summary.keep,
        resize = summary.resize,
        "planning complete"
    );
    Ok(summary)
}

fn is_dds(key: &str) -> bool {
    std::path::Path::new(key)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("dds"))
}
