//! Overlay merge.
//!
//! Builds the unified asset tree from the resolved [`SourceUnit`]s. Units are
//! applied strictly one after another from the lowest priority (highest rank)
//! to rank 0, and every copy replaces whatever is already at its path, so the
//! last writer is the highest-priority unit. No conflict bookkeeping is needed
//! for correctness; the [`MergeReport`] only records who won for the state
//! store and the summary.
//!
//! Within one unit:
//!
//! 1. A packed mod (`.7z`/`.zip`/`.rar`) is first extracted whole into scratch.
//! 2. Embedded Bethesda archives (`.bsa`/`.ba2`) at the unit's top level are
//!    extracted in parallel, each into its own private scratch directory.
//! 3. Their asset subtrees are copied in archive-name order, then the unit's
//!    loose files, so loose files override the mod's own archives.
//!
//! A failed extraction is logged and collected as an [`ExtractionFailure`];
//! the unit simply contributes nothing from that archive.

use crate::codec::Toolset;
use crate::config::{AssetsConfig, ProcessingConfig, extraction_threads};
use crate::fs_utils::{FsError, Placed, normalize_relative, place_file, safe_join};
use crate::output::stage_progress;
use crate::pool::{CancelToken, PoolError, StagePool};
use crate::sources::{SourceUnit, UnitKind};
use crate::store::{StateStore, StoreError};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Bethesda archive extensions unpacked from inside a unit.
const EMBEDDED_ARCHIVE_EXTENSIONS: &[&str] = &["bsa", "ba2"];

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("output directory {output} overlaps source {source_root}")]
    OutputOverlapsSource { output: PathBuf, source_root: PathBuf },
    #[error("merge cancelled")]
    Cancelled,
}

/// An archive that could not be unpacked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionFailure {
    pub unit: String,
    pub archive: String,
    pub error: String,
}

/// What the merge produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Merged relative path → name of the unit whose copy survived.
    pub assets: BTreeMap<String, String>,
    pub failures: Vec<ExtractionFailure>,
    /// Paths written by more than one unit.
    pub overrides: usize,
    pub units: usize,
    pub hard_linked: usize,
    pub copied: usize,
}

impl MergeReport {
    fn record(&mut self, key: String, unit: &str, placed: Placed) {
        match placed {
            Placed::HardLinked => self.hard_linked += 1,
            Placed::Copied => self.copied += 1,
        }
        if let Some(previous) = self.assets.insert(key, unit.to_string())
            && previous != unit
        {
            self.overrides += 1;
        }
    }
}

/// Settings the merge needs from the resolved config.
pub struct MergeOptions<'a> {
    pub output_dir: &'a Path,
    pub work_dir: &'a Path,
    pub assets: &'a AssetsConfig,
    pub processing: &'a ProcessingConfig,
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Directories directly under `root` whose name matches `name` case-insensitively.
fn child_dirs_named(root: &Path, name: &str) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.file_name().to_string_lossy().eq_ignore_ascii_case(name)
        {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Where a unit's game files start: the unit root, or a lone `Data` folder
/// inside it when the mod was packed with one.
fn content_root(root: &Path, asset_root: &str) -> io::Result<PathBuf> {
    if !child_dirs_named(root, asset_root)?.is_empty() {
        return Ok(root.to_path_buf());
    }
    Ok(child_dirs_named(root, "data")?
        .into_iter()
        .next()
        .unwrap_or_else(|| root.to_path_buf()))
}

/// Embedded archives at the top level of a unit, by lowercase name.
fn embedded_archives(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut archives: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_extension(p, EMBEDDED_ARCHIVE_EXTENSIONS))
        .collect();
    archives.sort_by_key(|p| file_name(p).to_lowercase());
    Ok(archives)
}

/// Copy the asset subtree of `src_root` into the output tree.
fn copy_asset_subtree(
    src_root: &Path,
    unit: &str,
    options: &MergeOptions<'_>,
    report: &mut MergeReport,
) -> Result<usize, MergeError> {
    let mut copied = 0;
    for subtree in child_dirs_named(src_root, &options.assets.root)? {
        for entry in WalkDir::new(&subtree)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(unit, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !options.assets.is_asset(entry.path()) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(src_root)
                .map_err(|_| FsError::UnsafePath(entry.path().to_path_buf()))?;
            let key = normalize_relative(rel)?;
            let dest = safe_join(options.output_dir, &key)?;
            let placed = place_file(
                entry.path(),
                &dest,
                options.processing.prefer_hardlinks,
            )?;
            report.record(key, unit, placed);
            copied += 1;
        }
    }
    Ok(copied)
}

/// Extract one archive into a fresh private scratch directory.
fn extract_to_scratch(
    toolset: &Toolset,
    archive: &Path,
    work_dir: &Path,
) -> Result<TempDir, String> {
    let extractor = toolset
        .extractor_for(archive)
        .ok_or_else(|| "no extractor supports this archive".to_string())?;
    let scratch = tempfile::Builder::new()
        .prefix("texsquash-extract-")
        .tempdir_in(work_dir)
        .map_err(|e| format!("could not create scratch directory: {e}"))?;
    extractor
        .extract(archive, scratch.path())
        .map_err(|e| e.to_string())?;
    debug!(archive = %archive.display(), tool = extractor.name(), "extracted");
    Ok(scratch)
}

fn check_overlap(output: &Path, units: &[SourceUnit]) -> Result<(), MergeError> {
    let output = output.canonicalize()?;
    for unit in units {
        let Ok(root) = unit.root.canonicalize() else {
            continue;
        };
        if output.starts_with(&root) || root.starts_with(&output) {
            return Err(MergeError::OutputOverlapsSource {
                output,
                source_root: root,
            });
        }
    }
    Ok(())
}

/// Remove the previous run's asset tree so stale files never survive.
fn clear_previous(output_dir: &Path, asset_root: &str) -> io::Result<()> {
    for dir in child_dirs_named(output_dir, asset_root)? {
        info!(path = %dir.display(), "clearing previous merge");
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}

/// Merge one unit. Failures of individual archives are pushed onto the report.
fn merge_unit(
    unit: &SourceUnit,
    toolset: &Toolset,
    pool: &StagePool,
    options: &MergeOptions<'_>,
    cancel: &CancelToken,
    report: &mut MergeReport,
) -> Result<(), MergeError> {
    // A packed mod's scratch copy lives until the unit is merged
    let (root, _unpacked) = match unit.kind {
        UnitKind::Directory => (unit.root.clone(), None),
        UnitKind::Archive => match extract_to_scratch(toolset, &unit.root, options.work_dir) {
            Ok(dir) => (dir.path().to_path_buf(), Some(dir)),
            Err(error) => {
                warn!(unit = %unit.name, %error, "mod archive failed to extract");
                report.failures.push(ExtractionFailure {
                    unit: unit.name.clone(),
                    archive: file_name(&unit.root),
                    error,
                });
                return Ok(());
            }
        },
    };
    let root = content_root(&root, &options.assets.root)?;

    let archives = embedded_archives(&root)?;
    let extracted = pool.map(&archives, cancel, &ProgressBar::hidden(), |archive| {
        extract_to_scratch(toolset, archive, options.work_dir)
    })?;

    let mut from_archives = 0;
    for (archive, result) in archives.iter().zip(extracted) {
        match result {
            Some(Ok(scratch)) => {
                from_archives += copy_asset_subtree(scratch.path(), &unit.name, options, report)?;
            }
            Some(Err(error)) => {
                warn!(unit = %unit.name, archive = %archive.display(), %error, "archive failed to extract");
                report.failures.push(ExtractionFailure {
                    unit: unit.name.clone(),
                    archive: file_name(archive),
                    error,
                });
            }
            None => return Err(MergeError::Cancelled),
        }
    }
    let loose = copy_asset_subtree(&root, &unit.name, options, report)?;
    info!(
        unit = %unit.name,
        rank = unit.rank,
        archives = archives.len(),
        from_archives,
        loose,
        "merged unit"
    );
    Ok(())
}

/// Merge every unit into `options.output_dir`, lowest priority first.
pub fn merge_stage(
    units: &[SourceUnit],
    toolset: &Toolset,
    options: &MergeOptions<'_>,
    cancel: &CancelToken,
) -> Result<MergeReport, MergeError> {
    fs::create_dir_all(options.output_dir)?;
    fs::create_dir_all(options.work_dir)?;
    check_overlap(options.output_dir, units)?;
    clear_previous(options.output_dir, &options.assets.root)?;

    let mut ordered: Vec<&SourceUnit> = units.iter().collect();
    ordered.sort_by(|a, b| b.rank.cmp(&a.rank));

    let pool = StagePool::new("extract", extraction_threads(options.processing))?;
    let progress = stage_progress("merge", ordered.len());
    let mut report = MergeReport {
        units: ordered.len(),
        ..MergeReport::default()
    };
    for unit in ordered {
        if cancel.is_cancelled() {
            progress.abandon();
            return Err(MergeError::Cancelled);
        }
        progress.set_message(unit.name.clone());
        merge_unit(unit, toolset, &pool, options, cancel, &mut report)?;
        progress.inc(1);
    }
    progress.finish_and_clear();

    info!(
        assets = report.assets.len(),
        overrides = report.overrides,
        failures = report.failures.len(),
        hard_linked = report.hard_linked,
        copied = report.copied,
        "merge complete"
    );
    Ok(report)
}

/// Start a fresh state store holding one `Pending` record per merged asset.
pub fn seed_store(output_dir: &Path, report: &MergeReport) -> Result<StateStore, MergeError> {
    let store = StateStore::create(output_dir)?;
    store.insert_pending(
        report
            .assets
            .iter()
            .map(|(key, unit)| (key.clone(), unit.clone())),
    )?;
    store.update_notes(|n| {
        n.units = report.units;
        n.merged_files = report.assets.len();
        n.overrides = report.overrides;
        n.extraction_failures = report.failures.clone();
    })?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::backend::tests::MockExtractor;
    use crate::fs_utils::list_files;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn unit(name: &str, root: &Path, rank: usize) -> SourceUnit {
        SourceUnit {
            name: name.to_string(),
            root: root.to_path_buf(),
            rank,
            kind: UnitKind::Directory,
        }
    }

    fn toolset(extractor: MockExtractor) -> Toolset {
        Toolset {
            extractors: vec![Box::new(extractor)],
            identifier: None,
            codecs: Vec::new(),
        }
    }

    struct Fixture {
        tmp: TempDir,
        assets: AssetsConfig,
        processing: ProcessingConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tmp: TempDir::new().unwrap(),
                assets: AssetsConfig::default(),
                processing: ProcessingConfig {
                    extraction_threads: Some(2),
                    ..ProcessingConfig::default()
                },
            }
        }

        fn mods(&self) -> PathBuf {
            self.tmp.path().join("mods")
        }

        fn options<'a>(&'a self, output: &'a Path, work: &'a Path) -> MergeOptions<'a> {
            MergeOptions {
                output_dir: output,
                work_dir: work,
                assets: &self.assets,
                processing: &self.processing,
            }
        }

        fn merge(&self, units: &[SourceUnit], tools: &Toolset, output: &str) -> MergeReport {
            let output = self.tmp.path().join(output);
            let work = self.tmp.path().join("work");
            merge_stage(units, tools, &self.options(&output, &work), &CancelToken::new()).unwrap()
        }
    }

    // =========================================================================
    // Priority
    // =========================================================================

    #[test]
    fn highest_priority_unit_wins() {
        let fx = Fixture::new();
        let base = fx.tmp.path().join("game/Data");
        let a = fx.mods().join("A");
        let b = fx.mods().join("B");
        write(&base, "textures/t.dds", b"base");
        write(&a, "textures/t.dds", b"A");
        write(&b, "textures/t.dds", b"B");
        write(&a, "textures/only_a.dds", b"A");
        let units = [unit("B", &b, 0), unit("A", &a, 1), unit("base", &base, 2)];

        let report = fx.merge(&units, &toolset(MockExtractor::new()), "out");
        let out = fx.tmp.path().join("out");
        assert_eq!(fs::read(out.join("textures/t.dds")).unwrap(), b"B");
        assert_eq!(report.assets["textures/t.dds"], "B");
        assert_eq!(report.assets["textures/only_a.dds"], "A");
        assert_eq!(report.overrides, 2);
    }

    #[test]
    fn input_order_does_not_matter() {
        let fx = Fixture::new();
        let a = fx.mods().join("A");
        let b = fx.mods().join("B");
        write(&a, "textures/t.dds", b"A");
        write(&b, "textures/t.dds", b"B");

        let report = fx.merge(
            &[unit("A", &a, 1), unit("B", &b, 0)],
            &toolset(MockExtractor::new()),
            "out",
        );
        assert_eq!(report.assets["textures/t.dds"], "B");
    }

    #[test]
    fn loose_files_override_own_archives_in_name_order() {
        let fx = Fixture::new();
        let m = fx.mods().join("M");
        write(&m, "M - Textures2.bsa", b"");
        write(&m, "M - Textures1.bsa", b"");
        write(&m, "textures/loose.dds", b"loose");
        let extractor = MockExtractor::new()
            .with_archive(
                "M - Textures1.bsa",
                &[("textures/x.dds", b"one"), ("textures/loose.dds", b"one")],
            )
            .with_archive("M - Textures2.bsa", &[("textures/x.dds", b"two")]);

        fx.merge(&[unit("M", &m, 0)], &toolset(extractor), "out");
        let out = fx.tmp.path().join("out");
        assert_eq!(fs::read(out.join("textures/x.dds")).unwrap(), b"two");
        assert_eq!(fs::read(out.join("textures/loose.dds")).unwrap(), b"loose");
    }

    // =========================================================================
    // Filtering and normalization
    // =========================================================================

    #[test]
    fn only_asset_subtree_is_merged_lowercase() {
        let fx = Fixture::new();
        let m = fx.mods().join("M");
        write(&m, "Textures/Architecture/Wall_N.DDS", b"n");
        write(&m, "textures/readme.txt", b"txt");
        write(&m, "meshes/wall.nif", b"nif");
        write(&m, "wall.dds", b"top-level");

        let report = fx.merge(&[unit("M", &m, 0)], &toolset(MockExtractor::new()), "out");
        let keys: Vec<&String> = report.assets.keys().collect();
        assert_eq!(keys, vec!["textures/architecture/wall_n.dds"]);
        assert!(fx
            .tmp
            .path()
            .join("out/textures/architecture/wall_n.dds")
            .exists());
    }

    #[test]
    fn packed_mod_with_data_folder() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.mods()).unwrap();
        let archive = fx.mods().join("Packed.7z");
        write(&fx.mods(), "Packed.7z", b"");
        let extractor =
            MockExtractor::new().with_archive("Packed.7z", &[("Data/textures/p.dds", b"packed")]);
        let packed = SourceUnit {
            name: "Packed".into(),
            root: archive,
            rank: 0,
            kind: UnitKind::Archive,
        };

        let report = fx.merge(&[packed], &toolset(extractor), "out");
        assert_eq!(report.assets["textures/p.dds"], "Packed");
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[test]
    fn failed_archive_is_reported_and_merge_continues() {
        let fx = Fixture::new();
        let m = fx.mods().join("M");
        write(&m, "bad.bsa", b"");
        write(&m, "good.bsa", b"");
        let extractor = MockExtractor::new()
            .failing_on("bad.bsa")
            .with_archive("good.bsa", &[("textures/g.dds", b"g")]);

        let report = fx.merge(&[unit("M", &m, 0)], &toolset(extractor), "out");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].archive, "bad.bsa");
        assert_eq!(report.failures[0].unit, "M");
        assert!(report.assets.contains_key("textures/g.dds"));
    }

    #[test]
    fn output_inside_source_is_rejected() {
        let fx = Fixture::new();
        let m = fx.mods().join("M");
        write(&m, "textures/a.dds", b"a");
        let output = m.join("out");
        let work = fx.tmp.path().join("work");
        let err = merge_stage(
            &[unit("M", &m, 0)],
            &toolset(MockExtractor::new()),
            &fx.options(&output, &work),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::OutputOverlapsSource { .. }));
    }

    #[test]
    fn cancelled_before_start() {
        let fx = Fixture::new();
        let m = fx.mods().join("M");
        write(&m, "textures/a.dds", b"a");
        let cancel = CancelToken::new();
        cancel.cancel();
        let output = fx.tmp.path().join("out");
        let work = fx.tmp.path().join("work");
        let result = merge_stage(
            &[unit("M", &m, 0)],
            &toolset(MockExtractor::new()),
            &fx.options(&output, &work),
            &cancel,
        );
        assert!(matches!(result, Err(MergeError::Cancelled)));
    }

    // =========================================================================
    // Determinism and reruns
    // =========================================================================

    #[test]
    fn repeated_merges_are_identical() {
        let fx = Fixture::new();
        let a = fx.mods().join("A");
        let b = fx.mods().join("B");
        for i in 0..20 {
            write(&a, &format!("textures/f{i}.dds"), format!("A{i}").as_bytes());
            if i % 3 == 0 {
                write(&b, &format!("Textures/F{i}.dds"), format!("B{i}").as_bytes());
            }
        }
        write(&b, "b.bsa", b"");
        let tools = toolset(MockExtractor::new().with_archive("b.bsa", &[("textures/f1.dds", b"bsa")]));
        let units = [unit("B", &b, 0), unit("A", &a, 1)];

        fx.merge(&units, &tools, "one");
        fx.merge(&units, &tools, "two");
        let read_tree = |name: &str| -> Vec<(String, Vec<u8>)> {
            list_files(&fx.tmp.path().join(name))
                .unwrap()
                .into_iter()
                .map(|(k, p)| (k, fs::read(p).unwrap()))
                .collect()
        };
        assert_eq!(read_tree("one"), read_tree("two"));
    }

    #[test]
    fn rerun_clears_stale_assets() {
        let fx = Fixture::new();
        let m = fx.mods().join("M");
        write(&m, "textures/a.dds", b"a");
        let out = fx.tmp.path().join("out");
        write(&out, "Textures/stale.dds", b"old");

        fx.merge(&[unit("M", &m, 0)], &toolset(MockExtractor::new()), "out");
        assert!(!out.join("Textures/stale.dds").exists());
        assert!(out.join("textures/a.dds").exists());
    }

    #[test]
    fn seed_store_creates_pending_records() {
        let fx = Fixture::new();
        let m = fx.mods().join("M");
        write(&m, "textures/a.dds", b"a");
        write(&m, "bad.ba2", b"");
        let tools = toolset(MockExtractor::new().failing_on("bad.ba2"));
        let report = fx.merge(&[unit("M", &m, 0)], &tools, "out");

        let store = seed_store(&fx.tmp.path().join("out"), &report).unwrap();
        let record = store.get("textures/a.dds").unwrap();
        assert_eq!(record.status, crate::store::AssetStatus::Pending);
        assert_eq!(record.source_unit, "M");
        let notes = store.notes();
        assert_eq!(notes.merged_files, 1);
        assert_eq!(notes.extraction_failures.len(), 1);
    }
}
