//! Pipeline configuration module.
//!
//! Handles loading, validating, and merging `texsquash.toml`. Configuration is
//! layered: stock defaults, then the user's config file, then command-line
//! flags. The result is an immutable [`PipelineConfig`] passed by reference to
//! every stage.
//!
//! ## Config File Location
//!
//! `--config PATH` if given, else `texsquash.toml` in the current directory,
//! else stock defaults only.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [paths]
//! # game_dir = "/games/Skyrim Special Edition"
//! # mods_dir = "/modding/mods"
//! # output_dir = "/modding/texsquash-output"
//! # load_order = "/modding/profiles/Default/modlist.txt"
//! # work_dir = "/fast-disk/tmp"
//! # final_dir = "/modding/texsquash-output-final"
//! log_dir = "logfiles"
//!
//! [assets]
//! root = "textures"         # Asset subtree merged from every source
//! extensions = ["dds"]      # File types considered assets
//!
//! [preset]
//! name = "quality"          # ultra | quality | optimum | performance | potato
//! # diffuse = 2048          # Per-type budget overrides
//!
//! [exclusions]
//! globs = ["*_glow.dds", "*_g.dds", "*_emit.dds"]
//! dir_patterns = ["interface/", "lod/", "terrain/", "dyndolod/"]
//!
//! [classify]
//! unsuffixed_as_diffuse = false
//!
//! [processing]
//! # threads = 8             # Omit for auto = CPU cores
//! # extraction_threads = 4  # Omit for auto = half the cores
//! job_timeout_secs = 600
//! tool_failure_ratio = 0.5
//! prefer_hardlinks = true
//!
//! [quality]
//! min_file_bytes = 128
//! sample_size = 200
//!
//! [tools]
//! # texconv = "/opt/directxtex/texconv"
//! ```
//!
//! ## Partial Configuration
//!
//! Config files are sparse. Override just the values you want:
//!
//! ```toml
//! [preset]
//! name = "performance"
//! normal = 2048
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the config file discovered in the current directory.
pub const CONFIG_FILENAME: &str = "texsquash.toml";

/// Environment variable overriding the scratch directory.
pub const WORK_DIR_ENV: &str = "TEXSQUASH_TMPDIR";

/// Smallest budget that still holds one compression block.
const MIN_BUDGET: u32 = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Required path not set: {0}")]
    MissingPath(&'static str),
}

/// Pipeline configuration loaded from `texsquash.toml`.
///
/// All fields have sensible defaults. User config files need only specify
/// the values they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Input, output and scratch locations.
    pub paths: PathsConfig,
    /// Which files of each source count as assets.
    pub assets: AssetsConfig,
    /// Size budgets per texture type.
    pub preset: PresetConfig,
    /// Assets deleted before analysis.
    pub exclusions: ExclusionConfig,
    /// Classifier switches.
    pub classify: ClassifyConfig,
    /// Parallelism and tool limits.
    pub processing: ProcessingConfig,
    /// Post-transform checks.
    pub quality: QualityConfig,
    /// Explicit collaborator tool locations.
    pub tools: ToolsConfig,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let budgets = self.preset.budgets();
        for (name, value) in budgets.named() {
            if value < MIN_BUDGET {
                return Err(ConfigError::Validation(format!(
                    "preset.{name} must be at least {MIN_BUDGET} (got {value})"
                )));
            }
        }
        let root = self.assets.root.trim_matches('/');
        if root.is_empty() || root.contains('/') || root.contains('\\') || root == ".." {
            return Err(ConfigError::Validation(
                "assets.root must be a single directory name".into(),
            ));
        }
        if self.assets.extensions.is_empty() {
            return Err(ConfigError::Validation(
                "assets.extensions must not be empty".into(),
            ));
        }
        for pattern in &self.exclusions.globs {
            glob::Pattern::new(pattern).map_err(|e| {
                ConfigError::Validation(format!("exclusions.globs: bad pattern {pattern:?}: {e}"))
            })?;
        }
        let ratio = self.processing.tool_failure_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Validation(
                "processing.tool_failure_ratio must be in (0, 1]".into(),
            ));
        }
        if self.processing.job_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "processing.job_timeout_secs must be non-zero".into(),
            ));
        }
        if self.processing.threads == Some(0) || self.processing.extraction_threads == Some(0) {
            return Err(ConfigError::Validation(
                "processing thread counts must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply command-line overrides on top of the loaded file, then re-validate.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Result<Self, ConfigError> {
        let paths = &mut self.paths;
        for (slot, value) in [
            (&mut paths.game_dir, &overrides.game_dir),
            (&mut paths.mods_dir, &overrides.mods_dir),
            (&mut paths.output_dir, &overrides.output_dir),
            (&mut paths.load_order, &overrides.load_order),
            (&mut paths.work_dir, &overrides.work_dir),
        ] {
            if value.is_some() {
                *slot = value.clone();
            }
        }
        if let Some(log_dir) = &overrides.log_dir {
            paths.log_dir = log_dir.clone();
        }
        if let Some(preset) = overrides.preset {
            self.preset.name = preset;
        }
        if let Some(threads) = overrides.threads {
            self.processing.threads = Some(threads);
        }
        self.validate()?;
        Ok(self)
    }
}

/// Values supplied on the command line. `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub game_dir: Option<PathBuf>,
    pub mods_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub load_order: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub preset: Option<PresetName>,
    pub threads: Option<usize>,
}

/// Input, output and scratch locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Game installation; its `Data` directory is the lowest-priority source.
    pub game_dir: Option<PathBuf>,
    /// One subdirectory or archive per mod.
    pub mods_dir: Option<PathBuf>,
    /// Merged tree and state store live here during a run.
    pub output_dir: Option<PathBuf>,
    /// Explicit load-order file. Looked for inside `mods_dir` when absent.
    pub load_order: Option<PathBuf>,
    /// Scratch root for extraction and codec jobs.
    pub work_dir: Option<PathBuf>,
    /// Delivery directory. Defaults to `<output_dir>-final`.
    pub final_dir: Option<PathBuf>,
    /// Per-stage log files.
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            game_dir: None,
            mods_dir: None,
            output_dir: None,
            load_order: None,
            work_dir: None,
            final_dir: None,
            log_dir: PathBuf::from("logfiles"),
        }
    }
}

impl PathsConfig {
    pub fn require_game_dir(&self) -> Result<&Path, ConfigError> {
        self.game_dir
            .as_deref()
            .ok_or(ConfigError::MissingPath("game_dir"))
    }

    pub fn require_mods_dir(&self) -> Result<&Path, ConfigError> {
        self.mods_dir
            .as_deref()
            .ok_or(ConfigError::MissingPath("mods_dir"))
    }

    pub fn require_output_dir(&self) -> Result<&Path, ConfigError> {
        self.output_dir
            .as_deref()
            .ok_or(ConfigError::MissingPath("output_dir"))
    }

    /// Explicit `final_dir`, else `<output_dir>-final` next to the output.
    pub fn resolve_final_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.final_dir {
            return Ok(dir.clone());
        }
        let output = self.require_output_dir()?;
        let mut name = output
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("output"));
        name.push("-final");
        Ok(output.with_file_name(name))
    }

    /// `work_dir` from config, else `$TEXSQUASH_TMPDIR`, else the system temp dir.
    pub fn resolve_work_dir(&self) -> PathBuf {
        resolve_work_dir_from(
            self.work_dir.as_deref(),
            std::env::var_os(WORK_DIR_ENV),
        )
    }
}

fn resolve_work_dir_from(configured: Option<&Path>, env: Option<OsString>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or_else(std::env::temp_dir)
}

/// Which part of each source is merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssetsConfig {
    /// Top-level directory (case-insensitive) holding the assets.
    pub root: String,
    /// Asset file extensions, without the dot. Non-DDS assets are analyzed
    /// but always kept as they are.
    pub extensions: Vec<String>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            root: "textures".to_string(),
            extensions: vec!["dds".to_string()],
        }
    }
}

impl AssetsConfig {
    /// Lowercased asset root, as it appears in merged relative paths.
    pub fn root_lower(&self) -> String {
        self.root.trim_matches('/').to_ascii_lowercase()
    }

    pub fn is_asset(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}

/// Named VRAM presets.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PresetName {
    Ultra,
    #[default]
    Quality,
    Optimum,
    Performance,
    Potato,
}

impl PresetName {
    /// Stock budgets as `diffuse/normal/parallax/material`.
    pub fn budgets(self) -> Budgets {
        let (diffuse, normal, parallax, material) = match self {
            PresetName::Ultra => (4096, 2048, 1024, 2048),
            PresetName::Quality => (2048, 2048, 1024, 1024),
            PresetName::Optimum => (2048, 1024, 512, 1024),
            PresetName::Performance => (1024, 1024, 512, 512),
            PresetName::Potato => (512, 512, 256, 256),
        };
        Budgets {
            diffuse,
            normal,
            parallax,
            material,
        }
    }
}

/// Maximum edge length per texture type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    pub diffuse: u32,
    pub normal: u32,
    pub parallax: u32,
    pub material: u32,
}

impl Budgets {
    fn named(&self) -> [(&'static str, u32); 4] {
        [
            ("diffuse", self.diffuse),
            ("normal", self.normal),
            ("parallax", self.parallax),
            ("material", self.material),
        ]
    }
}

/// Preset selection plus optional per-type overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresetConfig {
    pub name: PresetName,
    pub diffuse: Option<u32>,
    pub normal: Option<u32>,
    pub parallax: Option<u32>,
    pub material: Option<u32>,
}

impl PresetConfig {
    /// Stock budgets of the named preset with any overrides applied.
    pub fn budgets(&self) -> Budgets {
        let stock = self.name.budgets();
        Budgets {
            diffuse: self.diffuse.unwrap_or(stock.diffuse),
            normal: self.normal.unwrap_or(stock.normal),
            parallax: self.parallax.unwrap_or(stock.parallax),
            material: self.material.unwrap_or(stock.material),
        }
    }
}

/// Assets removed unconditionally before analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExclusionConfig {
    /// Case-insensitive globs matched against the file name.
    pub globs: Vec<String>,
    /// Substrings matched against the lowercase directory path.
    pub dir_patterns: Vec<String>,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            globs: ["*_glow.dds", "*_g.dds", "*_emit.dds"]
                .map(String::from)
                .to_vec(),
            dir_patterns: ["interface/", "lod/", "terrain/", "dyndolod/"]
                .map(String::from)
                .to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifyConfig {
    /// Treat textures without a recognised suffix as diffuse maps.
    pub unsuffixed_as_diffuse: bool,
}

/// Parallel processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Worker threads for analysis and transformation.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub threads: Option<usize>,
    /// Worker threads for archive extraction.
    /// When absent, defaults to half the cores (at least one).
    pub extraction_threads: Option<usize>,
    /// Seconds before a stuck tool is killed.
    pub job_timeout_secs: u64,
    /// Share of failing identify calls that marks the analysis pass as broken.
    pub tool_failure_ratio: f64,
    /// Hard-link merged files instead of copying when possible.
    pub prefer_hardlinks: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            threads: None,
            extraction_threads: None,
            job_timeout_secs: 600,
            tool_failure_ratio: 0.5,
            prefer_hardlinks: true,
        }
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    threads_for(config.threads, available_cores())
}

fn threads_for(requested: Option<usize>, cores: usize) -> usize {
    requested.map(|n| n.clamp(1, cores)).unwrap_or(cores)
}

/// Resolve the extraction-stage thread count.
///
/// The extractor is itself CPU and disk heavy, so the default is half the
/// cores, and never more than the general thread count.
pub fn extraction_threads(config: &ProcessingConfig) -> usize {
    extraction_threads_for(config, available_cores())
}

fn extraction_threads_for(config: &ProcessingConfig, cores: usize) -> usize {
    let total = threads_for(config.threads, cores);
    match config.extraction_threads {
        Some(n) => n.clamp(1, total),
        None => (cores / 2).max(1).min(total),
    }
}

/// Post-transform checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityConfig {
    /// Files smaller than this are flagged (not deleted).
    pub min_file_bytes: u64,
    /// How many files the identify tool re-validates.
    pub sample_size: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_file_bytes: 128,
            sample_size: 200,
        }
    }
}

/// Explicit tool locations. Anything unset is searched for on `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub bsarch: Option<PathBuf>,
    pub seven_zip: Option<PathBuf>,
    pub identify: Option<PathBuf>,
    pub texconv: Option<PathBuf>,
    pub magick: Option<PathBuf>,
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(PipelineConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
/// Returns `Err` if the file exists but contains invalid TOML.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<PipelineConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: PipelineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load the pipeline config.
///
/// An explicit path must exist. Without one, `texsquash.toml` in `cwd` is used
/// when present, otherwise stock defaults.
pub fn load_config(explicit: Option<&Path>, cwd: &Path) -> Result<PipelineConfig, ConfigError> {
    let overlay = match explicit {
        Some(path) => {
            Some(load_raw_config(path)?.ok_or_else(|| ConfigError::NotFound(path.to_path_buf()))?)
        }
        None => load_raw_config(&cwd.join(CONFIG_FILENAME))?,
    };
    resolve_config(stock_defaults_value()?, overlay)
}

/// Returns a fully-commented stock `texsquash.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# texsquash Configuration
# =======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Command-line flags (--game-dir, --mods-dir, --output-dir, --preset,
# --threads, ...) override the values in this file.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Paths
# ---------------------------------------------------------------------------
[paths]
# Game installation. Its Data directory is merged first (lowest priority).
# game_dir = "/games/Skyrim Special Edition"

# Mods directory: one subdirectory (or .7z/.zip/.rar) per mod.
# mods_dir = "/modding/mods"

# Where the merged tree is built and transformed.
# output_dir = "/modding/texsquash-output"

# Load order. modlist.txt (+active / -inactive), a plain list, or
# index,name,isActive,path CSV. Looked for in mods_dir when omitted.
# load_order = "/modding/profiles/Default/modlist.txt"

# Scratch space for extraction and conversion. Falls back to
# $TEXSQUASH_TMPDIR, then the system temp directory.
# work_dir = "/fast-disk/tmp"

# Delivery directory. Defaults to "<output_dir>-final".
# final_dir = "/modding/texsquash-output-final"

# Per-stage log files.
log_dir = "logfiles"

# ---------------------------------------------------------------------------
# Assets
# ---------------------------------------------------------------------------
[assets]
# Top-level directory of each source that holds the assets.
root = "textures"

# File extensions treated as assets. Non-DDS assets are analyzed
# but never resized.
extensions = ["dds"]

# ---------------------------------------------------------------------------
# Preset (max edge length per texture type)
# ---------------------------------------------------------------------------
[preset]
#   name          diffuse  normal  parallax  material
#   ultra            4096    2048      1024      2048
#   quality          2048    2048      1024      1024
#   optimum          2048    1024       512      1024
#   performance      1024    1024       512       512
#   potato            512     512       256       256
name = "quality"

# Per-type overrides (minimum 4).
# diffuse = 2048
# normal = 2048
# parallax = 1024
# material = 1024

# ---------------------------------------------------------------------------
# Exclusions (deleted before analysis)
# ---------------------------------------------------------------------------
[exclusions]
# Case-insensitive file-name globs.
globs = ["*_glow.dds", "*_g.dds", "*_emit.dds"]

# Substrings of the directory path.
dir_patterns = ["interface/", "lod/", "terrain/", "dyndolod/"]

# ---------------------------------------------------------------------------
# Classification
# ---------------------------------------------------------------------------
[classify]
# Treat textures without a known suffix (_n, _d, _p, ...) as diffuse maps.
unsuffixed_as_diffuse = false

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Worker threads for analysis and conversion.
# Omit to auto-detect (= number of CPU cores).
# threads = 8

# Worker threads for archive extraction. Omit for half the cores.
# extraction_threads = 4

# Seconds before a stuck external tool is killed.
job_timeout_secs = 600

# If more than this share of identify calls fail, analysis is re-run
# single-threaded.
tool_failure_ratio = 0.5

# Hard-link merged files into the output instead of copying.
prefer_hardlinks = true

# ---------------------------------------------------------------------------
# Quality control
# ---------------------------------------------------------------------------
[quality]
# Files smaller than this are reported as suspicious.
min_file_bytes = 128

# Number of output files re-validated with the identify tool.
sample_size = 200

# ---------------------------------------------------------------------------
# Tools (searched on PATH when omitted)
# ---------------------------------------------------------------------------
[tools]
# bsarch = "/usr/local/bin/bsarch"
# seven_zip = "/usr/bin/7z"
# identify = "/usr/bin/magick"
# texconv = "/opt/directxtex/texconv"
# magick = "/usr/bin/magick"
"##
}
