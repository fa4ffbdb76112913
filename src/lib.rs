//! # texsquash
//!
//! A batch texture pipeline for heavily modded Bethesda games. It merges the
//! texture assets of every mod in load order into one tree, decides per texture
//! whether it fits the chosen VRAM preset, and shrinks and recompresses the ones
//! that don't through external codec tools.
//!
//! # Architecture: Staged Pipeline Over a State Store
//!
//! ```text
//! 1. Sources    mods/ + load order  →  [SourceUnit]        (rank 0 = wins)
//! 2. Merge      [SourceUnit]        →  output/textures/**  + state store
//! 3. Analyze    state store         →  type, category, width × height
//! 4. Plan       state store         →  keep / resize / skip per asset
//! 5. Transform  state store         →  resized textures, in place
//! 6. Finalize   output/             →  <output>-final/ + summary.txt
//! ```
//!
//! From the merge onward every stage reads and writes the state store
//! (`output/.texsquash-state.json`). That gives:
//!
//! - **Auditability**: every asset's lifecycle state and decision is on disk.
//! - **Resumability**: each stage is also a CLI command; an interrupted
//!   transform resumes where it stopped.
//! - **Testability**: stages are plain functions over the store, so tests drive
//!   them with mock tools and no subprocesses.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`sources`] | Load-order parsing and source unit ranking |
//! | [`merge`] | Priority-ordered overlay merge, parallel archive extraction |
//! | [`classify`] | Semantic type and category from the path; exclusion rules |
//! | [`analyze`] | Three-tier dimension analysis with safe-mode recovery |
//! | [`plan`] | Pure keep/resize decision against preset budgets |
//! | [`execute`] | Concurrent codec jobs with primary → fallback chain |
//! | [`finalize`] | Quality control, packaging and the run summary |
//! | [`store`] | Persistent per-asset state machine |
//! | [`pipeline`] | Stage orchestration and the aggregated error type |
//! | [`codec`] | Collaborator tool traits, DDS header parser, subprocess tools |
//! | [`tools`] | Startup capability probing for the collaborator tools |
//! | [`pool`] | Per-stage bounded worker pools and cancellation |
//! | [`fs_utils`] | Path-safe placement into the shared output tree |
//! | [`config`] | `texsquash.toml` loading, merging and validation |
//! | [`logging`] | Per-stage log files under `logfiles/` |
//! | [`output`] | CLI output formatting and progress bars |
//!
//! # Design Decisions
//!
//! ## Last Writer Wins
//!
//! Units are merged one at a time from the lowest priority up, and each copy
//! replaces what is already there. The highest-priority unit is simply the last
//! one to write a path, so the merge needs no conflict table and produces the
//! same tree every time.
//!
//! ## Codecs Are Collaborators
//!
//! The pipeline never decodes BSA archives or block-compresses pixels itself.
//! It decides what to run and in which order; `bsarch`, `7z`, `texconv` and
//! ImageMagick do the work behind the [`codec::Extractor`],
//! [`codec::Identifier`] and [`codec::Codec`] traits.
//!
//! ## Originals Survive Failure
//!
//! Extraction and codec jobs write only into private scratch directories and
//! move a result into the shared tree after it has been checked. A failed job
//! leaves the original texture in place.

pub mod analyze;
pub mod classify;
pub mod codec;
pub mod config;
pub mod execute;
pub mod finalize;
pub mod fs_utils;
pub mod logging;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod plan;
pub mod pool;
pub mod sources;
pub mod store;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_helpers;
