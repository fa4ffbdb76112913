//! Shared test utilities for the texsquash test suite.
//!
//! Builds throwaway game installs: a game directory with `Data/`, a mods
//! directory, and textures with valid DDS headers, plus a config pointing at
//! all of it.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let install = FakeInstall::new();
//! install.base_texture("textures/rock_d.dds", 512, 512);
//! install.mod_texture("Better Rocks", "textures/rock_d.dds", 2048, 2048);
//!
//! let config = install.config();
//! ```

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::codec::Toolset;
use crate::codec::backend::tests::{MockBehavior, MockCodec, MockExtractor, MockIdentifier};
use crate::codec::dds::synth_header;
use crate::config::{PathsConfig, PipelineConfig, ProcessingConfig};

// =========================================================================
// File writers
// =========================================================================

/// Write `data` at `root/rel`, creating parents.
pub fn write_file(root: &Path, rel: &str, data: &[u8]) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    path
}

/// Write a DDS file whose header reports `width` × `height`.
pub fn write_dds(root: &Path, rel: &str, width: u32, height: u32) -> PathBuf {
    write_file(root, rel, &synth_header(width, height, b"DXT1"))
}

// =========================================================================
// Fake install
// =========================================================================

/// A temp directory laid out as `game/Data`, `mods/`, `out/`, `work/`.
pub struct FakeInstall {
    pub tmp: TempDir,
}

impl FakeInstall {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("game/Data")).unwrap();
        std::fs::create_dir_all(tmp.path().join("mods")).unwrap();
        Self { tmp }
    }

    pub fn game_data(&self) -> PathBuf {
        self.tmp.path().join("game/Data")
    }

    pub fn mods(&self) -> PathBuf {
        self.tmp.path().join("mods")
    }

    pub fn output(&self) -> PathBuf {
        self.tmp.path().join("out")
    }

    pub fn final_dir(&self) -> PathBuf {
        self.tmp.path().join("out-final")
    }

    /// Texture shipped loose with the base game.
    pub fn base_texture(&self, rel: &str, width: u32, height: u32) -> PathBuf {
        write_dds(&self.game_data(), rel, width, height)
    }

    /// Texture shipped loose by a mod directory.
    pub fn mod_texture(&self, mod_name: &str, rel: &str, width: u32, height: u32) -> PathBuf {
        write_dds(&self.mods().join(mod_name), rel, width, height)
    }

    /// Write `modlist.txt` with every name active, in the given order.
    pub fn modlist(&self, names: &[&str]) {
        let content: String = names.iter().map(|n| format!("+{n}\n")).collect();
        write_file(&self.mods(), "modlist.txt", content.as_bytes());
    }

    /// Config pointing at this install, two worker threads.
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            paths: PathsConfig {
                game_dir: Some(self.tmp.path().join("game")),
                mods_dir: Some(self.mods()),
                output_dir: Some(self.output()),
                work_dir: Some(self.tmp.path().join("work")),
                log_dir: self.tmp.path().join("logfiles"),
                ..PathsConfig::default()
            },
            processing: ProcessingConfig {
                threads: Some(2),
                extraction_threads: Some(2),
                ..ProcessingConfig::default()
            },
            ..PipelineConfig::default()
        }
    }
}

/// Toolset of recording mocks: one extractor, an identifier that knows nothing,
/// and the given codec behaviors as primary and fallback.
pub fn mock_toolset(
    extractor: MockExtractor,
    primary: MockBehavior,
    fallback: MockBehavior,
) -> Toolset {
    Toolset {
        extractors: vec![Box::new(extractor)],
        identifier: Some(Box::new(MockIdentifier::new())),
        codecs: vec![
            Box::new(MockCodec::new("primary", primary)),
            Box::new(MockCodec::new("fallback", fallback)),
        ],
    }
}
