//! Collaborator tool traits and shared error type.
//!
//! The pipeline never decodes a BSA or compresses a texture itself. It talks to
//! three capabilities, each behind a trait:
//!
//! | Trait | Contract |
//! |---|---|
//! | [`Extractor`] | `extract(archive, dest_dir)` |
//! | [`Identifier`] | `identify(path) -> (width, height, format)` |
//! | [`Codec`] | `transform(source, width, height, format) -> output` |
//!
//! Production implementations shell out (see [`external`](super::external)).
//! Tests use the recording mocks in [`tests`].

use super::params::{Identified, TransformParams};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
    #[error("{tool} exited with {code:?}")]
    ExitStatus { tool: String, code: Option<i32> },
    #[error("{tool} produced no output at {path}")]
    MissingOutput { tool: String, path: PathBuf },
    #[error("could not parse {tool} output: {detail}")]
    Parse { tool: String, detail: String },
    #[error("{tool} cannot handle {path}")]
    Unsupported { tool: String, path: PathBuf },
}

impl ToolError {
    /// Whether the tool itself failed to run, as opposed to rejecting one input.
    pub fn is_systemic(&self) -> bool {
        matches!(self, ToolError::Io(_) | ToolError::Timeout { .. })
    }
}

/// Unpacks an archive into a directory.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this extractor understands the archive (by extension).
    fn supports(&self, archive: &Path) -> bool;

    /// Extract every entry of `archive` below `dest`.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ToolError>;
}

/// Reports a texture's dimensions.
pub trait Identifier: Send + Sync {
    fn name(&self) -> &str;

    fn identify(&self, path: &Path) -> Result<Identified, ToolError>;
}

/// Resizes and recompresses a texture.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Write the transformed texture to `params.output`.
    fn transform(&self, params: &TransformParams) -> Result<(), ToolError>;
}

/// The resolved collaborators for one run.
///
/// `codecs` is in fallback order: the executor tries `codecs[0]` first, then
/// `codecs[1]`.
pub struct Toolset {
    pub extractors: Vec<Box<dyn Extractor>>,
    pub identifier: Option<Box<dyn Identifier>>,
    pub codecs: Vec<Box<dyn Codec>>,
}

impl Toolset {
    /// First extractor that claims the archive.
    pub fn extractor_for(&self, archive: &Path) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.supports(archive))
            .map(|e| e.as_ref())
    }

    pub fn identifier(&self) -> Option<&dyn Identifier> {
        self.identifier.as_deref()
    }

    pub fn primary_codec(&self) -> Option<&dyn Codec> {
        self.codecs.first().map(|c| c.as_ref())
    }

    pub fn fallback_codec(&self) -> Option<&dyn Codec> {
        self.codecs.get(1).map(|c| c.as_ref())
    }
}
