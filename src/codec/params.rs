//! Parameter types for collaborator-tool operations.
//!
//! These structs describe *what* to do, not *how* to do it. They are the
//! interface between the planner/executor (which decide what each asset
//! becomes) and the [`backend`](super::backend) tools (which do the actual
//! pixel and archive work). Keeping them plain data lets tests swap the tools
//! for recording mocks without touching the decision logic.
//!
//! ## Types
//!
//! - [`TargetFormat`]: block-compressed output format chosen per semantic type.
//! - [`TransformParams`]: everything needed for a resize + recompress job.
//! - [`Identified`]: what an identify call reports about a texture.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Block-compressed output format.
///
/// Names follow the DXGI spelling that `texconv -f` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetFormat {
    /// Four-channel color, high quality. Diffuse and material maps.
    Bc7Unorm,
    /// Two-channel. Tangent-space normal maps.
    Bc5Unorm,
    /// Single channel. Parallax/height maps.
    Bc4Unorm,
    /// Legacy color format, used only when a tool cannot write BC7.
    Bc1Unorm,
}

impl TargetFormat {
    /// DXGI name as passed to `texconv -f`.
    pub fn dxgi_name(self) -> &'static str {
        match self {
            TargetFormat::Bc7Unorm => "BC7_UNORM",
            TargetFormat::Bc5Unorm => "BC5_UNORM",
            TargetFormat::Bc4Unorm => "BC4_UNORM",
            TargetFormat::Bc1Unorm => "BC1_UNORM",
        }
    }

    /// Closest `dds:compression` value ImageMagick can write.
    ///
    /// ImageMagick only knows the DXT family, so BC5/BC7 degrade to DXT5 and
    /// BC4 to DXT1.
    pub fn magick_compression(self) -> &'static str {
        match self {
            TargetFormat::Bc7Unorm | TargetFormat::Bc5Unorm => "dxt5",
            TargetFormat::Bc4Unorm | TargetFormat::Bc1Unorm => "dxt1",
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dxgi_name())
    }
}

/// Parameters for one resize + recompress operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformParams {
    pub source: PathBuf,
    /// Where the tool must leave its result. Always inside the job's private
    /// scratch directory, never in the shared output tree.
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: TargetFormat,
}

/// Result of an identify operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identified {
    pub width: u32,
    pub height: u32,
    /// Tool-reported format string (e.g. `DDS`, `BC7_UNORM`), if any.
    pub format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dxgi_names() {
        assert_eq!(TargetFormat::Bc7Unorm.dxgi_name(), "BC7_UNORM");
        assert_eq!(TargetFormat::Bc5Unorm.dxgi_name(), "BC5_UNORM");
        assert_eq!(TargetFormat::Bc4Unorm.to_string(), "BC4_UNORM");
    }

    #[test]
    fn magick_compression_degrades_to_dxt() {
        assert_eq!(TargetFormat::Bc7Unorm.magick_compression(), "dxt5");
        assert_eq!(TargetFormat::Bc4Unorm.magick_compression(), "dxt1");
    }

    #[test]
    fn target_format_serializes_screaming_case() {
        let json = serde_json::to_string(&TargetFormat::Bc5Unorm).unwrap();
        assert_eq!(json, "\"BC5_UNORM\"");
    }
}
