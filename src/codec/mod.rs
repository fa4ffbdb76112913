//! Texture and archive tooling seam.
//!
//! | Operation | Implementation |
//! |---|---|
//! | **Header read** | in-process DDS header parser, `image::image_dimensions` for the rest |
//! | **Extract** | `bsarch` for BSA/BA2, `7z` for everything else |
//! | **Identify** | ImageMagick `identify -format "%w %h %m"` |
//! | **Resize + compress** | `texconv` first, ImageMagick second |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing tool operations
//! - **Backend**: [`Extractor`], [`Identifier`] and [`Codec`] traits + [`Toolset`]
//! - **DDS**: header parser used by the analyzer and quality control
//! - **External**: the subprocess implementations of the backend traits

pub mod backend;
pub mod calculations;
pub mod dds;
pub mod external;
mod params;

pub use backend::{Codec, Extractor, Identifier, ToolError, Toolset};
pub use params::{Identified, TargetFormat, TransformParams};
