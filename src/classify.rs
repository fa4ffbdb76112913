//! Asset classification.
//!
//! `classify(path) -> (semantic type, category)` is a pure function of the
//! merged relative path. The pattern tables are compiled once when the
//! [`Classifier`] is built and evaluated per asset.
//!
//! ## Semantic type (filename suffix of the lowercase stem)
//!
//! | Type | Suffixes |
//! |---|---|
//! | normal | `_n`, `_msn`, `_normal`, `_nrm` |
//! | diffuse | `_d`, `_diffuse`, `_albedo`, `_color`, `_col` |
//! | parallax | `_p`, `_parallax`, `_height`, `_h`, `_disp` |
//! | material | `_s`, `_spec`, `_specular`, `_m`, `_mask`, `_g`, `_glow`, `_e`, `_emissive`, `_em`, `_ao`, `_rough` |
//! | skin | `_sk`, `_skin` |
//!
//! Anything else is `other`, unless `unsuffixed_as_diffuse` is set.
//!
//! ## Category (first recognised directory segment)
//!
//! `architecture`, `landscape`, `clutter`, `actors`, `weapons`, `armor`,
//! `clothing`, `effects`, `sky`, `interface`, `lod`, else `misc`.
//!
//! ## Exclusion
//!
//! Case-insensitive file-name globs and directory substrings. Excluded assets
//! are deleted before analysis.

use crate::config::{ClassifyConfig, ExclusionConfig};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("bad exclusion glob {pattern:?}: {source}")]
    Glob {
        pattern: String,
        source: glob::PatternError,
    },
    #[error("bad suffix pattern: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Diffuse,
    Normal,
    Parallax,
    Material,
    Skin,
    Other,
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SemanticType::Diffuse => "diffuse",
            SemanticType::Normal => "normal",
            SemanticType::Parallax => "parallax",
            SemanticType::Material => "material",
            SemanticType::Skin => "skin",
            SemanticType::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Architecture,
    Landscape,
    Clutter,
    Actors,
    Weapons,
    Armor,
    Clothing,
    Effects,
    Sky,
    Interface,
    Lod,
    Misc,
}

/// Directory segment → category. First match along the path wins.
const CATEGORY_SEGMENTS: &[(&str, Category)] = &[
    ("architecture", Category::Architecture),
    ("dungeons", Category::Architecture),
    ("landscape", Category::Landscape),
    ("plants", Category::Landscape),
    ("trees", Category::Landscape),
    ("clutter", Category::Clutter),
    ("actors", Category::Actors),
    ("characters", Category::Actors),
    ("creatures", Category::Actors),
    ("weapons", Category::Weapons),
    ("armor", Category::Armor),
    ("clothes", Category::Clothing),
    ("clothing", Category::Clothing),
    ("effects", Category::Effects),
    ("sky", Category::Sky),
    ("interface", Category::Interface),
    ("lod", Category::Lod),
    ("terrain", Category::Lod),
    ("dyndolod", Category::Lod),
];

/// Stem suffix tables, evaluated in order.
const SUFFIX_TABLE: &[(&str, SemanticType)] = &[
    (r"_(?:n|msn|normal|nrm)$", SemanticType::Normal),
    (r"_(?:d|diffuse|albedo|color|col)$", SemanticType::Diffuse),
    (r"_(?:p|parallax|height|h|disp)$", SemanticType::Parallax),
    (
        r"_(?:s|spec|specular|m|mask|g|glow|e|emissive|em|ao|rough)$",
        SemanticType::Material,
    ),
    (r"_(?:sk|skin)$", SemanticType::Skin),
];

/// Result of classifying one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub semantic: SemanticType,
    pub category: Category,
}

/// Why an asset is excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    Glob(String),
    Directory(String),
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::Glob(p) => write!(f, "file name matches {p:?}"),
            Exclusion::Directory(p) => write!(f, "directory matches {p:?}"),
        }
    }
}

/// Compiled classification and exclusion tables.
pub struct Classifier {
    suffixes: Vec<(Regex, SemanticType)>,
    globs: Vec<(String, Pattern)>,
    dir_patterns: Vec<String>,
    unsuffixed_as_diffuse: bool,
}

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

fn split_key(rel: &str) -> (&str, &str) {
    match rel.rfind('/') {
        Some(idx) => (&rel[..=idx], &rel[idx + 1..]),
        None => ("", rel),
    }
}

impl Classifier {
    pub fn new(exclusions: &ExclusionConfig, classify: &ClassifyConfig) -> Result<Self, ClassifyError> {
        let suffixes = SUFFIX_TABLE
            .iter()
            .map(|(re, ty)| Ok((Regex::new(re)?, *ty)))
            .collect::<Result<Vec<_>, ClassifyError>>()?;
        let globs = exclusions
            .globs
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map(|compiled| (p.clone(), compiled))
                    .map_err(|source| ClassifyError::Glob {
                        pattern: p.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            suffixes,
            globs,
            dir_patterns: exclusions
                .dir_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            unsuffixed_as_diffuse: classify.unsuffixed_as_diffuse,
        })
    }

    /// Semantic type from the file stem.
    pub fn semantic_type(&self, rel: &str) -> SemanticType {
        let (_, file) = split_key(rel);
        let file = file.to_lowercase();
        let stem = match file.rfind('.') {
            Some(idx) if idx > 0 => &file[..idx],
            _ => file.as_str(),
        };
        self.suffixes
            .iter()
            .find(|(re, _)| re.is_match(stem))
            .map(|(_, ty)| *ty)
            .unwrap_or(if self.unsuffixed_as_diffuse {
                SemanticType::Diffuse
            } else {
                SemanticType::Other
            })
    }

    /// Category from the directory segments.
    pub fn category(&self, rel: &str) -> Category {
        let (dir, _) = split_key(rel);
        dir.split('/')
            .filter(|s| !s.is_empty())
            .find_map(|segment| {
                let segment = segment.to_lowercase();
                CATEGORY_SEGMENTS
                    .iter()
                    .find(|(name, _)| *name == segment)
                    .map(|(_, cat)| *cat)
            })
            .unwrap_or(Category::Misc)
    }

    pub fn classify(&self, rel: &str) -> Classification {
        Classification {
            semantic: self.semantic_type(rel),
            category: self.category(rel),
        }
    }

    /// The first exclusion rule matching `rel`, if any.
    pub fn exclusion(&self, rel: &str) -> Option<Exclusion> {
        let (dir, file) = split_key(rel);
        if let Some((raw, _)) = self
            .globs
            .iter()
            .find(|(_, p)| p.matches_with(file, GLOB_OPTIONS))
        {
            return Some(Exclusion::Glob(raw.clone()));
        }
        let dir = dir.to_lowercase();
        self.dir_patterns
            .iter()
            .find(|p| dir.contains(p.as_str()))
            .map(|p| Exclusion::Directory(p.clone()))
    }
}
