//! Collaborator tool resolution.
//!
//! Runs once at startup and turns `[tools]` config plus `PATH` into a typed
//! [`Toolset`]. Explicit config paths win over `PATH` probing. A missing
//! extractor, identifier or codec is fatal: the pipeline cannot produce a
//! trustworthy result without all three.
//!
//! | Role | Candidates, in order |
//! |---|---|
//! | Extractor | `bsarch` (BSA/BA2) and `7z` / `7zz` / `7za` (7z/zip/rar) |
//! | Identifier | `magick identify`, `identify` |
//! | Codec | `texconv`, then `magick` / `convert` as fallback |

use crate::codec::Toolset;
use crate::codec::external::{
    BsArch, MagickConvert, MagickIdentify, Program, SevenZip, Texconv, ToolContext,
};
use crate::config::ToolsConfig;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no archive extractor found (tried bsarch, 7z, 7zz, 7za)")]
    NoExtractor,
    #[error("no image identify tool found (tried magick, identify)")]
    NoIdentifier,
    #[error("no texture codec found (tried texconv, magick, convert)")]
    NoCodec,
    #[error("configured tool {tool} does not exist: {path}")]
    ConfiguredMissing { tool: &'static str, path: PathBuf },
}

/// Search a `PATH`-style list for an executable.
fn find_in(path_var: &OsStr, binary: &str) -> Option<PathBuf> {
    env::split_paths(path_var)
        .flat_map(|entry| {
            let exe = entry.join(format!("{binary}.exe"));
            [entry.join(binary), exe]
        })
        .find(|candidate| candidate.is_file())
}

pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    find_in(&path, binary)
}

fn configured(tool: &'static str, path: &Option<PathBuf>) -> Result<Option<PathBuf>, ResolveError> {
    match path {
        Some(p) if p.exists() => Ok(Some(p.clone())),
        Some(p) => Err(ResolveError::ConfiguredMissing {
            tool,
            path: p.clone(),
        }),
        None => Ok(None),
    }
}

fn is_magick(path: &Path) -> bool {
    path.file_stem()
        .map(|s| s.eq_ignore_ascii_case("magick"))
        .unwrap_or(false)
}

/// Resolve every collaborator tool, probing the process `PATH`.
pub fn resolve_toolset(config: &ToolsConfig, ctx: &ToolContext) -> Result<Toolset, ResolveError> {
    resolve_toolset_with(config, ctx, find_in_path)
}

/// Resolve every collaborator tool with a custom lookup for unconfigured ones.
pub fn resolve_toolset_with(
    config: &ToolsConfig,
    ctx: &ToolContext,
    lookup: impl Fn(&str) -> Option<PathBuf>,
) -> Result<Toolset, ResolveError> {
    let first_found = |names: &[&str]| names.iter().find_map(|&n| lookup(n));

    // Extractors
    let mut extractors: Vec<Box<dyn crate::codec::Extractor>> = Vec::new();
    let bsarch = match configured("bsarch", &config.bsarch)? {
        Some(p) => Some(p),
        None => lookup("bsarch"),
    };
    if let Some(path) = bsarch {
        info!(tool = "bsarch", path = %path.display(), "resolved extractor");
        extractors.push(Box::new(BsArch::new(Program::new(path), ctx.clone())));
    }
    let seven = match configured("seven_zip", &config.seven_zip)? {
        Some(p) => Some(p),
        None => first_found(&["7z", "7zz", "7za"]),
    };
    if let Some(path) = seven {
        info!(tool = "7z", path = %path.display(), "resolved extractor");
        extractors.push(Box::new(SevenZip::new(Program::new(path), ctx.clone())));
    }
    match extractors.len() {
        0 => return Err(ResolveError::NoExtractor),
        1 => warn!(
            only = extractors[0].name(),
            "only one archive extractor available; other archive types will fail to extract"
        ),
        _ => {}
    }

    // Identifier
    let identify_program = match configured("identify", &config.identify)? {
        Some(p) if is_magick(&p) => Program::with_prefix(p, "identify"),
        Some(p) => Program::new(p),
        None => match lookup("magick") {
            Some(p) => Program::with_prefix(p, "identify"),
            None => Program::new(lookup("identify").ok_or(ResolveError::NoIdentifier)?),
        },
    };
    info!(tool = "identify", path = %identify_program.path.display(), "resolved identifier");
    let identifier = MagickIdentify::new(identify_program, ctx.clone());

    // Codecs, primary first
    let mut codecs: Vec<Box<dyn crate::codec::Codec>> = Vec::new();
    let texconv = match configured("texconv", &config.texconv)? {
        Some(p) => Some(p),
        None => lookup("texconv"),
    };
    if let Some(path) = texconv {
        info!(tool = "texconv", path = %path.display(), "resolved codec");
        codecs.push(Box::new(Texconv::new(Program::new(path), ctx.clone())));
    }
    let magick = match configured("magick", &config.magick)? {
        Some(p) => Some(p),
        None => first_found(&["magick", "convert"]),
    };
    if let Some(path) = magick {
        info!(tool = "magick", path = %path.display(), "resolved codec");
        codecs.push(Box::new(MagickConvert::new(Program::new(path), ctx.clone())));
    }
    match codecs.len() {
        0 => return Err(ResolveError::NoCodec),
        1 => warn!(
            only = codecs[0].name(),
            "no fallback codec available; failed conversions will not be retried"
        ),
        _ => {}
    }

    Ok(Toolset {
        extractors,
        identifier: Some(Box::new(identifier)),
        codecs,
    })
}
