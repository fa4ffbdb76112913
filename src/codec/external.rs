//! Subprocess-backed collaborator tools.
//!
//! Each type here wraps one external program behind the traits in
//! [`backend`](super::backend):
//!
//! | Type | Program | Capability |
//! |---|---|---|
//! | [`BsArch`] | `bsarch` | extract `.bsa` / `.ba2` |
//! | [`SevenZip`] | `7z` / `7zz` / `7za` | extract `.7z` / `.zip` / `.rar` |
//! | [`MagickIdentify`] | `magick identify` / `identify` | dimensions |
//! | [`Texconv`] | `texconv` | resize + block compress (primary) |
//! | [`MagickConvert`] | `magick` / `convert` | resize + DXT compress (fallback) |
//!
//! Every invocation runs with `TMPDIR`/`TEMP`/`TMP` pointed at the pipeline's
//! work directory and is bounded by a timeout; a child that outlives it is
//! killed and reported as [`ToolError::Timeout`].

use super::backend::{Codec, Extractor, Identifier, ToolError};
use super::params::{Identified, TransformParams};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

/// Settings shared by every spawned tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Scratch root handed to children as their temp directory.
    pub work_dir: PathBuf,
    pub timeout: Duration,
}

/// A resolved program plus any fixed leading arguments
/// (`magick identify` is program `magick` with prefix `identify`).
#[derive(Debug, Clone)]
pub struct Program {
    pub path: PathBuf,
    pub prefix_args: Vec<String>,
}

impl Program {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix(path: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            path: path.into(),
            prefix_args: vec![prefix.to_string()],
        }
    }

    fn command(&self, ctx: &ToolContext) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.args(&self.prefix_args)
            .env("TMPDIR", &ctx.work_dir)
            .env("TEMP", &ctx.work_dir)
            .env("TMP", &ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

/// Run a prepared command to completion under the context's timeout.
///
/// Returns captured stdout when `capture` is set (the command must have been
/// configured with a piped stdout), otherwise an empty string.
fn run_tool(
    tool: &str,
    mut cmd: Command,
    ctx: &ToolContext,
    capture: bool,
) -> Result<String, ToolError> {
    debug!(tool, ?cmd, "spawning");
    let mut child = cmd.spawn()?;

    let status = match child.wait_timeout(ctx.timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ToolError::Timeout {
                tool: tool.to_string(),
                timeout: ctx.timeout,
            });
        }
    };

    if !status.success() {
        return Err(ToolError::ExitStatus {
            tool: tool.to_string(),
            code: status.code(),
        });
    }

    let mut stdout = String::new();
    if capture && let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout)?;
    }
    Ok(stdout)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

// =============================================================================
// Extractors
// =============================================================================

/// Bethesda archive extractor: `bsarch unpack <archive> <dest>`.
pub struct BsArch {
    program: Program,
    ctx: ToolContext,
}

impl BsArch {
    pub fn new(program: Program, ctx: ToolContext) -> Self {
        Self { program, ctx }
    }
}

impl Extractor for BsArch {
    fn name(&self) -> &str {
        "bsarch"
    }

    fn supports(&self, archive: &Path) -> bool {
        has_extension(archive, &["bsa", "ba2"])
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ToolError> {
        let mut cmd = self.program.command(&self.ctx);
        cmd.arg("unpack").arg(archive).arg(dest);
        run_tool(self.name(), cmd, &self.ctx, false).map(|_| ())
    }
}

/// General archive extractor: `7z x -y -o<dest> <archive>`.
pub struct SevenZip {
    program: Program,
    ctx: ToolContext,
}

impl SevenZip {
    pub fn new(program: Program, ctx: ToolContext) -> Self {
        Self { program, ctx }
    }
}

impl Extractor for SevenZip {
    fn name(&self) -> &str {
        "7z"
    }

    fn supports(&self, archive: &Path) -> bool {
        has_extension(archive, &["7z", "zip", "rar"])
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ToolError> {
        let mut cmd = self.program.command(&self.ctx);
        let mut out_flag = std::ffi::OsString::from("-o");
        out_flag.push(dest);
        cmd.arg("x").arg("-y").arg(out_flag).arg(archive);
        run_tool(self.name(), cmd, &self.ctx, false).map(|_| ())
    }
}

// =============================================================================
// Identifier
// =============================================================================

/// ImageMagick identify: prints `<width> <height> <format>` for the first frame.
pub struct MagickIdentify {
    program: Program,
    ctx: ToolContext,
}

impl MagickIdentify {
    pub fn new(program: Program, ctx: ToolContext) -> Self {
        Self { program, ctx }
    }
}

/// Parse `"<w> <h> <fmt>"` as printed by `identify -format "%w %h %m"`.
pub fn parse_identify_output(tool: &str, output: &str) -> Result<Identified, ToolError> {
    let parse_err = |detail: &str| ToolError::Parse {
        tool: tool.to_string(),
        detail: format!("{detail}: {:?}", output.trim()),
    };
    let mut fields = output.split_whitespace();
    let width: u32 = fields
        .next()
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| parse_err("missing width"))?;
    let height: u32 = fields
        .next()
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| parse_err("missing height"))?;
    if width == 0 || height == 0 {
        return Err(parse_err("zero dimension"));
    }
    Ok(Identified {
        width,
        height,
        format: fields.next().map(str::to_string),
    })
}

impl Identifier for MagickIdentify {
    fn name(&self) -> &str {
        "identify"
    }

    fn identify(&self, path: &Path) -> Result<Identified, ToolError> {
        let mut cmd = self.program.command(&self.ctx);
        // [0]: DDS files with mipmaps report one line per level otherwise
        let mut target = path.as_os_str().to_owned();
        target.push("[0]");
        cmd.arg("-format")
            .arg("%w %h %m")
            .arg(target)
            .stdout(Stdio::piped());
        let stdout = run_tool(self.name(), cmd, &self.ctx, true)?;
        parse_identify_output(self.name(), &stdout)
    }
}

// =============================================================================
// Codecs
// =============================================================================

/// DirectXTex `texconv`, the primary codec.
///
/// texconv names its output after the source stem inside `-o <dir>`, so the
/// result is renamed to `params.output` when the two differ.
pub struct Texconv {
    program: Program,
    ctx: ToolContext,
}

impl Texconv {
    pub fn new(program: Program, ctx: ToolContext) -> Self {
        Self { program, ctx }
    }
}

impl Codec for Texconv {
    fn name(&self) -> &str {
        "texconv"
    }

    fn transform(&self, params: &TransformParams) -> Result<(), ToolError> {
        let out_dir = params
            .output
            .parent()
            .ok_or_else(|| ToolError::Unsupported {
                tool: self.name().to_string(),
                path: params.output.clone(),
            })?;
        let mut cmd = self.program.command(&self.ctx);
        cmd.arg("-nologo")
            .arg("-y")
            .arg("-w")
            .arg(params.width.to_string())
            .arg("-h")
            .arg(params.height.to_string())
            .arg("-f")
            .arg(params.format.dxgi_name())
            .arg("-o")
            .arg(out_dir)
            .arg(&params.source);
        run_tool(self.name(), cmd, &self.ctx, false)?;

        let stem = params.source.file_stem().unwrap_or_default();
        let mut produced = out_dir.join(stem);
        produced.set_extension("dds");
        if produced != params.output && produced.exists() {
            std::fs::rename(&produced, &params.output)?;
        }
        Ok(())
    }
}

/// ImageMagick `magick`/`convert`, the fallback codec. Only writes the DXT
/// family; see [`TargetFormat::magick_compression`](super::TargetFormat::magick_compression).
pub struct MagickConvert {
    program: Program,
    ctx: ToolContext,
}

impl MagickConvert {
    pub fn new(program: Program, ctx: ToolContext) -> Self {
        Self { program, ctx }
    }
}

impl Codec for MagickConvert {
    fn name(&self) -> &str {
        "magick"
    }

    fn transform(&self, params: &TransformParams) -> Result<(), ToolError> {
        let mut cmd = self.program.command(&self.ctx);
        cmd.arg(&params.source)
            .arg("-resize")
            .arg(format!("{}x{}!", params.width, params.height))
            .arg("-define")
            .arg(format!(
                "dds:compression={}",
                params.format.magick_compression()
            ))
            .arg("-define")
            .arg("dds:mipmaps=auto")
            .arg(&params.output);
        run_tool(self.name(), cmd, &self.ctx, false).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(tmp: &TempDir) -> ToolContext {
        ToolContext {
            work_dir: tmp.path().to_path_buf(),
            timeout: Duration::from_secs(10),
        }
    }

    // =========================================================================
    // parse_identify_output tests
    // =========================================================================

    #[test]
    fn parse_identify_full_line() {
        let id = parse_identify_output("identify", "2048 1024 DDS\n").unwrap();
        assert_eq!((id.width, id.height), (2048, 1024));
        assert_eq!(id.format.as_deref(), Some("DDS"));
    }

    #[test]
    fn parse_identify_without_format() {
        let id = parse_identify_output("identify", "64 32").unwrap();
        assert_eq!((id.width, id.height), (64, 32));
        assert_eq!(id.format, None);
    }

    #[test]
    fn parse_identify_rejects_garbage() {
        assert!(matches!(
            parse_identify_output("identify", "identify: no decode delegate"),
            Err(ToolError::Parse { .. })
        ));
        assert!(parse_identify_output("identify", "").is_err());
        assert!(parse_identify_output("identify", "0 64 DDS").is_err());
    }

    // =========================================================================
    // supports tests
    // =========================================================================

    #[test]
    fn extractors_claim_their_extensions() {
        let tmp = TempDir::new().unwrap();
        let bsarch = BsArch::new(Program::new("bsarch"), ctx(&tmp));
        let seven = SevenZip::new(Program::new("7z"), ctx(&tmp));

        assert!(bsarch.supports(Path::new("Mod - Textures.BSA")));
        assert!(bsarch.supports(Path::new("Fallout4 - Textures1.ba2")));
        assert!(!bsarch.supports(Path::new("mod.7z")));

        assert!(seven.supports(Path::new("mod.7z")));
        assert!(seven.supports(Path::new("mod.ZIP")));
        assert!(seven.supports(Path::new("mod.rar")));
        assert!(!seven.supports(Path::new("mod.bsa")));
    }

    // =========================================================================
    // run_tool tests
    // =========================================================================

    #[test]
    fn missing_program_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let program = Program::new(tmp.path().join("definitely-not-a-tool"));
        let cmd = program.command(&ctx(&tmp));
        assert!(matches!(
            run_tool("ghost", cmd, &ctx(&tmp), false),
            Err(ToolError::Io(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_reported() {
        let tmp = TempDir::new().unwrap();
        let cmd = Program::new("false").command(&ctx(&tmp));
        assert!(matches!(
            run_tool("false", cmd, &ctx(&tmp), false),
            Err(ToolError::ExitStatus { code: Some(1), .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn stuck_tool_is_killed_on_timeout() {
        let tmp = TempDir::new().unwrap();
        let short = ToolContext {
            work_dir: tmp.path().to_path_buf(),
            timeout: Duration::from_millis(100),
        };
        let mut cmd = Program::new("sleep").command(&short);
        cmd.arg("5");
        let started = std::time::Instant::now();
        assert!(matches!(
            run_tool("sleep", cmd, &short, false),
            Err(ToolError::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn child_sees_work_dir_as_tmpdir() {
        let tmp = TempDir::new().unwrap();
        let mut cmd = Program::with_prefix("sh", "-c").command(&ctx(&tmp));
        cmd.arg("printf %s \"$TMPDIR\"").stdout(Stdio::piped());
        let out = run_tool("sh", cmd, &ctx(&tmp), true).unwrap();
        assert_eq!(out, tmp.path().to_string_lossy());
    }
}
