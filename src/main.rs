use clap::{Parser, Subcommand};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use texsquash::config::{self, Overrides, PipelineConfig, PresetName};
use texsquash::pipeline::{Pipeline, tool_context};
use texsquash::pool::CancelToken;
use texsquash::{logging, output, tools};
use tracing::error;

#[derive(Parser)]
#[command(name = "texsquash")]
#[command(about = "Merge mod textures in load order and shrink them to a VRAM preset")]
#[command(long_about = "\
Merge mod textures in load order and shrink them to a VRAM preset

Every mod's loose textures and texture archives are overlaid into one tree,
highest priority last. Each texture is classified from its path, measured,
and resized/recompressed when it exceeds the preset budget for its type.

Install layout:

  <game-dir>/Data/                 # Base game, lowest priority
  <mods-dir>/
  ├── modlist.txt                  # +Enabled / -Disabled, last line wins
  ├── Better Rocks/
  │   ├── textures/rock_d.dds      # Loose texture
  │   └── Better Rocks.bsa         # Archive, extracted before merging
  └── ...

Pipeline:

  sources → merge → analyze → plan → transform → finalize

Every stage after the merge reads the state store in <output-dir>, so the
stage commands can be run one at a time and an interrupted run resumed.

Run 'texsquash gen-config' to generate a documented texsquash.toml.")]
#[command(version)]
struct Cli {
    /// Config file (default: ./texsquash.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Game install directory (contains Data/)
    #[arg(long, global = true)]
    game_dir: Option<PathBuf>,

    /// Directory holding one subdirectory per mod
    #[arg(long, global = true)]
    mods_dir: Option<PathBuf>,

    /// Merge target; renamed to the final directory when done
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Load-order file (default: <mods-dir>/modlist.txt)
    #[arg(long, global = true)]
    load_order: Option<PathBuf>,

    /// VRAM preset
    #[arg(long, value_enum, global = true)]
    preset: Option<PresetName>,

    /// Worker threads for analysis and transformation (capped at core count)
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Scratch directory handed to external tools
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Directory for per-stage log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Echo debug logging to the console
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the full pipeline: merge → analyze → plan → transform → finalize
    Run,
    /// Print the resolved source units in priority order
    Sources,
    /// Merge every source unit into the output directory
    Merge,
    /// Classify and measure merged textures
    Analyze,
    /// Decide keep/resize per texture against the preset
    Plan,
    /// Resize the textures planned for it
    Transform,
    /// Quality-check the output, then package it with a summary
    Finalize,
    /// Show asset counts by lifecycle status
    Status,
    /// Print a stock texsquash.toml with all options documented
    GenConfig,
}

impl Command {
    fn needs_sources(self) -> bool {
        matches!(self, Command::Run | Command::Sources | Command::Merge)
    }
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            game_dir: self.game_dir.clone(),
            mods_dir: self.mods_dir.clone(),
            output_dir: self.output_dir.clone(),
            load_order: self.load_order.clone(),
            work_dir: self.work_dir.clone(),
            log_dir: self.log_dir.clone(),
            preset: self.preset,
            threads: self.threads,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.command == Command::GenConfig {
        print!("{}", config::stock_config_toml());
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cwd = std::env::current_dir()?;
    let mut config =
        config::load_config(cli.config.as_deref(), &cwd)?.with_overrides(&cli.overrides())?;
    prompt_missing_paths(&mut config, cli.command)?;

    let _guards = logging::init_logging(&config.paths.log_dir, cli.verbose)?;
    let cancel = CancelToken::new();
    cancel.install_ctrlc()?;

    let pipeline = Pipeline::new(&config, cancel);
    let result = dispatch(cli.command, &pipeline);
    if let Err(e) = &result {
        error!("{e}");
    }
    result
}

fn dispatch(command: Command, pipeline: &Pipeline<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = pipeline.config();
    let resolve_tools = || tools::resolve_toolset(&settings.tools, &tool_context(settings));

    match command {
        Command::Sources => {
            output::print_sources(&pipeline.sources()?);
        }
        Command::Status => {
            let store = pipeline.open_store()?;
            output::print_status(&store.status_counts());
        }
        Command::Plan => {
            let store = pipeline.open_store()?;
            output::print_plan(&pipeline.plan(&store)?);
        }
        Command::Run => {
            let tools = resolve_tools()?;
            println!("==> Sources");
            output::print_sources(&pipeline.sources()?);
            let report = pipeline.run(&tools)?;
            println!("==> Merge");
            output::print_merge(&report.merge);
            println!("==> Analyze");
            output::print_analyze(&report.analyze);
            println!("==> Plan");
            output::print_plan(&report.plan);
            println!("==> Transform");
            output::print_execute(&report.execute);
            println!("==> Quality");
            output::print_qc(&report.qc);
            println!("==> Done: {}", report.final_dir.display());
            output::print_summary(&report.summary);
        }
        Command::Merge => {
            let tools = resolve_tools()?;
            let (report, _store) = pipeline.merge(&tools)?;
            output::print_merge(&report);
        }
        Command::Analyze => {
            let tools = resolve_tools()?;
            let store = pipeline.open_store()?;
            output::print_analyze(&pipeline.analyze(&store, &tools)?);
        }
        Command::Transform => {
            let tools = resolve_tools()?;
            let store = pipeline.open_store()?;
            output::print_execute(&pipeline.transform(&store, &tools)?);
        }
        Command::Finalize => {
            let tools = resolve_tools()?;
            let store = pipeline.open_store()?;
            output::print_qc(&pipeline.quality(&store, &tools)?);
            let (summary, final_dir) = pipeline.finalize(store)?;
            println!("==> Done: {}", final_dir.display());
            output::print_summary(&summary);
        }
        Command::GenConfig => print!("{}", config::stock_config_toml()),
    }

    Ok(())
}

/// Ask for required directories the config and flags left unset.
///
/// Only when stdin is a terminal; otherwise the stage reports the missing path.
/// A supplied directory that doesn't exist is fatal either way.
fn prompt_missing_paths(
    config: &mut PipelineConfig,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    let interactive = std::io::stdin().is_terminal();
    let paths = &mut config.paths;

    if command.needs_sources() {
        for (slot, label) in [
            (&mut paths.game_dir, "Game directory"),
            (&mut paths.mods_dir, "Mods directory"),
        ] {
            if slot.is_none() && interactive {
                *slot = Some(prompt_path(label)?);
            }
            if let Some(dir) = slot.as_deref() {
                require_dir(dir, label)?;
            }
        }
    }
    if command != Command::Sources && paths.output_dir.is_none() && interactive {
        paths.output_dir = Some(prompt_path("Output directory")?);
    }
    Ok(())
}

fn prompt_path(label: &str) -> Result<PathBuf, std::io::Error> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{label}: ")?;
    stdout.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(PathBuf::from(line.trim()))
}

fn require_dir(dir: &Path, label: &str) -> Result<(), String> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(format!("{label} is not a directory: {}", dir.display()))
    }
}
