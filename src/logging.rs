//! Log file setup.
//!
//! One `tracing` subscriber fans out to several files under the log directory:
//!
//! ```text
//! logfiles/
//! ├── pipeline.log     # every event from the crate
//! ├── sources.log      # texsquash::sources
//! ├── merge.log        # texsquash::merge
//! ├── analyze.log      # texsquash::classify + texsquash::analyze
//! ├── plan.log         # texsquash::plan
//! ├── execute.log      # texsquash::execute
//! └── finalize.log     # texsquash::finalize
//! ```
//!
//! Stage files are selected by the module path each event is emitted from, so
//! stage code just uses the plain `tracing` macros. The console gets warnings
//! and errors (info with `--verbose`, or whatever `RUST_LOG` asks for).

use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Combined log receiving every event.
pub const PIPELINE_LOG: &str = "pipeline.log";

/// Per-stage log files and the module targets each one receives.
pub const STAGE_LOGS: &[(&str, &[&str])] = &[
    ("sources.log", &["texsquash::sources", "texsquash::tools"]),
    ("merge.log", &["texsquash::merge"]),
    ("analyze.log", &["texsquash::classify", "texsquash::analyze"]),
    ("plan.log", &["texsquash::plan"]),
    ("execute.log", &["texsquash::execute"]),
    ("finalize.log", &["texsquash::finalize"]),
];

/// Keeps the non-blocking writers flushing. Hold until the run ends.
#[must_use]
pub struct LogGuards(Vec<WorkerGuard>);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn file_layer(log_dir: &Path, file: &str, filter: Targets, guards: &mut Vec<WorkerGuard>) -> BoxedLayer {
    let (writer, guard) = tracing_appender::non_blocking(rolling::never(log_dir, file));
    guards.push(guard);
    fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_filter(filter)
        .boxed()
}

/// Install the global subscriber.
///
/// File logs record INFO and above, DEBUG with `verbose`.
pub fn init_logging(log_dir: &Path, verbose: bool) -> Result<LogGuards, LoggingError> {
    fs::create_dir_all(log_dir)?;

    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    layers.push(file_layer(
        log_dir,
        PIPELINE_LOG,
        Targets::new()
            .with_target("texsquash", level)
            .with_default(LevelFilter::WARN),
        &mut guards,
    ));

    for (file, targets) in STAGE_LOGS {
        let filter = Targets::new().with_targets(targets.iter().map(|t| (*t, level)));
        layers.push(file_layer(log_dir, file, filter, &mut guards));
    }

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));
    layers.push(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter)
            .boxed(),
    );

    tracing_subscriber::registry().with(layers).try_init()?;

    tracing::info!(
        log_dir = %log_dir.display(),
        verbose,
        "logging initialized"
    );
    Ok(LogGuards(guards))
}
