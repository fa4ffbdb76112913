//! Bounded worker pools and cooperative cancellation.
//!
//! Each parallel stage (extraction, analysis, transformation) gets its own
//! [`StagePool`], sized independently. A pool maps a closure over a slice of
//! independent work items and returns the results in input order, so callers
//! fold outcomes deterministically no matter how the workers interleaved.
//!
//! A panicking worker does not tear down the process: the panic is caught,
//! the remaining items still run, and the whole map reports
//! [`PoolError::WorkerPanicked`]. The analyzer uses that as its signal to retry
//! single-threaded.
//!
//! [`CancelToken`] is checked before each item starts. Items already running
//! finish normally; items not yet started come back as `None`.

use indicatif::ProgressBar;
use rayon::prelude::*;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to build {stage} pool: {source}")]
    Build {
        stage: &'static str,
        source: rayon::ThreadPoolBuildError,
    },
    #[error("{stage} worker panicked: {message}")]
    WorkerPanicked {
        stage: &'static str,
        message: String,
    },
}

/// Shared stop flag, set by Ctrl-C.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancel this token on SIGINT / Ctrl-C. Can only be installed once per process.
    pub fn install_ctrlc(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            eprintln!("Interrupt received; finishing running jobs...");
            token.cancel();
        })
    }
}

/// A dedicated rayon pool for one pipeline stage.
pub struct StagePool {
    stage: &'static str,
    threads: usize,
    pool: rayon::ThreadPool,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl StagePool {
    pub fn new(stage: &'static str, threads: usize) -> Result<Self, PoolError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{stage}-{i}"))
            .build()
            .map_err(|source| PoolError::Build { stage, source })?;
        debug!(stage, threads, "worker pool ready");
        Ok(Self {
            stage,
            threads,
            pool,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Run `f` over every item on this pool.
    ///
    /// Results are in input order; `None` marks an item skipped because of
    /// cancellation.
    pub fn map<T, R, F>(
        &self,
        items: &[T],
        cancel: &CancelToken,
        progress: &ProgressBar,
        f: F,
    ) -> Result<Vec<Option<R>>, PoolError>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        let results: Vec<Option<Result<R, String>>> = self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let outcome = catch_unwind(AssertUnwindSafe(|| f(item)))
                        .map_err(|payload| panic_message(payload.as_ref()));
                    progress.inc(1);
                    Some(outcome)
                })
                .collect()
        });

        let mut out = Vec::with_capacity(results.len());
        let mut first_panic = None;
        for result in results {
            match result {
                Some(Ok(value)) => out.push(Some(value)),
                Some(Err(message)) => {
                    error!(stage = self.stage, %message, "worker panicked");
                    first_panic.get_or_insert(message);
                    out.push(None);
                }
                None => out.push(None),
            }
        }
        match first_panic {
            Some(message) => Err(PoolError::WorkerPanicked {
                stage: self.stage,
                message,
            }),
            None => Ok(out),
        }
    }
}
