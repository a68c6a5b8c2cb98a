//! Run context: the single print lock and the persistent run log.
//!
//! Every user-facing line of a run (fixture progress, heartbeat notices,
//! reports and the final summary) goes through [`RunContext::emit`], which
//! writes it to stderr and appends it to `testrig.log` under one mutex so
//! concurrent workers never interleave within a line.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// File name of the run transcript inside the cache directory.
pub const RUN_LOG_FILENAME: &str = "testrig.log";

/// Errors raised while opening the run context.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContextError {
    /// The run log could not be created.
    #[error("failed to create run log {}: {source}", path.display())]
    CreateLog {
        /// Run log path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Shared output sink for one scheduler invocation.
#[derive(Debug)]
pub struct RunContext {
    sink: Mutex<Sink>,
    verbose: bool,
    log_path: Option<PathBuf>,
}

#[derive(Debug)]
struct Sink {
    log: Option<File>,
    echo: bool,
}

impl RunContext {
    /// Create (truncating) the run log at `log_path` and echo to stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::CreateLog`] if the file cannot be created.
    pub fn open(log_path: &Path, verbose: bool) -> Result<Self, ContextError> {
        let log = File::create(log_path).map_err(|source| ContextError::CreateLog {
            path: log_path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            sink: Mutex::new(Sink {
                log: Some(log),
                echo: true,
            }),
            verbose,
            log_path: Some(log_path.to_path_buf()),
        })
    }

    /// A context that only writes to the run log, without echoing to
    /// stderr. Used by tests and by callers that render output themselves.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::CreateLog`] if the file cannot be created.
    pub fn quiet(log_path: &Path, verbose: bool) -> Result<Self, ContextError> {
        let ctx = Self::open(log_path, verbose)?;
        ctx.lock_sink().echo = false;
        Ok(ctx)
    }

    /// Whether verbose output was requested.
    #[must_use]
    pub const fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Path of the run log, if one is attached.
    #[must_use]
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Emit one line (a trailing newline is added).
    pub fn emit(&self, line: &str) {
        let mut text = String::with_capacity(line.len() + 1);
        text.push_str(line);
        text.push('\n');
        self.write_locked(&text);
    }

    /// Emit a multi-line block atomically with respect to other emitters.
    pub fn emit_block(&self, block: &str) {
        if block.ends_with('\n') {
            self.write_locked(block);
        } else {
            self.emit(block);
        }
    }

    fn write_locked(&self, text: &str) {
        let mut sink = self.lock_sink();
        if sink.echo {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(text.as_bytes());
            let _ = stderr.flush();
        }
        if let Some(log) = sink.log.as_mut() {
            if let Err(err) = log.write_all(text.as_bytes()).and_then(|()| log.flush()) {
                tracing::warn!(err = %err, "failed to append to run log");
            }
        }
    }

    fn lock_sink(&self) -> std::sync::MutexGuard<'_, Sink> {
        // A panic while printing leaves the sink usable.
        self.sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
