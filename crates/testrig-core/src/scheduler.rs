//! Job scheduling: runs the selected tests and aggregates the summary.
//!
//! Per test, the "old" and then the "new" variant each go through
//! `setup -> install base -> install variant -> run -> parse -> teardown`
//! in a fresh [`Fixture`], and the two parse results are classified.
//!
//! Every invocation first claims `<cache>/lock` without blocking, and only
//! then touches `testrig.log` or `summary.json`. With one job everything
//! runs on the calling thread in `<cache>/`. With more jobs every test gets
//! its own root `<cache>/jobs/<test>/`, locked by the worker that runs it;
//! repository mirrors and the download cache stay shared in `<cache>/`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Duration;
use std::{fmt, thread};

use thiserror::Error;

use crate::buildenv::{BuildEnv, CCACHE_MISSING_WARNING};
use crate::catalog::TestSpec;
use crate::classify::{ClassificationResult, ReportOptions, classify, rule};
use crate::context::{ContextError, RUN_LOG_FILENAME, RunContext};
use crate::fixture::{Fixture, FixtureConfig, FixtureError, PrintLevel, SharedCaches, Toolchain};
use crate::heartbeat::{DEFAULT_INTERVAL, DEFAULT_THRESHOLD, HeartbeatMonitor};
use crate::lock::{LockError, LockGuard, ResourceLock};
use crate::parser::ParseResult;
use crate::summary::{RunSummary, SummaryEntry};

/// Default cache directory, relative to the working directory.
pub const DEFAULT_CACHE_DIR: &str = "cache";

/// Directory holding per-test roots in parallel runs.
pub const JOBS_DIR: &str = "jobs";

/// Lock file claiming a cache root.
pub const ROOT_LOCK_FILENAME: &str = "lock";

/// Errors that stop a whole invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// The cache directory could not be prepared.
    #[error("failed to prepare cache directory {}: {source}", path.display())]
    CacheDir {
        /// Cache directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The run log could not be opened.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The cache root is held by another process.
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Knobs of one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Root of all caches, logs and environments.
    pub cache_dir: PathBuf,
    /// Remove private directories after each variant.
    pub cleanup: bool,
    /// Clone through shared repository mirrors.
    pub git_cache: bool,
    /// Echo commands and report pre-existing/resolved failures and new
    /// warnings.
    pub verbose: bool,
    /// Worker count; `0` picks one from the available parallelism.
    pub jobs: usize,
    /// Heartbeat wake-up period.
    pub heartbeat_interval: Duration,
    /// Minimum time between heartbeat checks.
    pub heartbeat_threshold: Duration,
    /// Upper bound for every subprocess.
    pub command_timeout: Option<Duration>,
    /// Extra environment for subprocesses.
    pub build_env: BuildEnv,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cleanup: true,
            git_cache: true,
            verbose: false,
            jobs: 1,
            heartbeat_interval: DEFAULT_INTERVAL,
            heartbeat_threshold: DEFAULT_THRESHOLD,
            command_timeout: None,
            build_env: BuildEnv::default(),
        }
    }
}

/// Map a requested job count to a worker count: `0` means one less than
/// the available parallelism, never below one.
#[must_use]
pub fn resolve_jobs(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    thread::available_parallelism()
        .map_or(1, |n| n.get().saturating_sub(1))
        .max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Old,
    New,
}

impl Variant {
    fn specs(self, test: &TestSpec) -> &[String] {
        match self {
            Self::Old => &test.old,
            Self::New => &test.new,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Old => write!(f, "old"),
            Self::New => write!(f, "new"),
        }
    }
}

/// Runs tests against a toolchain.
#[derive(Debug)]
pub struct JobScheduler<'a> {
    options: RunOptions,
    toolchain: &'a dyn Toolchain,
}

impl<'a> JobScheduler<'a> {
    /// Scheduler for `options`.
    #[must_use]
    pub const fn new(options: RunOptions, toolchain: &'a dyn Toolchain) -> Self {
        Self { options, toolchain }
    }

    /// Options in effect.
    #[must_use]
    pub const fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run `tests`, echoing progress to stderr and `<cache>/testrig.log`.
    ///
    /// # Errors
    ///
    /// Fails when the cache directory or run log cannot be created, or
    /// when another process holds the cache root. Individual test problems
    /// are reported in the summary instead.
    pub fn run(&self, tests: &[&TestSpec]) -> Result<RunSummary, SchedulerError> {
        let cache_dir = self.cache_dir()?;
        let _root = claim_root(&cache_dir)?;
        let ctx = RunContext::open(&cache_dir.join(RUN_LOG_FILENAME), self.options.verbose)?;
        Ok(self.execute(tests, &cache_dir, &Arc::new(ctx)))
    }

    /// As [`JobScheduler::run`], with output going to `ctx`.
    ///
    /// # Errors
    ///
    /// See [`JobScheduler::run`].
    pub fn run_with_context(
        &self,
        tests: &[&TestSpec],
        ctx: Arc<RunContext>,
    ) -> Result<RunSummary, SchedulerError> {
        let cache_dir = self.cache_dir()?;
        let _root = claim_root(&cache_dir)?;
        Ok(self.execute(tests, &cache_dir, &ctx))
    }

    /// Body of a run; the caller holds the cache root.
    fn execute(&self, tests: &[&TestSpec], cache_dir: &Path, ctx: &Arc<RunContext>) -> RunSummary {
        if !self.options.build_env.has_ccache() {
            ctx.emit(CCACHE_MISSING_WARNING);
        }

        let jobs = resolve_jobs(self.options.jobs);
        tracing::info!(tests = tests.len(), jobs, cache = %cache_dir.display(), "starting run");
        let entries = if jobs <= 1 {
            self.run_sequential(tests, cache_dir, ctx)
        } else {
            self.run_parallel(tests, cache_dir, ctx, jobs)
        };

        let summary = RunSummary::new(entries);
        ctx.emit_block(&format!("\n{}", summary.render()));
        if let Err(err) = summary.write_json(cache_dir) {
            tracing::warn!(err = %err, "failed to export summary");
        }
        summary
    }

    fn cache_dir(&self) -> Result<PathBuf, SchedulerError> {
        let io_err = |source| SchedulerError::CacheDir {
            path: self.options.cache_dir.clone(),
            source,
        };
        fs::create_dir_all(&self.options.cache_dir).map_err(io_err)?;
        std::path::absolute(&self.options.cache_dir).map_err(io_err)
    }

    fn fixture_config(&self, root: PathBuf, cache_dir: &Path) -> FixtureConfig {
        FixtureConfig {
            cache_root: root,
            shared: SharedCaches::under(cache_dir),
            cleanup: self.options.cleanup,
            git_cache: self.options.git_cache,
            command_timeout: self.options.command_timeout,
            build_env: self.options.build_env.clone(),
        }
    }

    fn monitor(&self, ctx: &Arc<RunContext>) -> HeartbeatMonitor {
        HeartbeatMonitor::new(Arc::clone(ctx))
            .with_timing(self.options.heartbeat_interval, self.options.heartbeat_threshold)
    }

    fn run_sequential(
        &self,
        tests: &[&TestSpec],
        cache_dir: &Path,
        ctx: &Arc<RunContext>,
    ) -> Vec<SummaryEntry> {
        let config = self.fixture_config(cache_dir.to_path_buf(), cache_dir);
        let monitor = self.monitor(ctx);
        monitor.start();

        let entries = tests
            .iter()
            .map(|test| self.run_test(test, &config, ctx, &monitor))
            .collect();

        monitor.stop();
        entries
    }

    fn run_parallel(
        &self,
        tests: &[&TestSpec],
        cache_dir: &Path,
        ctx: &Arc<RunContext>,
        jobs: usize,
    ) -> Vec<SummaryEntry> {
        let queue = Mutex::new(tests.iter().enumerate());
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..jobs.min(tests.len()) {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                        let Some((idx, test)) = next else {
                            break;
                        };
                        let entry = self.run_job(test, cache_dir, ctx);
                        if tx.send((idx, entry)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<SummaryEntry>> = vec![None; tests.len()];
        for (idx, entry) in rx {
            slots[idx] = Some(entry);
        }
        slots
            .into_iter()
            .zip(tests)
            .map(|(slot, test)| {
                slot.unwrap_or_else(|| {
                    SummaryEntry::from_result(
                        &test.name,
                        &ClassificationResult::error("worker did not report"),
                    )
                })
            })
            .collect()
    }

    fn run_job(&self, test: &TestSpec, cache_dir: &Path, ctx: &Arc<RunContext>) -> SummaryEntry {
        let root = cache_dir.join(JOBS_DIR).join(&test.name);
        let claimed = fs::create_dir_all(&root)
            .map_err(|source| LockError::Io {
                path: root.clone(),
                source,
            })
            .and_then(|()| ResourceLock::new(root.join(ROOT_LOCK_FILENAME)).try_acquire());
        let _guard = match claimed {
            Ok(guard) => guard,
            Err(err) => {
                let text = format!("{}: cannot claim job directory: {err}", test.name);
                ctx.emit(&text);
                return SummaryEntry::from_result(&test.name, &ClassificationResult::error(text));
            },
        };

        let config = self.fixture_config(root, cache_dir);
        let monitor = self.monitor(ctx).with_label(&test.name);
        monitor.start();
        let entry = self.run_test(test, &config, ctx, &monitor);
        monitor.stop();
        entry
    }

    fn run_test(
        &self,
        test: &TestSpec,
        config: &FixtureConfig,
        ctx: &RunContext,
        monitor: &HeartbeatMonitor,
    ) -> SummaryEntry {
        let rule = rule();
        ctx.emit_block(&format!("{rule}\n{}: running\n{rule}\n", test.name));
        tracing::info!(test = %test.name, "test started");

        let result = match self.run_variant(test, Variant::Old, config, ctx, monitor) {
            Err(text) => ClassificationResult::error(text),
            Ok(old) => match self.run_variant(test, Variant::New, config, ctx, monitor) {
                Err(text) => ClassificationResult::error(text),
                Ok(new) => classify(
                    &test.name,
                    &old,
                    &new,
                    ReportOptions {
                        verbose: self.options.verbose,
                    },
                ),
            },
        };

        if !result.report_text.is_empty() {
            ctx.emit_block(&result.report_text);
        }
        tracing::info!(test = %test.name, verdict = %result.verdict, "test finished");
        SummaryEntry::from_result(&test.name, &result)
    }

    /// One variant of one test. `Err` carries the report text of an
    /// infrastructure failure; an unusable transcript is a fatal
    /// [`ParseResult`] instead.
    fn run_variant(
        &self,
        test: &TestSpec,
        variant: Variant,
        config: &FixtureConfig,
        ctx: &RunContext,
        monitor: &HeartbeatMonitor,
    ) -> Result<ParseResult, String> {
        let build_log = config
            .cache_root
            .join(format!("{}-build-{variant}.log", test.name));
        let test_log = config
            .cache_root
            .join(format!("{}-test-{variant}.log", test.name));
        let failed = |stage: &str, err: &dyn fmt::Display| {
            format!("{}: {variant} {stage} failed: {err}", test.name)
        };

        let mut fixture = Fixture::new(config, self.toolchain, ctx, &build_log)
            .map_err(|err| failed("setup", &err))?;
        fixture.print(
            &format!("Logging into: {}", build_log.display()),
            PrintLevel::Normal,
        );

        monitor.set_target(&build_log);
        let provisioned = provision(&mut fixture, test, variant);
        monitor.clear_target();
        if let Err(err) = provisioned {
            ctx.emit_block(&read_lossy(&build_log));
            let text = failed("build", &err);
            ctx.emit(&text);
            return Err(text);
        }

        fixture.print(
            &format!("Logging into: {}", test_log.display()),
            PrintLevel::Normal,
        );
        let transcript = File::create(&test_log).map_err(|err| failed("test", &err))?;
        monitor.set_target(&test_log);
        let ran = fixture.run_test_command(&test.run, &transcript);
        monitor.clear_target();
        drop(transcript);
        ran.map_err(|err| failed("test", &err))?;

        let data = read_lossy(&test_log);
        let parsed = test.dialect.parse(&data, &fixture.env_dir());
        if let Some(reason) = parsed.fatal_error() {
            ctx.emit(&format!("ERROR: failed to parse test output ({reason})"));
            ctx.emit_block(&data);
        }

        if let Err(err) = fixture.teardown() {
            tracing::warn!(test = %test.name, err = %err, "teardown failed");
        }
        Ok(parsed)
    }
}

fn claim_root(cache_dir: &Path) -> Result<LockGuard, SchedulerError> {
    let guard = ResourceLock::new(cache_dir.join(ROOT_LOCK_FILENAME)).try_acquire()?;
    tracing::debug!(path = %guard.path().display(), "cache root claimed");
    Ok(guard)
}

fn provision(fixture: &mut Fixture<'_>, test: &TestSpec, variant: Variant) -> Result<(), FixtureError> {
    fixture.setup()?;
    fixture.install_spec(&test.base)?;
    fixture.install_spec(variant.specs(test))
}

fn read_lossy(path: &Path) -> String {
    fs::read(path).map_or_else(
        |err| {
            tracing::warn!(path = %path.display(), err = %err, "failed to read log");
            String::new()
        },
        |bytes| String::from_utf8_lossy(&bytes).into_owned(),
    )
}
