//! Fixture lifecycle: one disposable environment per (test, variant) run.
//!
//! ```text
//! uninitialized --setup--> provisioned --install_spec*--> provisioned
//!       provisioned --run_test_command--> executed --teardown--> torn-down
//! ```
//!
//! A fixture owns `env/`, `code/` and `build/` below its cache root. The
//! repository mirrors and the download cache are shared between fixtures
//! (and processes) and are only mutated under a [`ResourceLock`]; teardown
//! never touches them.
//!
//! The download-cache lock is held for a whole batched install, build
//! included, so package installs from concurrent fixtures run one at a time.

pub mod command;
pub mod spec;
pub mod toolchain;

use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub use self::command::{ChildGuard, CommandSpec, Completion, run_logged, shell_quote};
pub use self::spec::{DEFAULT_BRANCH, InstallPlan, VcsSource};
pub use self::toolchain::{PythonToolchain, Toolchain};
use crate::buildenv::BuildEnv;
use crate::context::RunContext;
use crate::lock::{LockError, ResourceLock};

/// Environment directory name below a cache root.
pub const ENV_DIR: &str = "env";
/// Source checkout directory name below a cache root.
pub const CODE_DIR: &str = "code";
/// Scratch build directory name below a cache root.
pub const BUILD_DIR: &str = "build";
/// Shared repository mirror directory name.
pub const GIT_CACHE_DIR: &str = "git-cache";
/// Shared package download cache directory name.
pub const DOWNLOAD_CACHE_DIR: &str = "download-cache";

/// Errors that abort a fixture phase.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FixtureError {
    /// Filesystem operation on a fixture directory failed.
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        /// What was attempted.
        action: &'static str,
        /// Path concerned.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The subprocess could not be started or waited for.
    #[error("failed to start {command}: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The subprocess exited unsuccessfully.
    #[error("failed to run {command} ({status}); see {}", log.display())]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Build log holding the command output.
        log: PathBuf,
    },

    /// The subprocess exceeded the configured timeout and was killed.
    #[error("{command} timed out after {}s; see {}", timeout.as_secs(), log.display())]
    Timeout {
        /// Rendered command line.
        command: String,
        /// Configured limit.
        timeout: Duration,
        /// Build log holding the command output.
        log: PathBuf,
    },

    /// A shared cache lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A `git+` specifier without a usable module name.
    #[error("invalid install specifier '{0}'")]
    InvalidSpec(String),

    /// An operation was called in the wrong lifecycle state.
    #[error("fixture is {actual}, cannot {operation}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// Current state.
        actual: FixtureState,
    },
}

impl FixtureError {
    fn io<'p>(action: &'static str, path: &'p Path) -> impl FnOnce(io::Error) -> Self + 'p {
        move |source| Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Caches shared by every fixture of a run, and by concurrent runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCaches {
    git_cache_dir: PathBuf,
    download_dir: PathBuf,
}

impl SharedCaches {
    /// The standard `git-cache/` and `download-cache/` below `cache_dir`.
    #[must_use]
    pub fn under(cache_dir: &Path) -> Self {
        Self {
            git_cache_dir: cache_dir.join(GIT_CACHE_DIR),
            download_dir: cache_dir.join(DOWNLOAD_CACHE_DIR),
        }
    }

    /// Directory holding the bare repository mirrors.
    #[must_use]
    pub fn git_cache_dir(&self) -> &Path {
        &self.git_cache_dir
    }

    /// Package download cache.
    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Bare mirror of `module`.
    #[must_use]
    pub fn mirror_dir(&self, module: &str) -> PathBuf {
        self.git_cache_dir.join(module)
    }

    /// Lock serialising writes to the download cache. Held for the whole
    /// batched install.
    #[must_use]
    pub fn download_lock(&self) -> ResourceLock {
        ResourceLock::for_directory(&self.download_dir)
    }
}

/// Where and how fixtures run.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Root owning `env/`, `code/` and `build/`.
    pub cache_root: PathBuf,
    /// Shared mirror and download caches.
    pub shared: SharedCaches,
    /// Remove private directories on teardown and untracked files in
    /// checkouts.
    pub cleanup: bool,
    /// Clone through the shared mirrors instead of shallow clones.
    pub git_cache: bool,
    /// Upper bound for each subprocess.
    pub command_timeout: Option<Duration>,
    /// Extra environment for subprocesses.
    pub build_env: BuildEnv,
}

impl FixtureConfig {
    /// Defaults: cleanup and git cache on, no timeout, no extra environment.
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>, shared: SharedCaches) -> Self {
        Self {
            cache_root: cache_root.into(),
            shared,
            cleanup: true,
            git_cache: true,
            command_timeout: None,
            build_env: BuildEnv::default(),
        }
    }

    /// Isolated environment directory.
    #[must_use]
    pub fn env_dir(&self) -> PathBuf {
        self.cache_root.join(ENV_DIR)
    }

    /// Source checkout directory.
    #[must_use]
    pub fn code_dir(&self) -> PathBuf {
        self.cache_root.join(CODE_DIR)
    }

    /// Scratch build directory.
    #[must_use]
    pub fn build_dir(&self) -> PathBuf {
        self.cache_root.join(BUILD_DIR)
    }
}

/// Lifecycle position of a [`Fixture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    /// Created, nothing on disk yet.
    Uninitialized,
    /// Environment exists; installs may run.
    Provisioned,
    /// The test command ran.
    Executed,
    /// Private directories released.
    TornDown,
}

impl fmt::Display for FixtureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Provisioned => write!(f, "provisioned"),
            Self::Executed => write!(f, "executed"),
            Self::TornDown => write!(f, "torn down"),
        }
    }
}

/// Visibility of a fixture message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintLevel {
    /// Always shown.
    Normal,
    /// Shown only in verbose runs (command echoes).
    Verbose,
}

/// One disposable execution environment.
#[derive(Debug)]
pub struct Fixture<'a> {
    config: &'a FixtureConfig,
    toolchain: &'a dyn Toolchain,
    ctx: &'a RunContext,
    log: File,
    log_path: PathBuf,
    state: FixtureState,
}

impl<'a> Fixture<'a> {
    /// Create a fixture writing its build output to `log_path`.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::Io`] if the build log cannot be created.
    pub fn new(
        config: &'a FixtureConfig,
        toolchain: &'a dyn Toolchain,
        ctx: &'a RunContext,
        log_path: &Path,
    ) -> Result<Self, FixtureError> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).map_err(FixtureError::io("create", parent))?;
        }
        let log = File::create(log_path).map_err(FixtureError::io("create", log_path))?;
        Ok(Self {
            config,
            toolchain,
            ctx,
            log,
            log_path: log_path.to_path_buf(),
            state: FixtureState::Uninitialized,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> FixtureState {
        self.state
    }

    /// Build log path.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Environment directory; test commands run here.
    #[must_use]
    pub fn env_dir(&self) -> PathBuf {
        self.config.env_dir()
    }

    /// Write `msg` to the build log and, depending on `level`, to the run
    /// context.
    pub fn print(&self, msg: &str, level: PrintLevel) {
        let mut log = &self.log;
        if let Err(err) = writeln!(log, "{msg}") {
            tracing::warn!(path = %self.log_path.display(), err = %err, "failed to write build log");
        }
        if level == PrintLevel::Normal || self.ctx.is_verbose() {
            self.ctx.emit(msg);
        }
    }

    /// Create the scratch directories and a fresh environment, discarding
    /// any environment left behind by an earlier run.
    ///
    /// # Errors
    ///
    /// Returns the first filesystem or subprocess failure.
    pub fn setup(&mut self) -> Result<(), FixtureError> {
        if self.state == FixtureState::TornDown {
            return Err(FixtureError::InvalidState {
                operation: "set up",
                actual: self.state,
            });
        }
        for dir in [
            self.config.code_dir(),
            self.config.build_dir(),
            self.config.shared.git_cache_dir().to_path_buf(),
            self.config.shared.download_dir().to_path_buf(),
        ] {
            fs::create_dir_all(&dir).map_err(FixtureError::io("create", &dir))?;
        }

        let env_dir = self.config.env_dir();
        remove_dir_if_exists(&env_dir)?;
        self.print(
            &format!("Setting up environment at {}", env_dir.display()),
            PrintLevel::Verbose,
        );
        self.run_command(&self.toolchain.create_environment(&env_dir))?;

        let bootstrap = self.toolchain.bootstrap_packages();
        if !bootstrap.is_empty() {
            self.install_packages(bootstrap)?;
        }
        self.state = FixtureState::Provisioned;
        Ok(())
    }

    /// Install `specs`: plain requirements in one batch, then each `git+`
    /// source in order.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::InvalidSpec`] for malformed sources, or the
    /// first install failure.
    pub fn install_spec<S: AsRef<str>>(&self, specs: &[S]) -> Result<(), FixtureError> {
        self.require_provisioned("install")?;
        let plan = InstallPlan::from_specs(specs).map_err(FixtureError::InvalidSpec)?;
        if !plan.packages.is_empty() {
            self.install_packages(&plan.packages)?;
        }
        for source in &plan.sources {
            self.git_install(source)?;
        }
        Ok(())
    }

    /// Check out `source` (through the mirror cache when enabled), then
    /// build and install it into the environment.
    ///
    /// # Errors
    ///
    /// Returns lock, git or build failures.
    pub fn git_install(&self, source: &VcsSource) -> Result<(), FixtureError> {
        self.require_provisioned("install")?;
        let checkout = self.config.code_dir().join(&source.module);
        self.print(
            &format!("Installing {} from {} ({})", source.module, source.url, source.git_ref),
            PrintLevel::Verbose,
        );

        let target = if self.config.git_cache {
            let mirror = self.config.shared.mirror_dir(&source.module);
            ResourceLock::for_directory(&mirror)
                .with(|| self.update_mirror(&mirror, &source.url))?;

            if checkout.is_dir() {
                self.run_command(&git(&checkout).args(["fetch", "origin"]))?;
            } else {
                self.run_command(
                    &CommandSpec::new("git")
                        .args(["clone", "--reference"])
                        .arg(&mirror)
                        .arg(&source.url)
                        .arg(&checkout),
                )?;
            }
            self.resolve_ref(&checkout, &source.git_ref)?
        } else {
            remove_dir_if_exists(&checkout)?;
            self.run_command(
                &CommandSpec::new("git")
                    .args(["clone", "--depth", "1", "-b", &source.git_ref])
                    .arg(&source.url)
                    .arg(&checkout),
            )?;
            source.git_ref.clone()
        };

        self.run_command(&git(&checkout).args(["reset", "--hard", &target]))?;
        if self.config.cleanup {
            self.run_command(&git(&checkout).args(["clean", "-f", "-d", "-x"]))?;
        }

        let env_dir = self.config.env_dir();
        let build_dir = self.config.build_dir();
        for step in self.toolchain.build_checkout(&env_dir, &build_dir, &checkout) {
            self.run_command(&step)?;
        }
        Ok(())
    }

    /// Run `spec` with output captured in the build log.
    ///
    /// # Errors
    ///
    /// A non-zero exit is [`FixtureError::CommandFailed`]; see also
    /// [`FixtureError::Spawn`] and [`FixtureError::Timeout`].
    pub fn run_command(&self, spec: &CommandSpec) -> Result<(), FixtureError> {
        self.print(&format!("$ {}", spec.display()), PrintLevel::Verbose);
        match self.launch(spec, &self.log)? {
            Completion::Exited(status) if status.success() => Ok(()),
            Completion::Exited(status) => Err(FixtureError::CommandFailed {
                command: spec.display(),
                status: status.to_string(),
                log: self.log_path.clone(),
            }),
            Completion::TimedOut => Err(self.timed_out(spec)),
        }
    }

    /// Run the environment's interpreter with `args` in `cwd`.
    ///
    /// # Errors
    ///
    /// As [`Fixture::run_command`]; also fails before provisioning.
    pub fn run_installed_interpreter_script<I, S>(&self, args: I, cwd: &Path) -> Result<(), FixtureError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.require_provisioned("run the interpreter")?;
        let spec = CommandSpec::new(self.toolchain.interpreter(&self.config.env_dir()))
            .args(args)
            .current_dir(cwd);
        self.run_command(&spec)
    }

    /// Run the test command `cmd` through `sh` inside the activated
    /// environment, writing all output to `log`. The runner's exit status
    /// is returned, never turned into an error.
    ///
    /// # Errors
    ///
    /// Fails only when the shell cannot be started or before provisioning.
    pub fn run_test_command(&mut self, cmd: &str, log: &File) -> Result<Completion, FixtureError> {
        self.require_provisioned("run tests")?;
        let script = format!("{}{cmd}", self.toolchain.activation_prelude());
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(self.config.env_dir());

        self.print(&format!("$ {cmd}"), PrintLevel::Verbose);
        let done = self.launch(&spec, log)?;
        match done {
            Completion::Exited(status) => {
                tracing::debug!(status = %status, "test command finished");
            },
            Completion::TimedOut => {
                let secs = self.config.command_timeout.map_or(0, |t| t.as_secs());
                self.print(
                    &format!("Test command timed out after {secs}s"),
                    PrintLevel::Normal,
                );
            },
        }
        self.state = FixtureState::Executed;
        Ok(done)
    }

    /// Release the private directories (when cleanup is enabled). Shared
    /// caches are left alone. Calling this again does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first removal failure; the fixture counts as torn down
    /// regardless.
    pub fn teardown(&mut self) -> Result<(), FixtureError> {
        if self.state == FixtureState::TornDown {
            return Ok(());
        }
        self.state = FixtureState::TornDown;
        if !self.config.cleanup {
            return Ok(());
        }
        let mut first_err = None;
        for dir in [
            self.config.env_dir(),
            self.config.code_dir(),
            self.config.build_dir(),
        ] {
            if let Err(err) = remove_dir_if_exists(&dir) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn install_packages(&self, packages: &[String]) -> Result<(), FixtureError> {
        let env_dir = self.config.env_dir();
        let build_dir = self.config.build_dir();
        let shared = &self.config.shared;

        reset_dir(&build_dir)?;
        let installed = shared.download_lock().with(|| {
            self.run_command(&self.toolchain.install_packages(
                &env_dir,
                &build_dir,
                shared.download_dir(),
                packages,
            ))
        });
        let wiped = reset_dir(&build_dir);
        installed?;
        wiped
    }

    fn update_mirror(&self, mirror: &Path, url: &str) -> Result<(), FixtureError> {
        if mirror.is_dir() {
            return self.run_command(&git(mirror).args([
                "fetch",
                "--prune",
                url,
                "+refs/heads/*:refs/heads/*",
                "+refs/tags/*:refs/tags/*",
            ]));
        }
        let cloned = self.run_command(
            &CommandSpec::new("git")
                .args(["clone", "--bare", url])
                .arg(mirror),
        );
        if cloned.is_err() {
            // Later runs must see either a complete mirror or none.
            let _ = remove_dir_if_exists(mirror);
        }
        cloned
    }

    /// `origin/<ref>` when the remote has such a branch, `<ref>` otherwise
    /// (tags and commits).
    fn resolve_ref(&self, checkout: &Path, git_ref: &str) -> Result<String, FixtureError> {
        let remote = format!("origin/{git_ref}");
        let probe = git(checkout).args(["rev-parse", "--verify", "--quiet", &format!("{remote}^{{commit}}")]);
        self.print(&format!("$ {}", probe.display()), PrintLevel::Verbose);
        match self.launch(&probe, &self.log)? {
            Completion::Exited(status) if status.success() => Ok(remote),
            Completion::Exited(_) => Ok(git_ref.to_string()),
            Completion::TimedOut => Err(self.timed_out(&probe)),
        }
    }

    fn launch(&self, spec: &CommandSpec, log: &File) -> Result<Completion, FixtureError> {
        run_logged(spec, log, &self.config.build_env, self.config.command_timeout).map_err(
            |source| FixtureError::Spawn {
                command: spec.display(),
                source,
            },
        )
    }

    fn timed_out(&self, spec: &CommandSpec) -> FixtureError {
        FixtureError::Timeout {
            command: spec.display(),
            timeout: self.config.command_timeout.unwrap_or_default(),
            log: self.log_path.clone(),
        }
    }

    fn require_provisioned(&self, operation: &'static str) -> Result<(), FixtureError> {
        match self.state {
            FixtureState::Provisioned | FixtureState::Executed => Ok(()),
            actual => Err(FixtureError::InvalidState { operation, actual }),
        }
    }
}

impl Drop for Fixture<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::warn!(err = %err, "fixture teardown failed");
        }
    }
}

fn git(repo: &Path) -> CommandSpec {
    CommandSpec::new("git").current_dir(repo)
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), FixtureError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(FixtureError::Io {
            action: "remove",
            path: dir.to_path_buf(),
            source,
        }),
    }
}

fn reset_dir(dir: &Path) -> Result<(), FixtureError> {
    remove_dir_if_exists(dir)?;
    fs::create_dir_all(dir).map_err(FixtureError::io("create", dir))
}
