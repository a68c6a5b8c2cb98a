//! Provisioning and installation mechanics of one language ecosystem.
//!
//! A [`Toolchain`] only builds [`CommandSpec`]s; the fixture decides where
//! their output goes, which locks they run under and how failures surface.

use std::fmt;
use std::path::{Path, PathBuf};

use super::command::CommandSpec;

/// Commands that create, populate and activate an isolated environment.
pub trait Toolchain: Send + Sync + fmt::Debug {
    /// Create a fresh environment at `env_dir` (which does not exist yet).
    fn create_environment(&self, env_dir: &Path) -> CommandSpec;

    /// Requirements installed right after the environment is created.
    fn bootstrap_packages(&self) -> &[String] {
        &[]
    }

    /// Install `packages` into the environment in one batch, building in
    /// `build_dir` and caching downloads in `download_dir`.
    fn install_packages(
        &self,
        env_dir: &Path,
        build_dir: &Path,
        download_dir: &Path,
        packages: &[String],
    ) -> CommandSpec;

    /// Build and install the source checkout at `checkout`, in order.
    fn build_checkout(&self, env_dir: &Path, build_dir: &Path, checkout: &Path) -> Vec<CommandSpec>;

    /// Interpreter installed in the environment.
    fn interpreter(&self, env_dir: &Path) -> PathBuf;

    /// Shell text prepended to test commands run inside `env_dir`.
    fn activation_prelude(&self) -> String;
}

/// Python virtual environments driven by `venv` and `pip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonToolchain {
    python: PathBuf,
    bootstrap: Vec<String>,
}

impl Default for PythonToolchain {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            bootstrap: Vec::new(),
        }
    }
}

impl PythonToolchain {
    /// Use `python` to create environments.
    #[must_use]
    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = python.into();
        self
    }

    /// Pin packages installed into every fresh environment, e.g.
    /// `pip==8.0.2`.
    #[must_use]
    pub fn with_bootstrap(mut self, packages: Vec<String>) -> Self {
        self.bootstrap = packages;
        self
    }

    fn pip(&self, env_dir: &Path) -> CommandSpec {
        CommandSpec::new(self.interpreter(env_dir)).args(["-m", "pip"])
    }
}

impl Toolchain for PythonToolchain {
    fn create_environment(&self, env_dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.python)
            .args(["-m", "venv"])
            .arg(env_dir)
    }

    fn bootstrap_packages(&self) -> &[String] {
        &self.bootstrap
    }

    fn install_packages(
        &self,
        env_dir: &Path,
        build_dir: &Path,
        download_dir: &Path,
        packages: &[String],
    ) -> CommandSpec {
        self.pip(env_dir)
            .arg("install")
            .arg("--cache-dir")
            .arg(download_dir)
            .args(packages)
            .current_dir(build_dir)
            .env("TMPDIR", build_dir)
    }

    fn build_checkout(&self, env_dir: &Path, build_dir: &Path, checkout: &Path) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new(self.interpreter(env_dir))
                .args(["setup.py", "build"])
                .current_dir(checkout)
                .env("TMPDIR", build_dir),
            self.pip(env_dir)
                .args(["install", "."])
                .current_dir(checkout)
                .env("TMPDIR", build_dir),
        ]
    }

    fn interpreter(&self, env_dir: &Path) -> PathBuf {
        env_dir.join("bin").join("python")
    }

    fn activation_prelude(&self) -> String {
        ". bin/activate; ".to_string()
    }
}
