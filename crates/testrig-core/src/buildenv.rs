//! Build-acceleration environment for fixture subprocesses.
//!
//! Compiler-cache wrapper directories are prepended to `PATH` of every
//! command a fixture runs. The process environment itself is never modified.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Wrapper directories probed by [`BuildEnv::detect`], ccache first.
pub const COMPILER_CACHE_DIRS: [&str; 2] = ["/usr/lib/ccache", "/usr/local/lib/f90cache"];

/// Warning emitted when no C compiler cache is available.
pub const CCACHE_MISSING_WARNING: &str = "WARNING: ccache is not available -- this is going to be slow";

/// Extra environment applied to fixture subprocesses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnv {
    extra_path: Vec<PathBuf>,
    ccache: bool,
}

impl BuildEnv {
    /// Probe the well-known compiler-cache directories.
    #[must_use]
    pub fn detect() -> Self {
        Self::from_candidates(COMPILER_CACHE_DIRS.iter().map(Path::new))
    }

    /// Keep the existing directories among `candidates`. The first candidate
    /// is treated as the C compiler cache.
    #[must_use]
    pub fn from_candidates<'a>(candidates: impl IntoIterator<Item = &'a Path>) -> Self {
        let mut extra_path = Vec::new();
        let mut ccache = false;
        for (idx, dir) in candidates.into_iter().enumerate() {
            if dir.is_dir() {
                if idx == 0 {
                    ccache = true;
                }
                extra_path.push(dir.to_path_buf());
            }
        }
        Self { extra_path, ccache }
    }

    /// Whether a C compiler cache was found.
    #[must_use]
    pub const fn has_ccache(&self) -> bool {
        self.ccache
    }

    /// `PATH` value to hand to subprocesses, or `None` when nothing needs
    /// to be prepended.
    #[must_use]
    pub fn path_value(&self) -> Option<OsString> {
        if self.extra_path.is_empty() {
            return None;
        }
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .extra_path
            .iter()
            .cloned()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).ok()
    }

    /// Apply the environment to `cmd`.
    pub fn apply(&self, cmd: &mut std::process::Command) {
        if let Some(path) = self.path_value() {
            cmd.env("PATH", path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directories_are_skipped() {
        let env = BuildEnv::from_candidates([Path::new("/nonexistent/ccache")]);

        assert!(!env.has_ccache());
        assert_eq!(env.path_value(), None);
    }

    #[test]
    fn existing_directories_are_prepended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = BuildEnv::from_candidates([dir.path()]);

        assert!(env.has_ccache());
        let path = env.path_value().expect("path value");
        let first = std::env::split_paths(&path).next().expect("first entry");
        assert_eq!(first, dir.path());
    }

    #[test]
    fn second_candidate_is_not_ccache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = BuildEnv::from_candidates([Path::new("/nonexistent"), dir.path()]);

        assert!(!env.has_ccache());
        assert!(env.path_value().is_some());
    }
}
