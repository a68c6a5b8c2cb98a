//! Scoped subprocess execution.
//!
//! Every child spawned by a fixture is owned by a [`ChildGuard`]. The guard
//! kills and reaps the child when it is dropped while still running. A
//! child that already exited is never signalled.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::buildenv::BuildEnv;

/// A subprocess invocation: program, arguments, working directory and extra
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    /// Invocation of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Run in `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable for the child only.
    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Program to execute.
    #[must_use]
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments, in order.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Working directory, if set.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Shell-like rendering for progress output, e.g.
    /// `(cd /tmp/env && python3 -m venv 'my env')`.
    #[must_use]
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(shell_quote(&self.program.to_string_lossy()));
        for arg in &self.args {
            parts.push(shell_quote(&arg.to_string_lossy()));
        }
        let line = parts.join(" ");
        match &self.cwd {
            Some(dir) => format!("(cd {} && {line})", shell_quote(&dir.to_string_lossy())),
            None => line,
        }
    }

    fn to_command(&self, build_env: &BuildEnv) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        build_env.apply(&mut cmd);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Quote `value` for display if it contains characters a POSIX shell would
/// interpret.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_.:/%+=,@".contains(ch))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\"'\"'"))
    }
}

/// How a logged command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The child exited on its own.
    Exited(ExitStatus),
    /// The deadline passed; the child was killed and reaped.
    TimedOut,
}

/// Owns a running child until it has been reaped.
#[derive(Debug)]
pub struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    /// Spawn `cmd` under a guard.
    ///
    /// # Errors
    ///
    /// Returns the spawn error.
    pub fn spawn(cmd: &mut Command) -> io::Result<Self> {
        Ok(Self {
            child: cmd.spawn()?,
            reaped: false,
        })
    }

    /// OS process id of the child.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the child, at most `timeout` if given. `Ok(None)` means the
    /// deadline passed with the child still running.
    ///
    /// # Errors
    ///
    /// Returns the wait error.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
        let status = match timeout {
            Some(limit) => self.child.wait_timeout(limit)?,
            None => Some(self.child.wait()?),
        };
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    /// Kill the child if it is still running, then reap it. Calling this
    /// more than once, or after the child exited, does nothing.
    pub fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => {},
            Ok(None) | Err(_) => {
                if let Err(err) = self.child.kill() {
                    tracing::debug!(pid = self.child.id(), err = %err, "kill failed");
                }
                let _ = self.child.wait();
            },
        }
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Run `spec` with stdin closed and stdout/stderr appended to `log`.
///
/// # Errors
///
/// Returns spawn, redirection and wait errors. A non-zero exit is not an
/// error at this level.
pub fn run_logged(
    spec: &CommandSpec,
    log: &File,
    build_env: &BuildEnv,
    timeout: Option<Duration>,
) -> io::Result<Completion> {
    let mut cmd = spec.to_command(build_env);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log.try_clone()?));

    let mut child = ChildGuard::spawn(&mut cmd)?;
    tracing::debug!(pid = child.id(), cmd = %spec.display(), "spawned");
    match child.wait(timeout)? {
        Some(status) => Ok(Completion::Exited(status)),
        None => {
            child.terminate();
            Ok(Completion::TimedOut)
        },
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn quote_leaves_plain_words_alone() {
        assert_eq!(shell_quote("pip"), "pip");
        assert_eq!(shell_quote("numpy==1.7.1"), "numpy==1.7.1");
        assert_eq!(shell_quote("git+https://x/y@v1"), "git+https://x/y@v1");
    }

    #[test]
    fn quote_wraps_spaces_and_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn display_includes_working_directory() {
        let spec = CommandSpec::new("python3")
            .args(["-m", "venv", "my env"])
            .current_dir("/tmp/x");

        assert_eq!(spec.display(), "(cd /tmp/x && python3 -m venv 'my env')");
        assert_eq!(CommandSpec::new("true").display(), "true");
    }

    #[cfg(unix)]
    #[test]
    fn output_goes_to_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("build.log");
        let log = File::create(&log_path).expect("log");
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .current_dir(dir.path());

        let done = run_logged(&spec, &log, &BuildEnv::default(), None).expect("run");

        let Completion::Exited(status) = done else {
            panic!("unexpected timeout");
        };
        assert_eq!(status.code(), Some(3));
        let text = fs::read_to_string(&log_path).expect("read");
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }

    #[cfg(unix)]
    #[test]
    fn env_reaches_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("build.log");
        let log = File::create(&log_path).expect("log");
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"$TESTRIG_MARKER\""])
            .env("TESTRIG_MARKER", "visible");

        run_logged(&spec, &log, &BuildEnv::default(), None).expect("run");

        assert_eq!(fs::read_to_string(&log_path).expect("read"), "visible\n");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = File::create(dir.path().join("log")).expect("log");
        let spec = CommandSpec::new("sleep").arg("30");

        let started = std::time::Instant::now();
        let done = run_logged(
            &spec,
            &log,
            &BuildEnv::default(),
            Some(Duration::from_millis(100)),
        )
        .expect("run");

        assert_eq!(done, Completion::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn terminate_is_idempotent_after_exit() {
        let mut child = ChildGuard::spawn(&mut Command::new("true")).expect("spawn");
        let status = child.wait(None).expect("wait").expect("exited");

        assert!(status.success());
        child.terminate();
        child.terminate();
    }

    #[test]
    fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = File::create(dir.path().join("log")).expect("log");
        let spec = CommandSpec::new("/nonexistent/testrig-program");

        assert!(run_logged(&spec, &log, &BuildEnv::default(), None).is_err());
    }
}
