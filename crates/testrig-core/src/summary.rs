//! Run summary: one line per selected test, process exit status and the
//! machine-readable `summary.json`.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::classify::{ClassificationResult, Verdict, rule};

/// File name of the JSON summary inside the cache directory.
pub const SUMMARY_FILENAME: &str = "summary.json";

/// Process exit codes.
pub mod exit_codes {
    /// Every selected test is OK.
    pub const SUCCESS: u8 = 0;
    /// At least one test is FAIL or ERROR.
    pub const FAILURE: u8 = 1;
    /// Bad catalog, empty selection or busy cache root.
    pub const CONFIG_ERROR: u8 = 2;
}

/// Errors raised while exporting the summary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SummaryError {
    /// Serialisation failed.
    #[error("failed to serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Outcome of one test as reported in the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryEntry {
    /// Test name.
    pub name: String,
    /// OK, FAIL or ERROR.
    pub status: Verdict,
    /// Tests executed under "new", `-1` on error.
    pub executed: i64,
    /// Failures introduced by "new", `-1` on error.
    pub new_failures: i64,
    /// Failures present under both variants, `-1` on error.
    pub preexisting_failures: i64,
}

impl SummaryEntry {
    /// Summary entry for a classified test.
    #[must_use]
    pub fn from_result(name: &str, result: &ClassificationResult) -> Self {
        Self {
            name: name.to_string(),
            status: result.verdict,
            executed: result.executed_count,
            new_failures: result.new_failure_count,
            preexisting_failures: result.preexisting_failure_count,
        }
    }

    /// The `- name: STATUS (...)` line.
    #[must_use]
    pub fn line(&self) -> String {
        match self.status {
            Verdict::Ok => format!(
                "- {}: OK (ran {} tests, {} old failures)",
                self.name, self.executed, self.preexisting_failures
            ),
            Verdict::Fail => format!(
                "- {}: FAIL (ran {} tests, {} new failures, {} old failures)",
                self.name, self.executed, self.new_failures, self.preexisting_failures
            ),
            Verdict::Error => format!("- {}: ERROR (build or test output unusable)", self.name),
        }
    }
}

/// Outcomes of every selected test, in selection order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    tests: Vec<SummaryEntry>,
}

impl RunSummary {
    /// Summary of `entries`, kept in the given order.
    #[must_use]
    pub const fn new(entries: Vec<SummaryEntry>) -> Self {
        Self { tests: entries }
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[SummaryEntry] {
        &self.tests
    }

    /// Entry of the test called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SummaryEntry> {
        self.tests.iter().find(|e| e.name == name)
    }

    /// Whether every test is OK.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.tests.iter().all(|e| !e.status.is_failure())
    }

    /// [`exit_codes::SUCCESS`] iff every test is OK.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.all_ok() {
            exit_codes::SUCCESS
        } else {
            exit_codes::FAILURE
        }
    }

    /// The framed summary block.
    #[must_use]
    pub fn render(&self) -> String {
        let rule = rule();
        let mut out = format!("{rule}\nSummary\n{rule}\n\n");
        for entry in &self.tests {
            let _ = writeln!(out, "{}", entry.line());
        }
        out
    }

    /// Write `summary.json` (pretty-printed) into `dir`.
    ///
    /// # Errors
    ///
    /// Returns serialisation or write errors.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf, SummaryError> {
        let path = dir.join(SUMMARY_FILENAME);
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        std::fs::write(&path, json).map_err(|source| SummaryError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, status: Verdict, counts: (i64, i64, i64)) -> SummaryEntry {
        SummaryEntry {
            name: name.to_string(),
            status,
            executed: counts.0,
            new_failures: counts.1,
            preexisting_failures: counts.2,
        }
    }

    #[test]
    fn render_lists_every_test() {
        let summary = RunSummary::new(vec![
            entry("scipy-dev", Verdict::Ok, (10, 0, 0)),
            entry("astropy-dev", Verdict::Fail, (8, 1, 1)),
            entry("broken", Verdict::Error, (-1, -1, -1)),
        ]);

        let text = summary.render();

        assert!(text.starts_with(&format!("{}\nSummary\n", rule())));
        assert!(text.contains("- scipy-dev: OK (ran 10 tests, 0 old failures)\n"));
        assert!(text.contains("- astropy-dev: FAIL (ran 8 tests, 1 new failures, 1 old failures)\n"));
        assert!(text.contains("- broken: ERROR"));
    }

    #[test]
    fn exit_code_reflects_any_failure() {
        let ok = RunSummary::new(vec![entry("a", Verdict::Ok, (1, 0, 0))]);
        let err = RunSummary::new(vec![
            entry("a", Verdict::Ok, (1, 0, 0)),
            entry("b", Verdict::Error, (-1, -1, -1)),
        ]);

        assert_eq!(ok.exit_code(), exit_codes::SUCCESS);
        assert_eq!(err.exit_code(), exit_codes::FAILURE);
    }

    #[test]
    fn json_export() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = RunSummary::new(vec![entry("scipy-dev", Verdict::Fail, (8, 1, 1))]);

        let path = summary.write_json(dir.path()).expect("write");

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).expect("read")).expect("json");
        assert_eq!(value["tests"][0]["name"], "scipy-dev");
        assert_eq!(value["tests"][0]["status"], "FAIL");
        assert_eq!(value["tests"][0]["new_failures"], 1);
        assert_eq!(value["tests"][0]["preexisting_failures"], 1);
    }
}
