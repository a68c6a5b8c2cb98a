//! Transcript parsing: raw test-runner output to structured failure records.
//!
//! Two transcript dialects are supported, selected by [`Dialect`]:
//!
//! - [`Dialect::Nose`]: block-style output where each failure is framed by a
//!   `=====` header separator, an `ERROR: <name>` / `FAIL: <name>` line and
//!   `-----` separators, followed by a `Ran <N> tests in <duration>` footer.
//! - [`Dialect::PytestLog`]: per-item progress lines read from an auxiliary
//!   `pytest.log` file in the working directory, with the main transcript
//!   only consulted for the end-of-run marker.
//!
//! Parsing never fails with an error: malformed or truncated transcripts
//! produce a [`ParseResult`] carrying a fatal error message and a negative
//! test count. Individual test failures are data, not errors.
//!
//! # Invariants
//!
//! - `fatal_error.is_some()` if and only if `test_count < 0`.
//! - Parsing the same input twice yields equal results (all maps are
//!   ordered).

mod nose;
mod pytest_log;
mod warnings;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use self::nose::{NOSE_PARSE_FAILED, parse_nose};
pub use self::pytest_log::{PYTEST_INCOMPLETE, PYTEST_LOG_FILENAME, parse_pytest_log};
pub use self::warnings::scan_warnings;

/// Failure text keyed by test identifier.
pub type FailureMap = BTreeMap<String, String>;

/// Formatted warning blocks keyed by `<location>: <category>: <message>`.
pub type WarningMap = BTreeMap<String, String>;

/// Separator printed in front of each failure/warning block.
pub(crate) const BLOCK_RULE: &str =
    "-------------------------------------------------------------------------------";

/// Transcript dialect names accepted in the catalog.
///
/// The set is closed: unknown names are rejected when the catalog is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    /// Block-style `unittest`/nose transcript.
    Nose,
    /// Per-item progress log written to `pytest.log`.
    PytestLog,
}

impl Dialect {
    /// All dialects, in the order they are listed in error messages.
    pub const ALL: [Self; 2] = [Self::Nose, Self::PytestLog];

    /// Catalog name of this dialect.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nose => "nose",
            Self::PytestLog => "pytest-log",
        }
    }

    /// Parse `text` captured from a test run executed in `cwd`.
    ///
    /// `cwd` is only consulted by dialects that read auxiliary files.
    #[must_use]
    pub fn parse(self, text: &str, cwd: &Path) -> ParseResult {
        match self {
            Self::Nose => parse_nose(text),
            Self::PytestLog => parse_pytest_log(text, cwd),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a dialect name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown parser name: {name}; not one of {known}")]
pub struct UnknownDialect {
    /// The rejected name.
    pub name: String,
    /// Comma-separated list of valid names.
    pub known: String,
}

impl FromStr for Dialect {
    type Err = UnknownDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.name() == s)
            .ok_or_else(|| UnknownDialect {
                name: s.to_string(),
                known: Self::ALL
                    .iter()
                    .map(|d| d.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// Structured outcome of parsing one transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseResult {
    failures: FailureMap,
    warnings: WarningMap,
    test_count: i64,
    fatal_error: Option<String>,
}

impl ParseResult {
    /// A transcript that was parsed to completion.
    ///
    /// Negative counts are clamped to zero so the fatal/count invariant holds.
    #[must_use]
    pub fn complete(failures: FailureMap, warnings: WarningMap, test_count: i64) -> Self {
        Self {
            failures,
            warnings,
            test_count: test_count.max(0),
            fatal_error: None,
        }
    }

    /// A transcript that cannot be trusted. Whatever failures were recovered
    /// are kept for diagnostics but the count is forced to `-1`.
    #[must_use]
    pub fn fatal(message: impl Into<String>, failures: FailureMap, warnings: WarningMap) -> Self {
        Self {
            failures,
            warnings,
            test_count: -1,
            fatal_error: Some(message.into()),
        }
    }

    /// Failure text keyed by test identifier.
    #[must_use]
    pub const fn failures(&self) -> &FailureMap {
        &self.failures
    }

    /// Aggregated warning blocks.
    #[must_use]
    pub const fn warnings(&self) -> &WarningMap {
        &self.warnings
    }

    /// Number of tests executed, or `-1` when the transcript is fatal.
    #[must_use]
    pub const fn test_count(&self) -> i64 {
        self.test_count
    }

    /// Reason the transcript could not be trusted, if any.
    #[must_use]
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    /// Whether the transcript could not be trusted.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.fatal_error.is_some()
    }
}

/// Split `text` into lines with trailing whitespace removed.
pub(crate) fn stripped_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim_end)
}
