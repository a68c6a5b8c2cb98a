//! Regression classification: compares the "old" and "new" parse results of
//! one test and decides whether the change introduced failures.
//!
//! | Old/new state                    | Verdict  | Counts                   |
//! |----------------------------------|----------|--------------------------|
//! | either side fatal                | `Error`  | `(-1, -1, -1)`           |
//! | no failure added in "new"        | `Ok`     | `(n, 0, preexisting)`    |
//! | failures added in "new"          | `Fail`   | `(n, added, preexisting)`|
//!
//! Failures that disappeared between old and new are never actionable. They
//! are listed by name only in verbose reports.
//!
//! # Invariants
//!
//! - `added ∪ preexisting = keys(new.failures)` and `added ∩ preexisting = ∅`.
//! - A fatal input always yields [`Verdict::Error`], never `Fail`.

use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::parser::ParseResult;

/// Width of the `=` rules framing report sections and the run summary.
pub const RULE_WIDTH: usize = 79;

/// Outcome class of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// No failure was introduced by the new variant.
    Ok,
    /// The new variant introduced at least one failure.
    Fail,
    /// Infrastructure or parse failure: the comparison could not be made.
    Error,
}

impl Verdict {
    /// Whether this verdict should make the process exit non-zero.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Fail => write!(f, "FAIL"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Set partition of failure keys between old and new.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailurePartition {
    /// Failing under new, not under old.
    pub added: BTreeSet<String>,
    /// Failing under both.
    pub preexisting: BTreeSet<String>,
    /// Failing under old, not under new.
    pub resolved: BTreeSet<String>,
}

impl FailurePartition {
    /// Partition the failure keys of `old` and `new`.
    #[must_use]
    pub fn of(old: &ParseResult, new: &ParseResult) -> Self {
        let old_keys: BTreeSet<&String> = old.failures().keys().collect();
        let new_keys: BTreeSet<&String> = new.failures().keys().collect();

        Self {
            added: new_keys.difference(&old_keys).map(|k| (*k).clone()).collect(),
            preexisting: new_keys
                .intersection(&old_keys)
                .map(|k| (*k).clone())
                .collect(),
            resolved: old_keys.difference(&new_keys).map(|k| (*k).clone()).collect(),
        }
    }
}

/// Rendering switches for the report text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOptions {
    /// Include pre-existing failures, resolved failures and new warnings.
    pub verbose: bool,
}

/// Result of comparing one test's old and new runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    /// Tests executed under the new variant, `-1` on error.
    pub executed_count: i64,
    /// Failures introduced by the new variant, `-1` on error.
    pub new_failure_count: i64,
    /// Failures present under both variants, `-1` on error.
    pub preexisting_failure_count: i64,
    /// Human-readable report fragment (possibly empty).
    pub report_text: String,
    /// Outcome class.
    pub verdict: Verdict,
}

impl ClassificationResult {
    /// Error outcome with sentinel counts.
    #[must_use]
    pub fn error(report_text: impl Into<String>) -> Self {
        Self {
            executed_count: -1,
            new_failure_count: -1,
            preexisting_failure_count: -1,
            report_text: report_text.into(),
            verdict: Verdict::Error,
        }
    }

    /// `(executed, new failures, pre-existing failures)`.
    #[must_use]
    pub const fn counts(&self) -> (i64, i64, i64) {
        (
            self.executed_count,
            self.new_failure_count,
            self.preexisting_failure_count,
        )
    }
}

/// Compare `old` and `new` results of the test called `name`.
#[must_use]
pub fn classify(
    name: &str,
    old: &ParseResult,
    new: &ParseResult,
    options: ReportOptions,
) -> ClassificationResult {
    if old.is_fatal() || new.is_fatal() {
        let mut report = String::new();
        for (variant, result) in [("old", old), ("new", new)] {
            if let Some(reason) = result.fatal_error() {
                let _ = writeln!(report, "{name}: {variant} run unusable: {reason}");
            }
        }
        return ClassificationResult::error(report);
    }

    let partition = FailurePartition::of(old, new);
    let mut report = String::new();

    if options.verbose {
        push_section(
            &mut report,
            &format!("{name}: pre-existing failures"),
            partition
                .preexisting
                .iter()
                .filter_map(|k| new.failures().get(k)),
        );
    }

    push_section(
        &mut report,
        &format!("{name}: new failures"),
        partition.added.iter().filter_map(|k| new.failures().get(k)),
    );

    if options.verbose {
        push_section(
            &mut report,
            &format!("{name}: no longer failing"),
            partition.resolved.iter(),
        );
        push_section(
            &mut report,
            &format!("{name}: new warnings"),
            new.warnings()
                .iter()
                .filter(|(k, _)| !old.warnings().contains_key(*k))
                .map(|(_, v)| v),
        );
    }

    let added = count(partition.added.len());
    ClassificationResult {
        executed_count: new.test_count(),
        new_failure_count: added,
        preexisting_failure_count: count(partition.preexisting.len()),
        report_text: report,
        verdict: if added == 0 { Verdict::Ok } else { Verdict::Fail },
    }
}

/// A heavy `=` rule, as used around section titles.
#[must_use]
pub fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

fn push_section<'a>(report: &mut String, title: &str, entries: impl Iterator<Item = &'a String>) {
    let mut entries = entries.peekable();
    if entries.peek().is_none() {
        return;
    }
    let rule = rule();
    let _ = write!(report, "\n\n{rule}\n{title}\n{rule}\n");
    for entry in entries {
        report.push_str(entry);
        report.push('\n');
    }
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{FailureMap, WarningMap};

    fn result(failures: &[&str], count: i64) -> ParseResult {
        let failures: FailureMap = failures
            .iter()
            .map(|k| ((*k).to_string(), format!("FAIL: {k}")))
            .collect();
        ParseResult::complete(failures, WarningMap::new(), count)
    }

    #[test]
    fn identical_failures_pass() {
        let old = result(&["x"], 5);
        let new = result(&["x"], 5);

        let outcome = classify("t", &old, &new, ReportOptions::default());

        assert_eq!(outcome.verdict, Verdict::Ok);
        assert_eq!(outcome.counts(), (5, 0, 1));
        assert!(outcome.report_text.is_empty());
    }

    #[test]
    fn added_failure_fails() {
        let old = result(&["x"], 7);
        let new = result(&["x", "y"], 8);

        let outcome = classify("t", &old, &new, ReportOptions::default());

        assert_eq!(outcome.verdict, Verdict::Fail);
        assert_eq!(outcome.counts(), (8, 1, 1));
        assert!(outcome.report_text.contains("t: new failures"));
        assert!(outcome.report_text.contains("FAIL: y"));
        assert!(!outcome.report_text.contains("FAIL: x"));
        assert!(!outcome.report_text.contains("pre-existing"));
    }

    #[test]
    fn verbose_report_lists_preexisting_and_resolved() {
        let old = result(&["x", "gone"], 7);
        let new = result(&["x", "y"], 8);

        let outcome = classify("t", &old, &new, ReportOptions { verbose: true });

        let pre = outcome.report_text.find("t: pre-existing failures").unwrap();
        let added = outcome.report_text.find("t: new failures").unwrap();
        assert!(pre < added);
        assert!(outcome.report_text.contains("FAIL: x"));
        assert!(outcome.report_text.contains("t: no longer failing\n"));
        assert!(outcome.report_text.contains("\ngone\n"));
    }

    #[test]
    fn resolved_failures_do_not_count() {
        let old = result(&["x"], 3);
        let new = result(&[], 3);

        let outcome = classify("t", &old, &new, ReportOptions::default());

        assert_eq!(outcome.verdict, Verdict::Ok);
        assert_eq!(outcome.counts(), (3, 0, 0));
    }

    #[test]
    fn fatal_input_is_error() {
        let old = ParseResult::fatal("parsing failed", FailureMap::new(), WarningMap::new());
        let new = result(&["y"], 3);

        let outcome = classify("t", &old, &new, ReportOptions::default());

        assert_eq!(outcome.verdict, Verdict::Error);
        assert_eq!(outcome.counts(), (-1, -1, -1));
        assert!(outcome.report_text.contains("old run unusable: parsing failed"));
    }

    #[test]
    fn new_warnings_are_reported_when_verbose() {
        let mut old_warnings = WarningMap::new();
        old_warnings.insert("a".into(), "block a".into());
        let mut new_warnings = old_warnings.clone();
        new_warnings.insert("b".into(), "block b".into());
        let old = ParseResult::complete(FailureMap::new(), old_warnings, 1);
        let new = ParseResult::complete(FailureMap::new(), new_warnings, 1);

        let quiet = classify("t", &old, &new, ReportOptions::default());
        let verbose = classify("t", &old, &new, ReportOptions { verbose: true });

        assert!(quiet.report_text.is_empty());
        assert!(verbose.report_text.contains("block b"));
        assert!(!verbose.report_text.contains("block a"));
        assert_eq!(verbose.verdict, Verdict::Ok);
    }

    #[test]
    fn verdict_display_and_failure_flag() {
        assert_eq!(Verdict::Ok.to_string(), "OK");
        assert_eq!(Verdict::Fail.to_string(), "FAIL");
        assert_eq!(Verdict::Error.to_string(), "ERROR");
        assert!(!Verdict::Ok.is_failure());
        assert!(Verdict::Fail.is_failure());
        assert!(Verdict::Error.is_failure());
    }
}
