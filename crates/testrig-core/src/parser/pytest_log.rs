//! Per-item progress dialect backed by an auxiliary `pytest.log` file.
//!
//! Each line of the log starts with a one-character outcome code followed by
//! the test identifier. Failures (`F`) and errors (`E`) are followed by
//! single-space indented detail lines:
//!
//! ```text
//! F test/test_foo.py::test_bar
//!  def test_bar():
//!  >       assert False
//! . test/test_foo.py::test_asd
//! ```
//!
//! Every line that is neither a failure header nor indented detail counts as
//! one completed test, blank lines included.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::{BLOCK_RULE, FailureMap, ParseResult, warnings};

/// Name of the auxiliary log the test command must write into its working
/// directory.
pub const PYTEST_LOG_FILENAME: &str = "pytest.log";

/// Fatal error reported when the transcript lacks the end-of-run marker.
pub const PYTEST_INCOMPLETE: &str = "test suite did not run to completion";

static END_OF_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"in [0-9.,]+ seconds ==+\s*\z").expect("end-of-run regex is valid")
});

/// Verbose progress lines look like `tests/test_x.py::test_y PASSED`.
static TEST_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+::\S+)(?: (.*))?$").expect("start regex is valid"));

/// Parse a run whose per-item log was written to `<cwd>/pytest.log`.
///
/// `text` is the main transcript; it is only used to verify that the run
/// reached its summary line and to collect warnings.
#[must_use]
pub fn parse_pytest_log(text: &str, cwd: &Path) -> ParseResult {
    let log_path = cwd.join(PYTEST_LOG_FILENAME);
    let warnings = warnings::scan_warnings(text, &TEST_START);

    let file = match File::open(&log_path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return ParseResult::fatal(
                format!("log file '{PYTEST_LOG_FILENAME}' not found"),
                FailureMap::new(),
                warnings,
            );
        },
        Err(err) => {
            return ParseResult::fatal(
                format!("failed to open {}: {err}", log_path.display()),
                FailureMap::new(),
                warnings,
            );
        },
    };

    let (failures, test_count) = match scan_log(BufReader::new(file)) {
        Ok(scanned) => scanned,
        Err(err) => {
            return ParseResult::fatal(
                format!("failed to read {}: {err}", log_path.display()),
                FailureMap::new(),
                warnings,
            );
        },
    };

    if !END_OF_RUN.is_match(text) {
        tracing::debug!(
            failures = failures.len(),
            "transcript lacks end-of-run marker, discarding count"
        );
        return ParseResult::fatal(PYTEST_INCOMPLETE, failures, warnings);
    }

    ParseResult::complete(failures, warnings, test_count)
}

/// Walk the per-item log, returning the failure map and completed-test count.
fn scan_log(reader: impl BufRead) -> io::Result<(FailureMap, i64)> {
    let mut records: Vec<(String, Vec<String>)> = Vec::new();
    let mut open: Option<usize> = None;
    let mut test_count: i64 = 0;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end_matches(['\n', '\r']);

        if line.starts_with(['F', 'E']) {
            test_count += 1;
            let name = line[1..].trim().to_string();
            records.push((name, vec![BLOCK_RULE.to_string(), line.to_string()]));
            open = Some(records.len() - 1);
        } else if let Some(detail) = line.strip_prefix(' ') {
            if let Some(idx) = open {
                records[idx].1.push(detail.to_string());
            }
        } else {
            open = None;
            test_count += 1;
        }
    }

    let failures = records
        .into_iter()
        .map(|(name, lines)| (name, lines.join("\n")))
        .collect();

    Ok((failures, test_count))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const LOG: &str = "F test/test_foo.py::test_bar\n \
                       def test_bar():\n \
                       >       assert False\n \
                       E       assert False\n \
                       \n \
                       test/test_foo.py:4: AssertionError\n\
                       . test/test_foo.py::test_asd\n";

    fn write_log(dir: &Path, content: &str) {
        fs::write(dir.join(PYTEST_LOG_FILENAME), content).expect("write pytest.log");
    }

    #[test]
    fn failure_block_and_pass_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_log(dir.path(), LOG);

        let result = parse_pytest_log("===== 1 failed, 1 passed in 1.23 seconds ==\n", dir.path());

        assert!(!result.is_fatal(), "{:?}", result.fatal_error());
        assert_eq!(result.test_count(), 2);
        let expected = format!(
            "{BLOCK_RULE}\n\
             F test/test_foo.py::test_bar\n\
             def test_bar():\n\
             >       assert False\n\
             E       assert False\n\
             \n\
             test/test_foo.py:4: AssertionError"
        );
        assert_eq!(result.failures().len(), 1);
        assert_eq!(result.failures()["test/test_foo.py::test_bar"], expected);
    }

    #[test]
    fn missing_log_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");

        let result = parse_pytest_log("in 1.0 seconds ==", dir.path());

        assert!(result.is_fatal());
        assert_eq!(result.test_count(), -1);
        assert!(result.fatal_error().unwrap().contains(PYTEST_LOG_FILENAME));
    }

    #[test]
    fn truncated_transcript_is_fatal_but_keeps_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_log(dir.path(), LOG);

        let result = parse_pytest_log("collected 2 items\ntest/test_foo.py F", dir.path());

        assert_eq!(result.test_count(), -1);
        assert_eq!(result.fatal_error(), Some(PYTEST_INCOMPLETE));
        assert_eq!(result.failures().len(), 1);
    }

    #[test]
    fn wide_summary_rule_is_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_log(dir.path(), ". a::b\n");

        let result = parse_pytest_log("==== 1 passed in 0.01 seconds =========\n\n", dir.path());

        assert_eq!(result.test_count(), 1);
        assert!(result.failures().is_empty());
    }

    #[test]
    fn detail_after_pass_line_is_discarded() {
        let (failures, count) =
            scan_log("E a::x\n boom\n. a::y\n stray\nF a::z\n".as_bytes()).expect("scan");

        assert_eq!(count, 3);
        assert_eq!(failures["a::x"], format!("{BLOCK_RULE}\nE a::x\nboom"));
        assert_eq!(failures["a::z"], format!("{BLOCK_RULE}\nF a::z"));
    }

    #[test]
    fn blank_line_counts_as_a_test() {
        let (failures, count) = scan_log(". a::b\n\n. a::c\n".as_bytes()).expect("scan");

        assert_eq!(count, 3);
        assert!(failures.is_empty());
    }

    #[test]
    fn repeated_name_keeps_last_record() {
        let (failures, count) = scan_log("F a::x\n one\nF a::x\n two\n".as_bytes()).expect("scan");

        assert_eq!(count, 2);
        assert_eq!(failures.len(), 1);
        assert!(failures["a::x"].ends_with("two"));
    }
}
