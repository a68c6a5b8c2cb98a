//! Block-style transcript dialect.
//!
//! ```text
//! ======================================================================
//! ERROR: test_bar
//! ----------------------------------------------------------------------
//! Traceback ...
//!
//! ----------------------------------------------------------------------
//! Ran 3 tests in 0.002s
//! ```

use std::sync::LazyLock;

use regex::Regex;

use super::{FailureMap, ParseResult, stripped_lines, warnings};

static TOP_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^========+$").expect("top rule regex is valid"));

static SUB_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^--------+$").expect("sub rule regex is valid"));

static FAILURE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:ERROR|FAIL): (.*)$").expect("header regex is valid"));

static RAN_FOOTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Ran ([0-9]+) tests? in .*$").expect("footer regex is valid"));

/// Verbose progress lines look like `test_module.test_name ... ok`; output
/// written while the test runs lands after the dots.
static TEST_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S.*?) \.\.\.(?: (.*))?$").expect("start regex is valid"));

/// Fatal error reported when no `Ran N tests` footer is found.
pub const NOSE_PARSE_FAILED: &str = "parsing failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    TopHeader,
    Name,
    Content,
}

/// Parse a block-style transcript.
#[must_use]
pub fn parse_nose(text: &str) -> ParseResult {
    let mut failures = FailureMap::new();
    let mut test_count: Option<i64> = None;

    let mut state = State::Initial;
    let mut name = String::new();
    let mut message: Vec<&str> = Vec::new();

    for line in stripped_lines(text) {
        if TOP_RULE.is_match(line) {
            if state == State::Content {
                failures.insert(std::mem::take(&mut name), message.join("\n"));
            }
            state = State::TopHeader;
            continue;
        }

        if state == State::TopHeader {
            if let Some(caps) = FAILURE_HEADER.captures(line) {
                name = caps[1].trim().to_string();
                message = vec![line];
                state = State::Name;
                continue;
            }
        }

        if SUB_RULE.is_match(line) {
            match state {
                State::Name => {
                    message.push(line);
                    state = State::Content;
                    continue;
                },
                State::Content => {
                    failures.insert(std::mem::take(&mut name), message.join("\n"));
                    state = State::Initial;
                    continue;
                },
                State::Initial | State::TopHeader => {},
            }
        }

        if state == State::Initial {
            if let Some(count) = RAN_FOOTER
                .captures(line)
                .and_then(|caps| caps[1].parse::<i64>().ok())
            {
                test_count = Some(count);
                continue;
            }
        }

        if state == State::Content {
            message.push(line);
        }
    }

    let warnings = warnings::scan_warnings(text, &TEST_START);

    match test_count {
        Some(count) => ParseResult::complete(failures, warnings, count),
        None => ParseResult::fatal(NOSE_PARSE_FAILED, failures, warnings),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE_EQ: &str = "======================================================================";
    const RULE_DASH: &str = "----------------------------------------------------------------------";

    fn transcript(lines: &[&str]) -> String {
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    #[test]
    fn error_and_fail_blocks_are_recorded() {
        let text = transcript(&[
            "test_parsers.test_foo ... FAIL",
            "test_parsers.test_bar ... ERROR",
            "test_parsers.test_quux ... ok",
            "",
            RULE_EQ,
            "ERROR: test_bar",
            RULE_DASH,
            "aaa",
            "",
            RULE_EQ,
            "FAIL: test_foo",
            RULE_DASH,
            "bbb",
            "",
            RULE_DASH,
            "Ran 3 tests in 0.002s",
            "",
            "FAILED (errors=1, failures=1)",
        ]);

        let result = parse_nose(&text);

        assert!(!result.is_fatal());
        assert_eq!(result.test_count(), 3);
        assert_eq!(
            result.failures().get("test_bar").map(String::as_str),
            Some(format!("ERROR: test_bar\n{RULE_DASH}\naaa\n").as_str())
        );
        assert_eq!(
            result.failures().get("test_foo").map(String::as_str),
            Some(format!("FAIL: test_foo\n{RULE_DASH}\nbbb\n").as_str())
        );
        assert_eq!(result.failures().len(), 2);
    }

    #[test]
    fn unclosed_block_is_dropped() {
        let text = transcript(&[
            RULE_EQ,
            "FAIL: test_closed",
            RULE_DASH,
            "body",
            RULE_DASH,
            "Ran 2 tests in 1s",
            RULE_EQ,
            "FAIL: test_open",
            RULE_DASH,
            "never closed",
        ]);

        let result = parse_nose(&text);

        assert_eq!(result.test_count(), 2);
        assert!(result.failures().contains_key("test_closed"));
        assert!(!result.failures().contains_key("test_open"));
    }

    #[test]
    fn duplicate_names_keep_last_text() {
        let text = transcript(&[
            RULE_EQ,
            "FAIL: test_dup",
            RULE_DASH,
            "first",
            RULE_EQ,
            "ERROR: test_dup",
            RULE_DASH,
            "second",
            RULE_DASH,
            "Ran 1 test in 0.1s",
        ]);

        let result = parse_nose(&text);

        let text = &result.failures()["test_dup"];
        assert!(text.starts_with("ERROR: test_dup"));
        assert!(text.ends_with("second"));
    }

    #[test]
    fn trailing_whitespace_is_ignored() {
        let text = format!("{RULE_EQ}   \nFAIL: test_ws  \n{RULE_DASH}\t\nbody   \n{RULE_DASH}\nRan 1 test in 0s  \n");

        let result = parse_nose(&text);

        assert_eq!(result.test_count(), 1);
        assert_eq!(
            result.failures()["test_ws"],
            format!("FAIL: test_ws\n{RULE_DASH}\nbody")
        );
    }

    #[test]
    fn ran_line_inside_block_is_not_a_footer() {
        let text = transcript(&[RULE_EQ, "FAIL: t", RULE_DASH, "Ran 9 tests in 1s"]);

        let result = parse_nose(&text);

        assert!(result.is_fatal());
        assert!(result.failures().is_empty());
    }

    #[test]
    fn empty_transcript_is_fatal() {
        let result = parse_nose("");

        assert!(result.is_fatal());
        assert_eq!(result.test_count(), -1);
        assert_eq!(result.fatal_error(), Some(NOSE_PARSE_FAILED));
    }

    #[test]
    fn header_without_body_is_not_recorded() {
        let text = transcript(&[RULE_EQ, "FAIL: lonely", RULE_EQ, "Ran 1 test in 0s"]);

        let result = parse_nose(&text);

        assert!(result.failures().is_empty());
    }

    #[test]
    fn warnings_are_attributed_to_running_test() {
        let text = transcript(&[
            "pkg.test_a ... ",
            "/src/pkg/mod.py:10: DeprecationWarning: old api",
            "  warnings.warn('old api')",
            "ok",
            "pkg.test_b ... ok",
            RULE_DASH,
            "Ran 2 tests in 0.1s",
        ]);

        let result = parse_nose(&text);

        assert_eq!(result.warnings().len(), 1);
        let (key, block) = result.warnings().iter().next().unwrap();
        assert!(key.starts_with("/src/pkg/mod.py:10: DeprecationWarning: old api"));
        assert!(block.contains("pkg.test_a"));
        assert!(!block.contains("pkg.test_b"));
    }
}
