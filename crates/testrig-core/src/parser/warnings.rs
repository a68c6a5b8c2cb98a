//! Warning sub-scan shared by both dialects.
//!
//! Python-style warnings are printed as
//!
//! ```text
//! /path/to/module.py:123: DeprecationWarning: some message
//!   offending_source_line()
//! ```
//!
//! The scan tracks which test is currently running (via a dialect-specific
//! start marker) and aggregates, per `(location, message)` key, the set of
//! tests that triggered it. Indented continuation lines extend the key of the
//! warning they follow.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use super::{BLOCK_RULE, WarningMap, stripped_lines};

static WARNING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?):([0-9]+): ([A-Za-z_][A-Za-z0-9_]*Warning): (.*)$")
        .expect("warning regex is valid")
});

/// Test name recorded for warnings emitted before any test started.
const NO_TEST: &str = "<module import>";

/// Scan `text` for warnings, attributing each to the test most recently
/// matched by `test_start` (capture group 1). An optional capture group 2
/// holds the rest of a test-start line, which may itself be a warning.
#[must_use]
pub fn scan_warnings(text: &str, test_start: &Regex) -> WarningMap {
    let mut seen: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut current_test: Option<String> = None;
    let mut open_key: Option<(String, String)> = None;

    for line in stripped_lines(text) {
        let mut candidate = line;
        if let Some(caps) = test_start.captures(line) {
            current_test = Some(caps[1].trim().to_string());
            open_key = None;
            match caps.get(2) {
                Some(rest) => candidate = rest.as_str(),
                None => continue,
            }
        }

        if let Some(caps) = WARNING_LINE.captures(candidate) {
            let key = format!("{}:{}: {}: {}", caps[1].trim(), &caps[2], &caps[3], &caps[4]);
            let test = current_test.clone().unwrap_or_else(|| NO_TEST.to_string());
            seen.entry(key.clone()).or_default().insert(test.clone());
            open_key = Some((key, test));
            continue;
        }

        if let Some((key, test)) = open_key.take() {
            if line.starts_with("  ") {
                // Only this occurrence moves to the extended key.
                if let Some(tests) = seen.get_mut(&key) {
                    tests.remove(&test);
                    if tests.is_empty() {
                        seen.remove(&key);
                    }
                }
                let extended = format!("{key}\n{line}");
                seen.entry(extended.clone()).or_default().insert(test.clone());
                open_key = Some((extended, test));
            }
        }
    }

    seen.into_iter()
        .map(|(key, tests)| {
            let mut block = format!("{BLOCK_RULE}\n{key}\n\nTriggered by:\n");
            for test in &tests {
                block.push_str("    ");
                block.push_str(test);
                block.push('\n');
            }
            (key, block)
        })
        .collect()
}
