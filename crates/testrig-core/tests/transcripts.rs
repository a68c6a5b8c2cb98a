//! Transcript scenarios for both dialects, parsed through [`Dialect`].

use std::fs;
use std::path::Path;

use testrig_core::parser::{
    Dialect, NOSE_PARSE_FAILED, PYTEST_INCOMPLETE, PYTEST_LOG_FILENAME,
};

const EQ: &str = "======================================================================";
const DASH: &str = "----------------------------------------------------------------------";

fn nose_transcript() -> String {
    [
        "test_mod.test_ok ... ok",
        "test_mod.test_x ... ERROR",
        "test_mod.test_y ... FAIL",
        "",
        EQ,
        "ERROR: test_mod.test_x",
        DASH,
        "Traceback (most recent call last):",
        "  File \"test_mod.py\", line 3, in test_x",
        "NameError: name 'q' is not defined",
        "",
        EQ,
        "FAIL: test_mod.test_y",
        DASH,
        "AssertionError: 1 != 2",
        "",
        DASH,
        "Ran 3 tests in 0.002s",
        "",
        "FAILED (errors=1, failures=1)",
    ]
    .join("\n")
}

#[test]
fn nose_error_and_fail_blocks() {
    let result = Dialect::Nose.parse(&nose_transcript(), Path::new("."));

    assert!(!result.is_fatal());
    assert_eq!(result.test_count(), 3);
    let names: Vec<_> = result.failures().keys().cloned().collect();
    assert_eq!(names, vec!["test_mod.test_x", "test_mod.test_y"]);
    assert!(result.failures()["test_mod.test_x"].starts_with("ERROR: test_mod.test_x\n"));
    assert!(result.failures()["test_mod.test_x"].contains("NameError"));
    assert!(result.failures()["test_mod.test_y"].contains("AssertionError: 1 != 2"));
}

#[test]
fn nose_missing_footer_is_fatal() {
    let text = nose_transcript().replace("Ran 3 tests in 0.002s", "Segmentation fault");

    let result = Dialect::Nose.parse(&text, Path::new("."));

    assert_eq!(result.test_count(), -1);
    assert_eq!(result.fatal_error(), Some(NOSE_PARSE_FAILED));
}

#[test]
fn nose_empty_transcript_is_fatal() {
    let result = Dialect::Nose.parse("", Path::new("."));

    assert!(result.is_fatal());
    assert!(result.failures().is_empty());
}

#[test]
fn nose_parsing_is_idempotent() {
    let text = nose_transcript();

    let first = Dialect::Nose.parse(&text, Path::new("."));
    let second = Dialect::Nose.parse(&text, Path::new("."));

    assert_eq!(first, second);
}

#[test]
fn nose_warnings_name_every_triggering_test() {
    let text = [
        "test_a.test_one ... /src/pkg/core.py:10: DeprecationWarning: old api",
        "  warnings.warn('old api')",
        "ok",
        "test_a.test_two ... /src/pkg/core.py:10: DeprecationWarning: old api",
        "  warnings.warn('old api')",
        "ok",
        "",
        DASH,
        "Ran 2 tests in 0.010s",
        "",
        "OK",
    ]
    .join("\n");

    let result = Dialect::Nose.parse(&text, Path::new("."));

    assert_eq!(result.test_count(), 2);
    assert_eq!(result.warnings().len(), 1, "{:?}", result.warnings());
    let block = result.warnings().values().next().unwrap();
    assert!(block.contains("DeprecationWarning: old api"));
    assert!(block.contains("    test_a.test_one\n"));
    assert!(block.contains("    test_a.test_two\n"));
}

#[test]
fn pytest_log_failure_and_pass() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join(PYTEST_LOG_FILENAME),
        "F pkg/tests/test_m.py::test_bad\n def test_bad():\n >   assert 0\n E   assert 0\n. pkg/tests/test_m.py::test_good\n",
    )
    .expect("write log");

    let result = Dialect::PytestLog.parse(
        "collected 2 items\n\n==== 1 failed, 1 passed in 1.23 seconds ====\n",
        dir.path(),
    );

    assert!(!result.is_fatal(), "{:?}", result.fatal_error());
    assert_eq!(result.test_count(), 2);
    assert_eq!(result.failures().len(), 1);
    let body = &result.failures()["pkg/tests/test_m.py::test_bad"];
    assert!(body.contains("F pkg/tests/test_m.py::test_bad\ndef test_bad():\n>   assert 0"));
}

#[test]
fn pytest_log_truncated_run_is_untrusted() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join(PYTEST_LOG_FILENAME), "F a.py::t\n boom\n").expect("write log");

    let result = Dialect::PytestLog.parse("collected 9 items\nKilled\n", dir.path());

    assert_eq!(result.test_count(), -1);
    assert_eq!(result.fatal_error(), Some(PYTEST_INCOMPLETE));
    assert!(result.failures().contains_key("a.py::t"));
}

#[test]
fn pytest_log_absent_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");

    let result = Dialect::PytestLog.parse("=== 3 passed in 0.5 seconds ===", dir.path());

    assert!(result.is_fatal());
    assert!(result.fatal_error().unwrap().contains("not found"));
}

#[test]
fn dialect_names_round_trip() {
    for dialect in Dialect::ALL {
        assert_eq!(dialect.name().parse::<Dialect>().unwrap(), dialect);
    }
    let err = "xunit".parse::<Dialect>().unwrap_err();
    assert!(err.to_string().contains("nose"));
}
