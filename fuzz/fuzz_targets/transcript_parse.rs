//! Fuzz harness for the transcript parsers.
//!
//! Feeds arbitrary bytes, decoded lossily the way captured logs are, to
//! both dialects and the classifier. None of them may panic, and parsing
//! must be deterministic.

#![no_main]
use std::path::Path;

use libfuzzer_sys::fuzz_target;
use testrig_core::classify::{ReportOptions, Verdict, classify};
use testrig_core::parser::Dialect;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    // No pytest.log exists here, so the pytest dialect must report fatal.
    let missing_log = Path::new("/nonexistent/testrig-fuzz");

    for dialect in Dialect::ALL {
        let first = dialect.parse(&text, missing_log);
        let second = dialect.parse(&text, missing_log);
        assert_eq!(first, second);

        if first.is_fatal() {
            assert_eq!(first.test_count(), -1);
            let outcome = classify("fuzz", &first, &second, ReportOptions { verbose: true });
            assert_eq!(outcome.verdict, Verdict::Error);
        } else {
            let outcome = classify("fuzz", &first, &second, ReportOptions::default());
            assert_eq!(outcome.verdict, Verdict::Ok);
        }
    }
});
