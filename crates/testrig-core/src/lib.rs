//! # testrig-core
//!
//! Differential regression testing of a downstream package against two
//! versions of its dependency stack.
//!
//! For every catalog test the same command runs in an "old" and a "new"
//! disposable environment. Both transcripts are parsed into failure and
//! warning maps, and only failures that appear under "new" but not under
//! "old" count as regressions.
//!
//! ## Pipeline
//!
//! - [`catalog`] loads the test catalog and selects tests.
//! - [`scheduler`] runs them, sequentially or on a worker pool, each variant
//!   in a [`fixture::Fixture`] while a [`heartbeat::HeartbeatMonitor`]
//!   reports liveness.
//! - [`parser`] turns transcripts into [`parser::ParseResult`]s.
//! - [`classify`] compares the two results of one test.
//! - [`summary`] aggregates verdicts, the exit status and `summary.json`.
//!
//! Shared caches are guarded by [`lock::ResourceLock`]; all user-facing
//! output goes through one [`context::RunContext`].
//!
//! ## Example
//!
//! ```rust
//! use std::path::Path;
//!
//! use testrig_core::classify::{ReportOptions, Verdict, classify};
//! use testrig_core::parser::Dialect;
//!
//! let old = Dialect::Nose.parse("Ran 2 tests in 0.1s\n\nOK\n", Path::new("."));
//! let new = Dialect::Nose.parse("Ran 2 tests in 0.1s\n\nOK\n", Path::new("."));
//!
//! let result = classify("example", &old, &new, ReportOptions::default());
//! assert_eq!(result.verdict, Verdict::Ok);
//! assert_eq!(result.counts(), (2, 0, 0));
//! ```

#![warn(missing_docs)]
#![allow(clippy::doc_markdown)]

pub mod buildenv;
pub mod catalog;
pub mod classify;
pub mod context;
pub mod fixture;
pub mod heartbeat;
pub mod lock;
pub mod parser;
pub mod scheduler;
pub mod summary;

pub use catalog::{Catalog, CatalogError, TestSpec};
pub use classify::{ClassificationResult, Verdict, classify};
pub use context::RunContext;
pub use fixture::{Fixture, FixtureConfig, FixtureError, PythonToolchain, Toolchain};
pub use lock::{LockError, ResourceLock};
pub use parser::{Dialect, ParseResult};
pub use scheduler::{JobScheduler, RunOptions, SchedulerError};
pub use summary::{RunSummary, SummaryEntry, exit_codes};
