//! testrig - differential regression tests for downstream packages
//!
//! Runs each selected catalog test against an "old" and a "new" dependency
//! stack and reports failures that only appear under "new".

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use testrig_core::buildenv::BuildEnv;
use testrig_core::scheduler::DEFAULT_CACHE_DIR;
use testrig_core::{Catalog, JobScheduler, PythonToolchain, RunOptions, exit_codes};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// testrig - differential regression tests for downstream packages
#[derive(Parser, Debug)]
#[command(name = "testrig")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Test catalog
    #[arg(long, default_value = "testrig.toml")]
    config: PathBuf,

    /// Don't cache git repositories
    #[arg(short = 'g', long)]
    no_git_cache: bool,

    /// Don't clean up before or after
    #[arg(short = 'n', long)]
    no_cleanup: bool,

    /// Echo commands and show pre-existing failures
    #[arg(short, long)]
    verbose: bool,

    /// Parallel jobs (0 = one less than the number of CPUs)
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Directory for environments, caches and logs
    #[arg(long, default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    /// Kill any install or test command running longer than this
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Python interpreter used to create environments
    #[arg(long, default_value = "python3")]
    python: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// List catalog tests and exit
    #[arg(long)]
    list: bool,

    /// Tests to run; also glob patterns, e.g. '*scipy-dev*'
    #[arg(value_name = "TESTS")]
    tests: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (filter, level_ok) = match EnvFilter::try_new(&cli.log_level) {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new("warn"), false),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
    if !level_ok {
        tracing::warn!(level = %cli.log_level, "invalid log level, using warn");
    }

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::from(exit_codes::CONFIG_ERROR)
        },
    }
}

fn run(cli: &Cli) -> Result<u8> {
    let catalog = Catalog::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!(config = %cli.config.display(), tests = catalog.tests().len(), "catalog loaded");

    if cli.list {
        for test in catalog.tests() {
            println!("{}", test.name);
        }
        return Ok(exit_codes::SUCCESS);
    }

    let selected = catalog.select(&cli.tests).context("invalid test selection")?;

    let options = RunOptions {
        cache_dir: cli.cache_dir.clone(),
        cleanup: !cli.no_cleanup,
        git_cache: !cli.no_git_cache,
        verbose: cli.verbose,
        jobs: cli.jobs,
        command_timeout: cli.timeout.map(Duration::from_secs),
        build_env: BuildEnv::detect(),
        ..RunOptions::default()
    };
    let toolchain = PythonToolchain::default().with_python(&cli.python);
    tracing::debug!(
        selected = selected.len(),
        jobs = cli.jobs,
        cache = %cli.cache_dir.display(),
        python = %cli.python.display(),
        "starting scheduler"
    );

    let summary = JobScheduler::new(options, &toolchain)
        .run(&selected)
        .context("test run aborted")?;
    Ok(summary.exit_code())
}
