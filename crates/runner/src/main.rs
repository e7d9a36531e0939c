//! Server test runner entry point
//!
//! Usage: `run-server-tests <root_folder_path> <test_lib_dir> [--test NAME]
//! [--benchmark] [--server BACKEND] [--valgrind]`
//!
//! Exits 0 when every scenario passed, 1 when any failed and 2 when the run
//! itself could not complete.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use harness_runner::config::Readiness;
use harness_runner::{BackendKind, HarnessConfig, Orchestrator, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "run-server-tests")]
#[command(about = "Run PHP server tests with the agent loaded, across hosting backends")]
#[command(version)]
struct Args {
    /// Root folder holding one directory per test
    root_folder_path: PathBuf,

    /// Directory with the shared test libraries
    test_lib_dir: PathBuf,

    /// Run a single test from the root folder
    #[arg(long)]
    test: Option<String>,

    /// Run the suite benchmark script instead of each test script
    #[arg(long)]
    benchmark: bool,

    /// Hosting backend
    #[arg(long, value_enum, default_value = "php-built-in")]
    server: BackendKind,

    /// Run the built-in server under valgrind
    #[arg(long)]
    valgrind: bool,

    /// Maximum number of tests running at once
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Harness config file (TOML)
    #[arg(long, default_value = "server-tests.toml", env = "SERVER_TESTS_CONFIG")]
    config: PathBuf,

    /// Write a JSON report here
    #[arg(long)]
    report: Option<PathBuf>,

    /// Poll ports for readiness instead of sleeping the full grace period
    #[arg(long)]
    probe_readiness: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")
        .and_then(|rt| rt.block_on(async_main(args)));

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    }
}

async fn async_main(args: Args) -> anyhow::Result<bool> {
    let mut config = HarnessConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(max_parallel) = args.max_parallel {
        config.max_parallel = max_parallel;
    }
    if args.probe_readiness {
        config.timing.readiness = Readiness::Probe;
    }
    config.validate()?;

    let root_dir = args
        .root_folder_path
        .canonicalize()
        .with_context(|| format!("test root {}", args.root_folder_path.display()))?;
    let lib_dir = args
        .test_lib_dir
        .canonicalize()
        .with_context(|| format!("test lib dir {}", args.test_lib_dir.display()))?;

    let backend = args.server.create(&config);
    let orchestrator = Orchestrator::new(
        config,
        backend,
        RunOptions {
            root_dir,
            lib_dir,
            benchmark: args.benchmark,
            memory_checker: args.valgrind,
        },
    );

    let report = orchestrator.run(args.test.as_deref()).await?;
    print!("{}", report.summary());

    Ok(report.finish(args.report.as_deref()))
}
