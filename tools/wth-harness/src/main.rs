//! wasi-threads test harness
//!
//! Runs one test module and turns its result into a process exit code:
//! 0 when the test passed, 1 for a failed test or any harness error.
//!
//! # Commands
//!
//! - `run <module.wasm>`: execute natively through the wasmtime host
//! - `serve <module.wasm>`: serve the browser test page and wait for the
//!   page to post its report to `/exit`
//!
//! # Environment Variables
//!
//! - `WTH_POOL_SIZE`: worker pool size for `run` (default 8)
//! - `WTH_PORT`: listen port for `serve` (default 0, any free port)
//! - `RUST_LOG`: log filter when neither `--debug` nor `--verbose` is set

mod run;
mod serve;
mod skip;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use wth_host::{HostConfig, TestReport, DEFAULT_POOL_SIZE};

use crate::serve::ServeOptions;

/// wasi-threads test harness
#[derive(Parser, Debug)]
#[command(name = "wth-harness")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run modules even if they are on the skip list
    #[arg(long, global = true)]
    no_skip: bool,

    /// Print the test report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the module natively
    Run {
        module: PathBuf,

        /// Worker pool size
        #[arg(long, env = "WTH_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
        pool_size: usize,

        /// Give up if the pool is not ready after this many seconds
        #[arg(long, value_name = "SECS", default_value_t = 30)]
        warm_up_timeout: u64,

        /// Arguments passed to the guest after argv[0]
        #[arg(last = true)]
        guest_args: Vec<String>,
    },
    /// Serve the browser test page for the module
    Serve {
        module: PathBuf,

        /// Listen port
        #[arg(long, env = "WTH_PORT", default_value_t = 0)]
        port: u16,

        /// Directory holding the test page and its scripts
        #[arg(long, default_value = "web")]
        web_dir: PathBuf,

        /// Keep serving for manual testing until Ctrl+C
        #[arg(long)]
        headful: bool,

        /// Fail if the page has not reported after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

impl Command {
    fn module(&self) -> &PathBuf {
        match self {
            Command::Run { module, .. } | Command::Serve { module, .. } => module,
        }
    }
}

fn init_tracing(args: &Args) {
    // --debug > --verbose > RUST_LOG > "warn"
    let filter = if args.debug {
        EnvFilter::new("debug,cranelift_codegen=warn,wasmtime_cranelift=warn,hyper=warn")
    } else if args.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();
}

async fn execute(command: Command) -> anyhow::Result<TestReport> {
    match command {
        Command::Run {
            module,
            pool_size,
            warm_up_timeout,
            guest_args,
        } => {
            let mut config = HostConfig {
                pool_size,
                warm_up_timeout_ms: Some(warm_up_timeout.saturating_mul(1000)),
                ..HostConfig::default()
            };
            config.args.extend(guest_args);
            run::run(&module, config).await
        }
        Command::Serve {
            module,
            port,
            web_dir,
            headful,
            timeout,
        } => {
            serve::serve(ServeOptions {
                module,
                web_dir,
                port,
                headful,
                timeout: timeout.map(Duration::from_secs),
            })
            .await
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    let module = args.command.module().clone();
    if !args.no_skip && skip::should_skip(&module) {
        info!(path = %module.display(), "on skip list, not running");
        return ExitCode::SUCCESS;
    }

    let json = args.json;
    let report = match execute(args.command).await {
        Ok(report) => report,
        Err(err) => TestReport::fail(format!("{err:#}")),
    };

    if json {
        match serde_json::to_string(&report) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("failed to encode report: {err}"),
        }
    }
    if let Some(error) = &report.error {
        eprintln!("Test failed: {error}");
    } else if !report.passed {
        eprintln!("Test failed: no error reported");
    }
    ExitCode::from(report.exit_code() as u8)
}
