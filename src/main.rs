#![forbid(unsafe_code)]

//! `index-warden`: run tracked subprocesses and inspect watchdog policy.
//!
//! `run` spawns one child through the process-wide registry and prints its
//! result as JSON. `policy` prints the resolved stall thresholds for a mode.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use index_warden::config::GlobalConfig;
use index_warden::subprocess::hooks::{ShutdownHooks, ShutdownSignal};
use index_warden::subprocess::kill_tree::KillSignal;
use index_warden::subprocess::{with_tracked_scope, SpawnOptions, SubprocessRegistry};
use index_warden::watchdog::policy::stage1_ownership_prefix;
use index_warden::watchdog::StallPolicy;
use index_warden::{AppError, Result};

/// Conventional exit code of a command killed by `timeout(1)`.
const EXIT_TIMEOUT: u8 = 124;
/// Exit code when the child could not be started.
const EXIT_NOT_STARTED: u8 = 127;
/// Exit code for usage and configuration errors.
const EXIT_USAGE: u8 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "index-warden", about = "Tracked subprocess runner and stall watchdog", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spawn one tracked child and print its result as JSON.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Ownership scope the child is registered under.
        #[arg(long)]
        scope: Option<String>,

        /// Wall-clock budget in milliseconds; `0` waits forever.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Per-stream capture cap, overriding the configuration.
        #[arg(long)]
        max_output_bytes: Option<usize>,

        /// Executable to run.
        program: String,

        /// Arguments passed to the executable.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the resolved processing-stage stall policy as JSON.
    Policy {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Indexing mode used in the ownership prefix.
        #[arg(long, default_value = "code")]
        mode: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyReport<'a> {
    mode: &'a str,
    ownership_prefix: String,
    policy: StallPolicy,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;

    let code = match cli.command {
        Command::Run {
            config,
            scope,
            timeout_ms,
            max_output_bytes,
            program,
            args,
        } => {
            let config = load_config(config)?;
            let _guard = ShutdownHooks::global().exit_guard();
            runtime.block_on(run(&config, scope, timeout_ms, max_output_bytes, &program, args))?
        }
        Command::Policy { config, mode } => print_policy(&load_config(config)?, &mode)?,
    };
    Ok(code)
}

fn load_config(path: Option<PathBuf>) -> Result<GlobalConfig> {
    let config = match path {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    info!("configuration loaded");
    Ok(config)
}

async fn run(
    config: &GlobalConfig,
    scope: Option<String>,
    timeout_ms: Option<u64>,
    max_output_bytes: Option<usize>,
    program: &str,
    args: Vec<String>,
) -> Result<ExitCode> {
    let registry = SubprocessRegistry::init_global(&config.subprocess);
    let hooks = ShutdownHooks::global();
    hooks.install();

    let cancel = CancellationToken::new();
    let mut shutdown = hooks.subscribe();
    let watcher_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        let signal = shutdown.recv().await.ok();
        watcher_cancel.cancel();
        signal
    });

    let mut options = SpawnOptions {
        kill_signal: KillSignal::parse(&config.subprocess.kill_signal)?,
        reject_on_non_zero_exit: false,
        ..SpawnOptions::default()
    }
    .with_cancel(cancel.clone())
    .with_kill_grace_ms(config.subprocess.kill_grace_ms)
    .with_max_output_bytes(max_output_bytes.unwrap_or(config.subprocess.max_output_bytes));
    if let Some(timeout_ms) = timeout_ms {
        options = options.with_timeout_ms(timeout_ms);
    }

    let spawned = registry.spawn(program, args, options);
    let outcome = match scope {
        Some(scope) => with_tracked_scope(scope, spawned).await,
        None => spawned.await,
    };

    let interrupted = if cancel.is_cancelled() {
        watcher.await.ok().flatten()
    } else {
        watcher.abort();
        None
    };

    match outcome {
        Ok(result) => {
            print_json(&result)?;
            Ok(exit_code(result.exit_code.unwrap_or(1)))
        }
        Err(err) => {
            if let Some(result) = err.result() {
                print_json(result)?;
            }
            error!(%err, code = err.code(), "subprocess failed");
            Ok(match err {
                AppError::Timeout { .. } => ExitCode::from(EXIT_TIMEOUT),
                AppError::Aborted { .. } => exit_code(
                    interrupted.map_or(ShutdownSignal::Interrupt.exit_code(), ShutdownSignal::exit_code),
                ),
                AppError::Spawn { result, .. } if result.pid.is_none() => {
                    ExitCode::from(EXIT_NOT_STARTED)
                }
                AppError::Spawn { result, .. } => match interrupted {
                    Some(signal) => exit_code(signal.exit_code()),
                    None => exit_code(result.exit_code.unwrap_or(1)),
                },
                _ => ExitCode::from(EXIT_USAGE),
            })
        }
    }
}

fn print_policy(config: &GlobalConfig, mode: &str) -> Result<ExitCode> {
    let report = PolicyReport {
        mode,
        ownership_prefix: stage1_ownership_prefix(&config.ownership, mode),
        policy: StallPolicy::resolve(&config.processing_thresholds()),
    };
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Config(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code & 0xff).map_or_else(
        |_| {
            warn!(code, "exit code out of range");
            ExitCode::FAILURE
        },
        ExitCode::from,
    )
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
