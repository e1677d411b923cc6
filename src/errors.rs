//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::subprocess::SubprocessResult;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Counters captured when a stage is aborted for making no progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallFailure {
    /// Milliseconds since the last progress tick.
    pub idle_ms: u64,
    /// Files completed when the stall was declared.
    pub progress_done: u64,
    /// Files expected in total.
    pub progress_total: u64,
    /// Files still in flight.
    pub in_flight: usize,
    /// Completed results waiting on ordered emission.
    pub ordered_pending: u64,
    /// Tracked subprocesses still registered under the stage prefix.
    pub tracked_subprocesses: usize,
    /// Soft-kick attempts spent before the abort.
    pub soft_kick_attempts: u32,
}

/// Crate error enumeration covering every failure mode.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Spawn failure or unexpected exit; carries the partial result.
    Spawn {
        /// Human-readable failure description.
        message: String,
        /// Whatever was observed before the failure.
        result: Box<SubprocessResult>,
    },
    /// Caller asked for shell interpolation, which is never permitted.
    ShellDisabled,
    /// The child outlived its wall-clock budget and was tree-killed.
    Timeout {
        /// Budget that was exceeded.
        timeout_ms: u64,
        /// Output captured before the kill.
        result: Box<SubprocessResult>,
    },
    /// The cancellation token fired before the child settled.
    Aborted {
        /// Output captured before the kill.
        result: Box<SubprocessResult>,
    },
    /// A stage made no forward progress past its hard-abort threshold.
    StallTimeout(StallFailure),
    /// A termination attempt failed.
    Kill(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Stable machine-readable code for log metadata.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_INVALID",
            Self::Spawn { .. } | Self::ShellDisabled => "SUBPROCESS_FAILED",
            Self::Timeout { .. } => "SUBPROCESS_TIMEOUT",
            Self::Aborted { .. } => "ABORT_ERR",
            Self::StallTimeout(_) => "FILE_PROCESS_STALL_TIMEOUT",
            Self::Kill(_) => "KILL_FAILED",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Partial subprocess result for spawn, timeout, and abort failures.
    #[must_use]
    pub fn result(&self) -> Option<&SubprocessResult> {
        match self {
            Self::Spawn { result, .. } | Self::Timeout { result, .. } | Self::Aborted { result } => {
                Some(result)
            }
            _ => None,
        }
    }

    /// Whether the job queue may retry the failed unit of work.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn { message, .. } => write!(f, "spawn: {message}"),
            Self::ShellDisabled => {
                write!(f, "spawn: shell mode is disabled; pass the command and args directly")
            }
            Self::Timeout { timeout_ms, .. } => {
                write!(f, "timeout: subprocess exceeded {timeout_ms}ms")
            }
            Self::Aborted { .. } => write!(f, "aborted: operation aborted"),
            Self::StallTimeout(stall) => write!(
                f,
                "stall: processing stalled for {}ms at {}/{}",
                stall.idle_ms, stall.progress_done, stall.progress_total
            ),
            Self::Kill(msg) => write!(f, "kill: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
