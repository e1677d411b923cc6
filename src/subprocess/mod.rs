//! Tracked subprocess library.
//!
//! Every worker the indexer launches goes through this module so it can be
//! found again later: on timeout, on cancellation, when a stage soft-kicks a
//! wedged file, and when the host process itself is shutting down.
//!
//! - [`runner`] spawns children with capture, timeout, and cancellation.
//! - [`registry`] keeps the live set, partitioned by ownership scope.
//! - [`kill_tree`] terminates a child together with its descendants.
//! - [`hooks`] installs process-wide cleanup on signals, panics, and exit.
//! - [`scope`] lets async tasks inherit an ownership scope implicitly.

pub mod hooks;
pub mod kill_tree;
pub mod options;
pub mod registry;
pub mod runner;
pub mod scope;

use serde::Serialize;

pub use options::{OutputMode, SpawnOptions, StdioMode};
pub use registry::{ScopeFilter, SubprocessRegistry, TerminateRequest, TerminationSummary};
pub use runner::{spawn_blocking, spawn_subprocess};
pub use scope::{with_tracked_cancel_scope, with_tracked_scope};

/// Captured stream content in the requested [`OutputMode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CapturedOutput {
    /// The whole (possibly tail-truncated) stream as one string.
    Text(String),
    /// The stream split into lines, without line terminators.
    Lines(Vec<String>),
}

impl CapturedOutput {
    /// Render as a single string regardless of mode.
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Lines(lines) => lines.join("\n"),
        }
    }
}

/// Outcome of one subprocess run, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubprocessResult {
    /// OS process id; `None` when the child never started.
    pub pid: Option<u32>,
    /// Exit code; `None` when killed by a signal or still running.
    pub exit_code: Option<i32>,
    /// Terminating signal name, if any.
    pub signal: Option<String>,
    /// Wall-clock time from spawn request to settlement.
    pub duration_ms: u64,
    /// Captured standard output, when capture was enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<CapturedOutput>,
    /// Captured standard error, when capture was enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<CapturedOutput>,
}

impl SubprocessResult {
    /// Result for a child that never produced a process.
    #[must_use]
    pub fn not_started(duration_ms: u64) -> Self {
        Self {
            pid: None,
            exit_code: None,
            signal: None,
            duration_ms,
            stdout: None,
            stderr: None,
        }
    }
}
