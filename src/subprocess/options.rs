//! Spawn options, their documented defaults, and bounded output capture.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::kill_tree::KillSignal;
use super::CapturedOutput;

/// Default per-stream capture cap.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Default window between the polite kill signal and `SIGKILL`.
pub const DEFAULT_KILL_GRACE_MS: u64 = 5_000;

/// Grace used when a termination is forced.
pub const FORCE_KILL_GRACE_MS: u64 = 0;

/// Per-chunk output observer.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Observer invoked with the child pid right after spawn.
pub type SpawnCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// Pipe all three streams (required for capture and `input`).
    #[default]
    Pipe,
    /// Share the parent's streams.
    Inherit,
    /// Connect all streams to the null device.
    Ignore,
}

/// Shape of captured output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// One string per stream.
    #[default]
    Text,
    /// One entry per line.
    Lines,
}

/// Options for [`spawn_subprocess`](super::spawn_subprocess).
///
/// Every field has a documented default; construct with
/// `SpawnOptions::default()` and adjust with the `with_*` helpers.
#[derive(Clone)]
pub struct SpawnOptions {
    /// Working directory; defaults to the parent's.
    pub cwd: Option<PathBuf>,
    /// Full replacement environment; `None` inherits the parent's.
    pub env: Option<HashMap<String, String>>,
    /// Stream wiring. Default: [`StdioMode::Pipe`].
    pub stdio: StdioMode,
    /// Capture stdout; default: `true` when piped.
    pub capture_stdout: Option<bool>,
    /// Capture stderr; default: `true` when piped.
    pub capture_stderr: Option<bool>,
    /// Capture shape. Default: [`OutputMode::Text`].
    pub output_mode: OutputMode,
    /// Per-stream capture cap. Default: [`DEFAULT_MAX_OUTPUT_BYTES`].
    pub max_output_bytes: Option<usize>,
    /// Bytes written to stdin, which is then closed.
    pub input: Option<Vec<u8>>,
    /// Wall-clock budget; `None` or `0` waits forever.
    pub timeout_ms: Option<u64>,
    /// Cooperative cancellation.
    pub cancel: Option<CancellationToken>,
    /// Kill descendants too. Default: `true`.
    pub kill_tree: bool,
    /// First signal of a termination. Default: `SIGTERM`.
    pub kill_signal: KillSignal,
    /// Escalation window. Default: [`DEFAULT_KILL_GRACE_MS`].
    pub kill_grace_ms: Option<u64>,
    /// Start the child in its own process group. Default: `true` on Unix.
    pub detached: Option<bool>,
    /// Fire-and-forget; combined with `detached` opts out of tracking.
    pub unref: bool,
    /// Register for cleanup. Default: `!(detached && unref)`.
    pub cleanup_on_parent_exit: Option<bool>,
    /// Shell interpolation request; always rejected.
    pub shell: bool,
    /// Reject exits outside `expected_exit_codes`. Default: `true`.
    pub reject_on_non_zero_exit: bool,
    /// Acceptable exit codes. Default: `[0]`.
    pub expected_exit_codes: Vec<i32>,
    /// Ownership scope; defaults to the task's bound scope.
    pub ownership_id: Option<String>,
    /// Label used in error messages and diagnostics.
    pub name: Option<String>,
    /// Called with every stdout chunk.
    pub on_stdout: Option<OutputCallback>,
    /// Called with every stderr chunk.
    pub on_stderr: Option<OutputCallback>,
    /// Called once with the pid after a successful spawn.
    pub on_spawn: Option<SpawnCallback>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: None,
            stdio: StdioMode::Pipe,
            capture_stdout: None,
            capture_stderr: None,
            output_mode: OutputMode::Text,
            max_output_bytes: None,
            input: None,
            timeout_ms: None,
            cancel: None,
            kill_tree: true,
            kill_signal: KillSignal::default(),
            kill_grace_ms: None,
            detached: None,
            unref: false,
            cleanup_on_parent_exit: None,
            shell: false,
            reject_on_non_zero_exit: true,
            expected_exit_codes: vec![0],
            ownership_id: None,
            name: None,
            on_stdout: None,
            on_stderr: None,
            on_spawn: None,
        }
    }
}

impl fmt::Debug for SpawnOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnOptions")
            .field("cwd", &self.cwd)
            .field("stdio", &self.stdio)
            .field("output_mode", &self.output_mode)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("timeout_ms", &self.timeout_ms)
            .field("kill_tree", &self.kill_tree)
            .field("kill_signal", &self.kill_signal)
            .field("kill_grace_ms", &self.kill_grace_ms)
            .field("detached", &self.detached)
            .field("unref", &self.unref)
            .field("ownership_id", &self.ownership_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl SpawnOptions {
    /// Set the wall-clock budget.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Register the child under `ownership_id`.
    #[must_use]
    pub fn with_ownership(mut self, ownership_id: impl Into<String>) -> Self {
        self.ownership_id = Some(ownership_id.into());
        self
    }

    /// Cap each captured stream at `max_output_bytes`.
    #[must_use]
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = Some(max_output_bytes);
        self
    }

    /// Accept these exit codes as success.
    #[must_use]
    pub fn with_expected_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.expected_exit_codes = codes;
        self
    }

    /// Set the kill escalation window.
    #[must_use]
    pub fn with_kill_grace_ms(mut self, kill_grace_ms: u64) -> Self {
        self.kill_grace_ms = Some(kill_grace_ms);
        self
    }

    /// Feed `input` to the child's stdin.
    #[must_use]
    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Label the child for messages and diagnostics.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Run the child in `cwd`.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Whether the child gets its own process group.
    #[must_use]
    pub fn resolved_detached(&self) -> bool {
        self.detached.unwrap_or(cfg!(unix))
    }

    /// Whether the child is registered for cleanup.
    #[must_use]
    pub fn resolved_cleanup_on_parent_exit(&self) -> bool {
        self.cleanup_on_parent_exit
            .unwrap_or(!(self.unref && self.resolved_detached()))
    }

    /// Effective per-stream capture cap.
    #[must_use]
    pub fn resolved_max_output_bytes(&self) -> usize {
        resolve_max_output_bytes(self.max_output_bytes)
    }

    /// Effective kill escalation window.
    #[must_use]
    pub fn resolved_kill_grace_ms(&self) -> u64 {
        self.kill_grace_ms.unwrap_or(DEFAULT_KILL_GRACE_MS)
    }

    /// Effective timeout; zero means none.
    #[must_use]
    pub fn resolved_timeout_ms(&self) -> Option<u64> {
        self.timeout_ms.filter(|ms| *ms > 0)
    }

    /// Whether stdout is captured.
    #[must_use]
    pub fn captures_stdout(&self) -> bool {
        self.stdio == StdioMode::Pipe && self.capture_stdout != Some(false)
    }

    /// Whether stderr is captured.
    #[must_use]
    pub fn captures_stderr(&self) -> bool {
        self.stdio == StdioMode::Pipe && self.capture_stderr != Some(false)
    }

    /// Whether `code` settles as success.
    #[must_use]
    pub fn accepts_exit(&self, code: Option<i32>) -> bool {
        !self.reject_on_non_zero_exit || self.expected_exit_codes.contains(&code.unwrap_or(-1))
    }
}

/// Zero and unset both fall back to the default cap.
#[must_use]
pub fn resolve_max_output_bytes(value: Option<usize>) -> usize {
    value.filter(|bytes| *bytes > 0).unwrap_or(DEFAULT_MAX_OUTPUT_BYTES)
}

/// Tail-retaining capture buffer.
///
/// Holds at most `max_bytes`; once full, the oldest bytes are discarded so
/// the end of the stream is always preserved.
#[derive(Debug)]
pub struct OutputCollector {
    enabled: bool,
    max_bytes: usize,
    chunks: VecDeque<Bytes>,
    total: usize,
    truncated: bool,
}

impl OutputCollector {
    /// New collector; a disabled one ignores every push.
    #[must_use]
    pub fn new(enabled: bool, max_bytes: usize) -> Self {
        Self {
            enabled,
            max_bytes: max_bytes.max(1),
            chunks: VecDeque::new(),
            total: 0,
            truncated: false,
        }
    }

    /// Append a chunk, evicting from the front past the cap.
    pub fn push(&mut self, chunk: Bytes) {
        if !self.enabled || chunk.is_empty() {
            return;
        }
        if chunk.len() >= self.max_bytes {
            self.truncated |= chunk.len() > self.max_bytes || self.total > 0;
            self.chunks.clear();
            self.chunks.push_back(chunk.slice(chunk.len() - self.max_bytes..));
            self.total = self.max_bytes;
            return;
        }
        self.total += chunk.len();
        self.chunks.push_back(chunk);
        while self.total > self.max_bytes {
            let excess = self.total - self.max_bytes;
            let Some(front) = self.chunks.pop_front() else {
                break;
            };
            if front.len() <= excess {
                self.total -= front.len();
            } else {
                self.chunks.push_front(front.slice(excess..));
                self.total -= excess;
            }
            self.truncated = true;
        }
    }

    /// Bytes currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Whether any byte was ever evicted.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Retained bytes, oldest first.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Render in `mode`; `None` when capture is disabled.
    #[must_use]
    pub fn to_output(&self, mode: OutputMode) -> Option<CapturedOutput> {
        self.enabled
            .then(|| render_output(&self.to_bytes(), mode))
    }
}

/// Trim a fully buffered stream to its last `max_bytes` and render it.
#[must_use]
pub fn trim_output(raw: &[u8], max_bytes: usize, mode: OutputMode) -> CapturedOutput {
    let start = raw.len().saturating_sub(max_bytes);
    render_output(&raw[start..], mode)
}

fn render_output(bytes: &[u8], mode: OutputMode) -> CapturedOutput {
    let text = String::from_utf8_lossy(bytes).into_owned();
    match mode {
        OutputMode::Text => CapturedOutput::Text(text),
        OutputMode::Lines => {
            let mut lines: Vec<String> = text
                .split('\n')
                .map(|line| line.strip_suffix('\r').unwrap_or(line).to_owned())
                .collect();
            if lines.last().is_some_and(String::is_empty) {
                lines.pop();
            }
            CapturedOutput::Lines(lines)
        }
    }
}
