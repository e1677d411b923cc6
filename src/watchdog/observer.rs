//! Capabilities the watchdog depends on.
//!
//! The stage supplies a [`StageObserver`]; logging goes only through a
//! [`LogSink`]; time comes from a [`Clock`]. Production code uses
//! [`TracingLogSink`] and [`SystemClock`], tests substitute their own.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::diagnostics::{OrderedCompletionSnapshot, Progress, QueueDelayTotals, SchedulerStats};
use crate::AppError;

/// Read access to the stage being watched, plus its abort hooks.
pub trait StageObserver: Send + Sync {
    /// Current progress; `None` before the stage has started counting.
    fn progress(&self) -> Option<Progress>;

    /// Ordered-completion tracker state.
    fn ordered_completion(&self) -> Option<OrderedCompletionSnapshot> {
        None
    }

    /// Opaque ordered-appender state for diagnostics.
    fn ordered_appender_snapshot(&self) -> Option<Value> {
        None
    }

    /// Opaque postings-queue state for diagnostics.
    fn postings_stats(&self) -> Option<Value> {
        None
    }

    /// Scheduler statistics.
    fn scheduler_stats(&self) -> Option<SchedulerStats> {
        None
    }

    /// Queue-delay accumulators.
    fn queue_delay(&self) -> Option<QueueDelayTotals> {
        None
    }

    /// Fail the ordered appender so consumers see the terminal error.
    fn abort_ordered(&self, err: &AppError);

    /// Fail the processing stage.
    fn abort_processing(&self, err: &AppError);
}

/// Severity of a watchdog log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Routine status.
    Status,
    /// Something needs attention.
    Warning,
    /// The stage is failing.
    Error,
}

/// Structured metadata attached to a log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMeta {
    /// Severity.
    pub kind: LogKind,
    /// Additional fields, serialized camelCase.
    pub fields: Map<String, Value>,
}

impl LogMeta {
    /// Metadata with only a kind.
    #[must_use]
    pub fn new(kind: LogKind) -> Self {
        Self {
            kind,
            fields: Map::new(),
        }
    }

    /// Attach a field; values that fail to serialize become `null`.
    #[must_use]
    pub fn field(mut self, key: &str, value: impl Serialize) -> Self {
        self.fields.insert(
            key.to_owned(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
        self
    }

    /// Field lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Fields rendered as one JSON object, including `kind`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert(
            "kind".to_owned(),
            serde_json::to_value(self.kind).unwrap_or(Value::Null),
        );
        Value::Object(object)
    }
}

/// Destination of every watchdog log line.
pub trait LogSink: Send + Sync {
    /// Emit one line.
    fn log_line(&self, message: &str, meta: &LogMeta);
}

/// Forwards watchdog lines to `tracing` at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log_line(&self, message: &str, meta: &LogMeta) {
        let meta = meta.to_json();
        match meta.get("kind").and_then(Value::as_str) {
            Some("error") => error!(target: "index_warden::watchdog", %meta, "{message}"),
            Some("warning") => warn!(target: "index_warden::watchdog", %meta, "{message}"),
            _ => info!(target: "index_warden::watchdog", %meta, "{message}"),
        }
    }
}

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
    }
}
