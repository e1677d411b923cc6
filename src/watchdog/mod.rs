//! Stall watchdog: escalation policy, stage capabilities, and the
//! per-stage controller.

pub mod controller;
pub mod observer;
pub mod policy;

pub use controller::{StallRecoverySummary, StallWatchdog, WatchdogContext};
pub use observer::{Clock, LogKind, LogMeta, LogSink, StageObserver, SystemClock, TracingLogSink};
pub use policy::{resolve_stall_action, StallAction, StallDecision, StallInputs, StallPolicy};
