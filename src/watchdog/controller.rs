//! Stall watchdog for one processing stage.
//!
//! Owns the escalation state (`healthy -> soft-kicking -> healthy | aborted`)
//! and three interval timers: stall snapshots, progress heartbeats, and the
//! abort poll. Every timer tick ends in [`StallWatchdog::evaluate_stalled_processing`],
//! which decides under the state lock and acts outside it.
//!
//! Timer tasks hold only a weak reference, so dropping the last
//! [`StallWatchdog`] handle stops them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::observer::{Clock, LogKind, LogMeta, LogSink, StageObserver};
use super::policy::{
    build_heartbeat_text, resolve_stall_action, HeartbeatInput, StallAction, StallInputs,
    StallPolicy,
};
use crate::diagnostics::{
    build_processing_stall_snapshot, format_oldest_in_flight, format_scheduler_summary,
    format_stalled_file_text, round_secs, summarize_soft_kick_cleanup, InFlightFiles, Progress,
    StallSnapshot, StallSnapshotInput,
};
use crate::errors::StallFailure;
use crate::subprocess::registry::{ScopeFilter, SubprocessRegistry, TerminateRequest};
use crate::AppError;

/// Minimum spacing between two logged stall snapshots.
pub const STALL_SNAPSHOT_LOG_COOLDOWN_MS: u64 = 30_000;

/// Distinct ownership scopes a single soft-kick may target.
pub const SOFT_KICK_TARGET_LIMIT: usize = 3;

const STAGE: &str = "processing";

/// Everything a watchdog is constructed from.
pub struct WatchdogContext {
    /// Indexing mode, used in log metadata.
    pub mode: String,
    /// Resolved thresholds.
    pub policy: StallPolicy,
    /// Stage ownership prefix, without the trailing `:`.
    pub ownership_prefix: String,
    /// When the stage began processing.
    pub process_start_ms: u64,
    /// Files currently in flight.
    pub in_flight: InFlightFiles,
    /// Registry holding the stage's worker subprocesses.
    pub registry: SubprocessRegistry,
    /// The stage being watched.
    pub observer: Arc<dyn StageObserver>,
    /// Log destination.
    pub log: Arc<dyn LogSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Soft-kick and abort counters for the stage summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallRecoverySummary {
    /// Soft-kicks since the last progress tick.
    pub soft_kick_attempts: u32,
    /// Soft-kicks that terminated at least one child.
    pub soft_kick_successful_attempts: u32,
    /// Progress ticks that cleared a non-zero attempt counter.
    pub soft_kick_reset_count: u32,
    /// Soft-kick threshold.
    pub soft_kick_threshold_ms: u64,
    /// Soft-kick cooldown.
    pub soft_kick_cooldown_ms: u64,
    /// Soft-kick budget.
    pub soft_kick_max_attempts: u32,
    /// Abort threshold.
    pub stall_abort_ms: u64,
}

#[derive(Debug, Default)]
struct WatchdogState {
    last_progress_at_ms: u64,
    soft_kick_attempts: u32,
    soft_kick_success_count: u32,
    soft_kick_reset_count: u32,
    soft_kick_in_flight: bool,
    last_soft_kick_at_ms: u64,
    abort_triggered: bool,
    last_stall_snapshot_at_ms: u64,
}

#[derive(Debug, Default)]
struct TimerSet {
    stall_snapshot: Option<CancellationToken>,
    progress_heartbeat: Option<CancellationToken>,
    stall_abort: Option<CancellationToken>,
}

impl TimerSet {
    fn cancel_all(&mut self) {
        for token in [
            self.stall_snapshot.take(),
            self.progress_heartbeat.take(),
            self.stall_abort.take(),
        ]
        .into_iter()
        .flatten()
        {
            token.cancel();
        }
    }
}

struct Inner {
    mode: String,
    policy: StallPolicy,
    scope_prefix: String,
    process_start_ms: u64,
    in_flight: InFlightFiles,
    registry: SubprocessRegistry,
    observer: Arc<dyn StageObserver>,
    log: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
    state: Mutex<WatchdogState>,
    timers: Mutex<TimerSet>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_all();
    }
}

/// Handle to one stage's watchdog. Clones share state.
#[derive(Clone)]
pub struct StallWatchdog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StallWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StallWatchdog")
            .field("mode", &self.inner.mode)
            .field("policy", &self.inner.policy)
            .field("scope_prefix", &self.inner.scope_prefix)
            .finish_non_exhaustive()
    }
}

/// Timer kinds, one task each.
#[derive(Debug, Clone, Copy)]
enum TimerKind {
    StallSnapshot,
    ProgressHeartbeat,
    StallAbort,
}

impl StallWatchdog {
    /// Build a watchdog; progress is considered fresh as of now.
    #[must_use]
    pub fn new(context: WatchdogContext) -> Self {
        let now = context.clock.now_ms();
        Self {
            inner: Arc::new(Inner {
                mode: context.mode,
                policy: context.policy,
                scope_prefix: format!("{}:", context.ownership_prefix),
                process_start_ms: context.process_start_ms,
                in_flight: context.in_flight,
                registry: context.registry,
                observer: context.observer,
                log: context.log,
                clock: context.clock,
                state: Mutex::new(WatchdogState {
                    last_progress_at_ms: now,
                    ..WatchdogState::default()
                }),
                timers: Mutex::new(TimerSet::default()),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Resolved thresholds.
    #[must_use]
    pub fn policy(&self) -> StallPolicy {
        self.inner.policy
    }

    /// Prefix (with trailing `:`) scoping this stage's subprocesses.
    #[must_use]
    pub fn scope_prefix(&self) -> &str {
        &self.inner.scope_prefix
    }

    /// Whether the stage has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.state().abort_triggered
    }

    /// Current soft-kick and abort counters.
    #[must_use]
    pub fn stall_recovery_summary(&self) -> StallRecoverySummary {
        let state = self.inner.state();
        let policy = &self.inner.policy;
        StallRecoverySummary {
            soft_kick_attempts: state.soft_kick_attempts,
            soft_kick_successful_attempts: state.soft_kick_success_count,
            soft_kick_reset_count: state.soft_kick_reset_count,
            soft_kick_threshold_ms: policy.stall_soft_kick_ms,
            soft_kick_cooldown_ms: policy.stall_soft_kick_cooldown_ms,
            soft_kick_max_attempts: policy.stall_soft_kick_max_attempts,
            stall_abort_ms: policy.stall_abort_ms,
        }
    }

    /// Record forward progress; clears any spent soft-kick attempts.
    pub fn on_progress_tick(&self) {
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state();
        state.last_progress_at_ms = now;
        if state.soft_kick_attempts > 0 {
            state.soft_kick_attempts = 0;
            state.last_soft_kick_at_ms = 0;
            state.soft_kick_reset_count += 1;
        }
    }

    /// Start the snapshot and heartbeat timers that are enabled and not
    /// already running. Requires a tokio runtime.
    pub fn start_timers(&self) {
        let mut timers = self.inner.timers();
        if timers.stall_snapshot.is_none() {
            if let Some(period) = self.inner.policy.snapshot_interval_ms() {
                timers.stall_snapshot =
                    Some(self.spawn_timer(period, TimerKind::StallSnapshot));
            }
        }
        if timers.progress_heartbeat.is_none() && self.inner.policy.progress_heartbeat_ms > 0 {
            timers.progress_heartbeat = Some(self.spawn_timer(
                self.inner.policy.progress_heartbeat_ms,
                TimerKind::ProgressHeartbeat,
            ));
        }
    }

    /// Start the abort poll timer if abort is enabled and it is not running.
    pub fn ensure_stall_abort_timer(&self) {
        let mut timers = self.inner.timers();
        if timers.stall_abort.is_some() {
            return;
        }
        if let Some(period) = self.inner.policy.abort_poll_interval_ms() {
            timers.stall_abort = Some(self.spawn_timer(period, TimerKind::StallAbort));
        }
    }

    /// Stop every timer. Background soft-kicks and cleanups keep running.
    pub fn stop_timers(&self) {
        self.inner.timers().cancel_all();
    }

    /// Whether any timer is running.
    #[must_use]
    pub fn timers_running(&self) -> bool {
        let timers = self.inner.timers();
        timers.stall_snapshot.is_some()
            || timers.progress_heartbeat.is_some()
            || timers.stall_abort.is_some()
    }

    /// Log the resolved thresholds once at stage start.
    pub fn log_hang_policy(&self) {
        let policy = &self.inner.policy;
        self.inner.log.log_line(
            &format!(
                "[watchdog] stage1 hang policy heartbeat={}ms snapshot={}ms softKick={}ms abort={}ms softKickMaxAttempts={}",
                policy.progress_heartbeat_ms,
                policy.stall_snapshot_ms,
                policy.stall_soft_kick_ms,
                policy.stall_abort_ms,
                policy.stall_soft_kick_max_attempts
            ),
            &self
                .inner
                .meta(LogKind::Status)
                .field("watchdogPolicy", policy),
        );
    }

    /// Run the decision function once and act on it.
    ///
    /// Soft-kicks and the post-abort sweep run as background tasks, so this
    /// must be called within a tokio runtime.
    pub fn evaluate_stalled_processing(&self, source: &str) {
        self.inner.evaluate(source);
    }

    /// Emit a stall snapshot if idle long enough, then evaluate.
    pub fn emit_stall_snapshot(&self) {
        self.inner.emit_stall_snapshot();
    }

    /// Emit a progress heartbeat, then evaluate.
    pub fn emit_progress_heartbeat(&self) {
        self.inner.emit_progress_heartbeat();
    }

    /// Wait for every background soft-kick and cleanup started so far.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = {
                let mut background = self
                    .inner
                    .background
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                background.drain(..).collect()
            };
            if pending.is_empty() {
                return;
            }
            for task in pending {
                task.await.ok();
            }
        }
    }

    fn spawn_timer(&self, period_ms: u64, kind: TimerKind) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(period_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match kind {
                    TimerKind::StallSnapshot => inner.emit_stall_snapshot(),
                    TimerKind::ProgressHeartbeat => inner.emit_progress_heartbeat(),
                    TimerKind::StallAbort => inner.evaluate("stall_poll_timer"),
                }
            }
        });
        token
    }
}

/// Clears the soft-kick in-flight flag however the soft-kick task ends,
/// including a panic or the task being dropped before it first runs.
struct SoftKickSlot(Arc<Inner>);

impl Drop for SoftKickSlot {
    fn drop(&mut self) {
        self.0.state().soft_kick_in_flight = false;
    }
}

/// One decision, taken atomically under the state lock.
struct Decided {
    action: StallAction,
    idle_ms: u64,
    attempt: u32,
    last_progress_at_ms: u64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, WatchdogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers(&self) -> MutexGuard<'_, TimerSet> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn meta(&self, kind: LogKind) -> LogMeta {
        LogMeta::new(kind)
            .field("mode", &self.mode)
            .field("stage", STAGE)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        background.retain(|task| !task.is_finished());
        background.push(task);
    }

    /// Progress and ordered-pending count while work is outstanding.
    fn outstanding_work(&self) -> Option<(Progress, u64)> {
        let progress = self.observer.progress()?;
        let ordered_pending = self
            .observer
            .ordered_completion()
            .map_or(0, |ordered| ordered.pending);
        if progress.is_complete() && self.in_flight.is_empty() && ordered_pending == 0 {
            return None;
        }
        Some((progress, ordered_pending))
    }

    fn build_snapshot(
        &self,
        reason: &str,
        idle_ms: u64,
        include_stack: bool,
        now_ms: u64,
        last_progress_at_ms: u64,
        progress: Progress,
    ) -> StallSnapshot {
        let ordered_snapshot = self.observer.ordered_appender_snapshot();
        let postings_snapshot = self.observer.postings_stats();
        let queue_delay = self.observer.queue_delay();
        let scheduler = self.observer.scheduler_stats();
        build_processing_stall_snapshot(&StallSnapshotInput {
            reason,
            idle_ms: Some(idle_ms),
            include_stack,
            now_ms,
            last_progress_at_ms,
            progress: Some(progress),
            process_start_ms: self.process_start_ms,
            in_flight: &self.in_flight,
            ordered_completion: self.observer.ordered_completion(),
            ordered_snapshot: ordered_snapshot.as_ref(),
            postings_snapshot: postings_snapshot.as_ref(),
            queue_delay: queue_delay.as_ref(),
            ownership_prefix: &self.scope_prefix,
            registry: &self.registry,
            scheduler: scheduler.as_ref(),
        })
    }

    fn decide(&self, now_ms: u64) -> Option<Decided> {
        let mut state = self.state();
        if state.abort_triggered {
            return None;
        }
        let idle_ms = now_ms.saturating_sub(state.last_progress_at_ms);
        let decision = resolve_stall_action(&StallInputs {
            idle_ms,
            abort_ms: self.policy.stall_abort_ms,
            soft_kick_ms: self.policy.stall_soft_kick_ms,
            soft_kick_attempts: state.soft_kick_attempts,
            soft_kick_max_attempts: self.policy.stall_soft_kick_max_attempts,
            soft_kick_in_flight: state.soft_kick_in_flight,
            last_soft_kick_at_ms: state.last_soft_kick_at_ms,
            soft_kick_cooldown_ms: self.policy.stall_soft_kick_cooldown_ms,
            now_ms,
        });
        match decision.action {
            StallAction::None => return None,
            StallAction::SoftKick => {
                state.soft_kick_in_flight = true;
                state.soft_kick_attempts += 1;
                state.last_soft_kick_at_ms = now_ms;
            }
            StallAction::Abort => state.abort_triggered = true,
        }
        Some(Decided {
            action: decision.action,
            idle_ms,
            attempt: state.soft_kick_attempts,
            last_progress_at_ms: state.last_progress_at_ms,
        })
    }

    fn evaluate(self: &Arc<Self>, source: &str) {
        if self.state().abort_triggered {
            return;
        }
        let Some((progress, ordered_pending)) = self.outstanding_work() else {
            return;
        };
        let now = self.clock.now_ms();
        let Some(decided) = self.decide(now) else {
            return;
        };
        let reason = if decided.action == StallAction::Abort {
            "stall_timeout"
        } else {
            "stall_soft_kick"
        };
        let snapshot = self.build_snapshot(
            reason,
            decided.idle_ms,
            true,
            now,
            decided.last_progress_at_ms,
            progress,
        );
        if decided.action == StallAction::SoftKick {
            let slot = SoftKickSlot(Arc::clone(self));
            let source = source.to_owned();
            let task = tokio::spawn(async move {
                slot.0
                    .soft_kick(decided.attempt, decided.idle_ms, &source, &snapshot)
                    .await;
            });
            self.track(task);
            return;
        }
        self.abort(source, decided.idle_ms, progress, ordered_pending, &snapshot);
    }

    async fn soft_kick(&self, attempt: u32, idle_ms: u64, source: &str, snapshot: &StallSnapshot) {
        let mut targets: Vec<String> = Vec::new();
        for id in snapshot
            .stalled_files
            .iter()
            .filter_map(|file| file.ownership_id.as_deref())
            .filter(|id| !id.is_empty())
        {
            if targets.len() == SOFT_KICK_TARGET_LIMIT {
                break;
            }
            if !targets.iter().any(|known| known == id) {
                targets.push(id.to_owned());
            }
        }

        let max_attempts = self.policy.stall_soft_kick_max_attempts;
        self.log.log_line(
            &format!(
                "[watchdog] soft-kick attempt {attempt}/{max_attempts} idle={}s source={source} targets={}",
                round_secs(idle_ms),
                targets.len()
            ),
            &self
                .meta(LogKind::Warning)
                .field("idleMs", idle_ms)
                .field("source", source)
                .field("softKickAttempt", attempt)
                .field("softKickMaxAttempts", max_attempts)
                .field("softKickThresholdMs", self.policy.stall_soft_kick_ms)
                .field("targetedOwnershipIds", &targets)
                .field("watchdogSnapshot", snapshot),
        );

        let mut results = Vec::with_capacity(targets.len().max(1));
        if targets.is_empty() {
            let request = TerminateRequest::new(
                format!("stage1_processing_stall_soft_kick:{attempt}:prefix"),
                ScopeFilter::prefix(self.scope_prefix.clone()),
            );
            results.push(self.registry.terminate_all(request).await);
        } else {
            for id in &targets {
                let request = TerminateRequest::new(
                    format!("stage1_processing_stall_soft_kick:{attempt}:{id}"),
                    ScopeFilter::exact(id.clone()),
                );
                results.push(self.registry.terminate_all(request).await);
            }
        }
        let summary = summarize_soft_kick_cleanup(&results);

        if summary.is_successful() {
            self.state().soft_kick_success_count += 1;
        }

        let kind = if summary.failures > 0 {
            LogKind::Warning
        } else {
            LogKind::Status
        };
        self.log.log_line(
            &format!(
                "[watchdog] soft-kick result attempt={attempt} attempted={} failures={} terminatedPids={}",
                summary.attempted,
                summary.failures,
                summary.terminated_pids.len()
            ),
            &self
                .meta(kind)
                .field("idleMs", idle_ms)
                .field("source", source)
                .field("softKickAttempt", attempt)
                .field("softKickResult", &summary),
        );
    }

    fn abort(
        self: &Arc<Self>,
        source: &str,
        idle_ms: u64,
        progress: Progress,
        ordered_pending: u64,
        snapshot: &StallSnapshot,
    ) {
        let soft_kick_attempts = self.state().soft_kick_attempts;
        let in_flight = self.in_flight.len();
        let err = AppError::StallTimeout(StallFailure {
            idle_ms,
            progress_done: progress.count,
            progress_total: progress.total,
            in_flight,
            ordered_pending,
            tracked_subprocesses: snapshot.tracked_subprocesses.total,
            soft_kick_attempts,
        });

        self.log.log_line(
            &format!(
                "[watchdog] stall-timeout idle={}s progress={}/{}; aborting stage1.",
                round_secs(idle_ms),
                progress.count,
                progress.total
            ),
            &self
                .meta(LogKind::Error)
                .field("source", source)
                .field("code", err.code())
                .field("idleMs", idle_ms)
                .field("progressDone", progress.count)
                .field("progressTotal", progress.total)
                .field("inFlight", in_flight)
                .field("orderedPending", ordered_pending)
                .field("softKickAttempts", soft_kick_attempts)
                .field("softKickThresholdMs", self.policy.stall_soft_kick_ms)
                .field("stallAbortMs", self.policy.stall_abort_ms)
                .field("watchdogSnapshot", snapshot),
        );
        if let Some(summary) = format_scheduler_summary(snapshot.scheduler.as_ref()) {
            self.log.log_line(
                &format!("[watchdog] scheduler snapshot: {summary}"),
                &self
                    .meta(LogKind::Error)
                    .field("scheduler", &snapshot.scheduler),
            );
        }
        if !snapshot.stalled_files.is_empty() {
            self.log.log_line(
                &format!(
                    "[watchdog] stalled files: {}",
                    format_stalled_file_text(&snapshot.stalled_files)
                ),
                &self.meta(LogKind::Error),
            );
        }
        if let Some(stack) = snapshot.process.stack.as_ref().filter(|s| !s.frames.is_empty()) {
            let frames: Vec<&str> = stack.frames.iter().take(3).map(String::as_str).collect();
            self.log.log_line(
                &format!("[watchdog] stack snapshot: {}", frames.join(" | ")),
                &self.meta(LogKind::Error),
            );
        }

        self.observer.abort_ordered(&err);
        self.observer.abort_processing(&err);

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let request = TerminateRequest::new(
                "stage1_processing_stall_timeout",
                ScopeFilter::prefix(inner.scope_prefix.clone()),
            )
            .forced();
            let cleanup = inner.registry.terminate_all(request).await;
            if cleanup.attempted == 0 {
                return;
            }
            inner.log.log_line(
                &format!(
                    "[watchdog] cleaned {} tracked subprocess(es) after stage1 stall-timeout.",
                    cleanup.attempted
                ),
                &inner.meta(LogKind::Warning).field("cleanup", &cleanup),
            );
        });
        self.track(task);
    }

    fn emit_stall_snapshot(self: &Arc<Self>) {
        let snapshot_ms = self.policy.stall_snapshot_ms;
        if snapshot_ms == 0 {
            return;
        }
        let Some((progress, _)) = self.outstanding_work() else {
            return;
        };
        let now = self.clock.now_ms();
        let (idle_ms, last_progress_at_ms) = {
            let mut state = self.state();
            let idle_ms = now.saturating_sub(state.last_progress_at_ms);
            if idle_ms < snapshot_ms {
                return;
            }
            if state.last_stall_snapshot_at_ms > 0
                && now.saturating_sub(state.last_stall_snapshot_at_ms)
                    < STALL_SNAPSHOT_LOG_COOLDOWN_MS
            {
                return;
            }
            state.last_stall_snapshot_at_ms = now;
            (idle_ms, state.last_progress_at_ms)
        };
        let policy = &self.policy;
        let include_stack = (policy.stall_soft_kick_ms > 0 && idle_ms >= policy.stall_soft_kick_ms)
            || (policy.stall_abort_ms > 0 && idle_ms >= policy.stall_abort_ms);
        let snapshot = self.build_snapshot(
            "stall_snapshot",
            idle_ms,
            include_stack,
            now,
            last_progress_at_ms,
            progress,
        );
        let tracked = snapshot.tracked_subprocesses.total;
        let ordered_field = |key: &str| {
            snapshot
                .ordered_snapshot
                .as_ref()
                .and_then(|ordered| ordered.get(key))
                .filter(|value| !value.is_null())
                .map_or_else(|| "?".to_owned(), Value::to_string)
        };
        self.log.log_line(
            &format!(
                "[watchdog] stall snapshot idle={}s progress={}/{} next={} pending={} orderedPending={} inFlight={} trackedSubprocesses={tracked}",
                round_secs(idle_ms),
                progress.count,
                progress.total,
                ordered_field("nextIndex"),
                ordered_field("pendingCount"),
                snapshot.ordered_pending,
                snapshot.in_flight,
            ),
            &self
                .meta(LogKind::Warning)
                .field("progressDone", progress.count)
                .field("progressTotal", progress.total)
                .field("idleMs", idle_ms)
                .field("orderedSnapshot", &snapshot.ordered_snapshot)
                .field("orderedPending", snapshot.ordered_pending)
                .field(
                    "postingsPending",
                    snapshot
                        .postings_snapshot
                        .as_ref()
                        .and_then(|postings| postings.get("pending")),
                )
                .field("stalledFiles", &snapshot.stalled_files)
                .field("trackedSubprocesses", tracked)
                .field("watchdogSnapshot", &snapshot),
        );
        if let Some(summary) = format_scheduler_summary(snapshot.scheduler.as_ref()) {
            self.log.log_line(
                &format!("[watchdog] scheduler snapshot: {summary}"),
                &self
                    .meta(LogKind::Warning)
                    .field("scheduler", &snapshot.scheduler),
            );
        }
        if !snapshot.stalled_files.is_empty() {
            self.log.log_line(
                &format!(
                    "[watchdog] oldest in-flight: {}",
                    format_stalled_file_text(&snapshot.stalled_files)
                ),
                &self.meta(LogKind::Warning),
            );
        }
        if !snapshot.tracked_subprocesses.entries.is_empty() {
            let tracked_text = snapshot
                .tracked_subprocesses
                .entries
                .iter()
                .map(|entry| {
                    format!(
                        "{}:{}",
                        entry.pid,
                        entry.ownership_id.as_deref().unwrap_or("unknown")
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            self.log.log_line(
                &format!("[watchdog] tracked subprocess snapshot: {tracked_text}"),
                &self.meta(LogKind::Warning),
            );
        }
        self.evaluate("stall_snapshot");
    }

    fn emit_progress_heartbeat(self: &Arc<Self>) {
        if self.policy.progress_heartbeat_ms == 0 {
            return;
        }
        let Some((progress, ordered_pending)) = self.outstanding_work() else {
            return;
        };
        let now = self.clock.now_ms();
        let tracked = self
            .registry
            .count(&ScopeFilter::prefix(self.scope_prefix.clone()));
        let in_flight = self.in_flight.len();
        let oldest = format_oldest_in_flight(&self.in_flight.collect_stalled(now, 3));
        let oldest_text = if oldest.is_empty() {
            String::new()
        } else {
            format!(" oldest={}", oldest.join(","))
        };
        let heartbeat = build_heartbeat_text(&HeartbeatInput {
            count: progress.count,
            total: progress.total,
            started_at_ms: self.process_start_ms,
            now_ms: now,
            in_flight,
            tracked_subprocesses: tracked,
        });
        self.log.log_line(
            &format!("{heartbeat} orderedPending={ordered_pending}{oldest_text}"),
            &self
                .meta(LogKind::Status)
                .field("progressDone", progress.count)
                .field("progressTotal", progress.total)
                .field("inFlight", in_flight)
                .field("orderedPending", ordered_pending)
                .field("trackedSubprocesses", tracked)
                .field("oldestInFlight", &oldest),
        );
        self.evaluate("progress_heartbeat");
    }
}
