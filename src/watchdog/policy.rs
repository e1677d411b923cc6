//! Stall policy resolution and the escalation decision.
//!
//! Everything in this module is pure: thresholds in, decision out.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::config::{OwnershipConfig, WatchdogThresholds};

/// Default "still working" heartbeat interval.
pub const DEFAULT_PROGRESS_HEARTBEAT_MS: u64 = 30_000;
/// Default idle time before stall snapshots are logged.
pub const DEFAULT_STALL_SNAPSHOT_MS: u64 = 30_000;
/// Default idle time before the stage is aborted.
pub const DEFAULT_STALL_ABORT_MS: u64 = 10 * 60 * 1000;
/// Floor applied to a configured abort threshold.
pub const STALL_ABORT_MIN_MS: u64 = 1_000;
/// Floor applied to any soft-kick threshold.
pub const SOFT_KICK_MIN_MS: u64 = 1_000;
/// Soft-kick must fire at least this long before abort.
pub const SOFT_KICK_ABORT_MARGIN_MS: u64 = 1_000;
/// Default spacing between soft-kicks.
pub const DEFAULT_SOFT_KICK_COOLDOWN_MS: u64 = 30_000;
/// Default soft-kicks allowed between progress ticks.
pub const DEFAULT_SOFT_KICK_MAX_ATTEMPTS: u32 = 2;

/// Resolved watchdog thresholds; `0` disables the corresponding behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallPolicy {
    /// Heartbeat interval.
    pub progress_heartbeat_ms: u64,
    /// Idle time before stall snapshots.
    pub stall_snapshot_ms: u64,
    /// Idle time before abort.
    pub stall_abort_ms: u64,
    /// Idle time before a soft-kick.
    pub stall_soft_kick_ms: u64,
    /// Minimum spacing between soft-kicks.
    pub stall_soft_kick_cooldown_ms: u64,
    /// Soft-kicks allowed between progress ticks.
    pub stall_soft_kick_max_attempts: u32,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self::resolve(&WatchdogThresholds::default())
    }
}

impl StallPolicy {
    /// Apply defaults, floors, and the soft-kick/abort relationship.
    #[must_use]
    pub fn resolve(thresholds: &WatchdogThresholds) -> Self {
        let stall_abort_ms = match thresholds.stall_abort_ms {
            Some(0) => 0,
            Some(configured) => configured.max(STALL_ABORT_MIN_MS),
            None => DEFAULT_STALL_ABORT_MS,
        };
        Self {
            progress_heartbeat_ms: thresholds
                .progress_heartbeat_ms
                .unwrap_or(DEFAULT_PROGRESS_HEARTBEAT_MS),
            stall_snapshot_ms: thresholds
                .stall_snapshot_ms
                .unwrap_or(DEFAULT_STALL_SNAPSHOT_MS),
            stall_abort_ms,
            stall_soft_kick_ms: resolve_soft_kick_ms(thresholds.stall_soft_kick_ms, stall_abort_ms),
            stall_soft_kick_cooldown_ms: thresholds
                .soft_kick_cooldown_ms
                .unwrap_or(DEFAULT_SOFT_KICK_COOLDOWN_MS),
            stall_soft_kick_max_attempts: thresholds
                .soft_kick_max_attempts
                .unwrap_or(DEFAULT_SOFT_KICK_MAX_ATTEMPTS),
        }
    }

    /// Whether soft-kicks can ever fire.
    #[must_use]
    pub fn soft_kick_enabled(&self) -> bool {
        self.stall_soft_kick_ms > 0 && self.stall_soft_kick_max_attempts > 0
    }

    /// Whether the stage can be aborted.
    #[must_use]
    pub fn abort_enabled(&self) -> bool {
        self.stall_abort_ms > 0
    }

    /// Period of the stall-snapshot timer: half the threshold, within 10-30s.
    #[must_use]
    pub fn snapshot_interval_ms(&self) -> Option<u64> {
        (self.stall_snapshot_ms > 0).then(|| (self.stall_snapshot_ms / 2).clamp(10_000, 30_000))
    }

    /// Period of the abort poll timer: a sixth of the threshold, within 2-10s.
    #[must_use]
    pub fn abort_poll_interval_ms(&self) -> Option<u64> {
        self.abort_enabled()
            .then(|| (self.stall_abort_ms / 6).clamp(2_000, 10_000))
    }
}

/// Soft-kick threshold from its configured value and the resolved abort.
///
/// `Some(0)` disables. Unset derives half the abort threshold and is
/// disabled when abort is. With abort enabled the result never exceeds
/// `abort - 1000`.
#[must_use]
pub fn resolve_soft_kick_ms(configured: Option<u64>, stall_abort_ms: u64) -> u64 {
    let candidate = match configured {
        Some(0) => return 0,
        Some(configured) => configured.max(SOFT_KICK_MIN_MS),
        None if stall_abort_ms == 0 => return 0,
        None => (stall_abort_ms / 2).max(SOFT_KICK_MIN_MS),
    };
    if stall_abort_ms > 0 {
        candidate.min(
            stall_abort_ms
                .saturating_sub(SOFT_KICK_ABORT_MARGIN_MS)
                .max(1),
        )
    } else {
        candidate
    }
}

/// What the watchdog should do now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StallAction {
    /// Keep waiting.
    None,
    /// Terminate the most-stalled files' workers.
    SoftKick,
    /// Fail the stage.
    Abort,
}

/// Why the decision was [`StallAction::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallReason {
    /// Soft-kick threshold or attempt budget is zero.
    SoftKickDisabled,
    /// A soft-kick is still running.
    SoftKickInFlight,
    /// Every soft-kick since the last progress tick was spent.
    SoftKickAttemptsExhausted,
    /// Idle time has not reached the soft-kick threshold.
    BelowSoftKickThreshold,
    /// The previous soft-kick was too recent.
    SoftKickCooldown,
}

impl StallReason {
    /// Stable snake-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SoftKickDisabled => "soft_kick_disabled",
            Self::SoftKickInFlight => "soft_kick_in_flight",
            Self::SoftKickAttemptsExhausted => "soft_kick_attempts_exhausted",
            Self::BelowSoftKickThreshold => "below_soft_kick_threshold",
            Self::SoftKickCooldown => "soft_kick_cooldown",
        }
    }
}

/// Inputs of [`resolve_stall_action`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallInputs {
    /// Time since the last progress tick.
    pub idle_ms: u64,
    /// Abort threshold; `0` disables.
    pub abort_ms: u64,
    /// Soft-kick threshold; `0` disables.
    pub soft_kick_ms: u64,
    /// Soft-kicks since the last progress tick.
    pub soft_kick_attempts: u32,
    /// Soft-kick budget.
    pub soft_kick_max_attempts: u32,
    /// A soft-kick is running.
    pub soft_kick_in_flight: bool,
    /// When the last soft-kick started; `0` if none.
    pub last_soft_kick_at_ms: u64,
    /// Minimum spacing between soft-kicks.
    pub soft_kick_cooldown_ms: u64,
    /// Evaluation time.
    pub now_ms: u64,
}

impl StallInputs {
    /// Inputs carrying `policy`'s thresholds and no soft-kick history.
    #[must_use]
    pub fn from_policy(policy: &StallPolicy, idle_ms: u64, now_ms: u64) -> Self {
        Self {
            idle_ms,
            abort_ms: policy.stall_abort_ms,
            soft_kick_ms: policy.stall_soft_kick_ms,
            soft_kick_max_attempts: policy.stall_soft_kick_max_attempts,
            soft_kick_cooldown_ms: policy.stall_soft_kick_cooldown_ms,
            now_ms,
            ..Self::default()
        }
    }
}

/// Outcome of [`resolve_stall_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallDecision {
    /// Chosen action.
    pub action: StallAction,
    /// Idle time the decision was based on.
    pub idle_ms: u64,
    /// Why nothing happens, for [`StallAction::None`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StallReason>,
}

impl StallDecision {
    fn none(idle_ms: u64, reason: StallReason) -> Self {
        Self {
            action: StallAction::None,
            idle_ms,
            reason: Some(reason),
        }
    }
}

/// Decide between waiting, soft-kicking, and aborting.
///
/// Crossing the abort threshold wins over every soft-kick consideration.
#[must_use]
pub fn resolve_stall_action(inputs: &StallInputs) -> StallDecision {
    let idle_ms = inputs.idle_ms;
    if inputs.abort_ms > 0 && idle_ms >= inputs.abort_ms {
        return StallDecision {
            action: StallAction::Abort,
            idle_ms,
            reason: None,
        };
    }
    if inputs.soft_kick_ms == 0 || inputs.soft_kick_max_attempts == 0 {
        return StallDecision::none(idle_ms, StallReason::SoftKickDisabled);
    }
    if inputs.soft_kick_in_flight {
        return StallDecision::none(idle_ms, StallReason::SoftKickInFlight);
    }
    if inputs.soft_kick_attempts >= inputs.soft_kick_max_attempts {
        return StallDecision::none(idle_ms, StallReason::SoftKickAttemptsExhausted);
    }
    if idle_ms < inputs.soft_kick_ms {
        return StallDecision::none(idle_ms, StallReason::BelowSoftKickThreshold);
    }
    if inputs.soft_kick_cooldown_ms > 0
        && inputs.last_soft_kick_at_ms > 0
        && inputs.now_ms.saturating_sub(inputs.last_soft_kick_at_ms) < inputs.soft_kick_cooldown_ms
    {
        return StallDecision::none(idle_ms, StallReason::SoftKickCooldown);
    }
    StallDecision {
        action: StallAction::SoftKick,
        idle_ms,
        reason: None,
    }
}

fn disallowed_segment_chars() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[^a-zA-Z0-9._:-]+").ok())
        .as_ref()
}

/// Trim and replace every run of characters outside `[A-Za-z0-9._:-]`
/// with `_`; blank input yields `fallback`.
#[must_use]
pub fn normalize_ownership_segment(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return fallback.to_owned();
    }
    match disallowed_segment_chars() {
        Some(pattern) => pattern.replace_all(trimmed, "_").into_owned(),
        None => trimmed.to_owned(),
    }
}

/// `stage1:<build>:<mode>`, or `<configured prefix>:<mode>`.
#[must_use]
pub fn stage1_ownership_prefix(config: &OwnershipConfig, mode: &str) -> String {
    let mode = normalize_ownership_segment(mode, "mode");
    match config
        .stage1_file_prefix
        .as_deref()
        .map(str::trim)
        .filter(|prefix| !prefix.is_empty())
    {
        Some(prefix) => format!("{prefix}:{mode}"),
        None => format!(
            "stage1:{}:{mode}",
            normalize_ownership_segment(&config.build_id, "build")
        ),
    }
}

/// Deterministic ownership id of one file's worker subprocesses.
#[must_use]
pub fn stage1_file_ownership_id(
    config: &OwnershipConfig,
    mode: &str,
    shard_id: Option<&str>,
    file_index: Option<u64>,
    rel: &str,
) -> String {
    let prefix = stage1_ownership_prefix(config, mode);
    let shard = normalize_ownership_segment(shard_id.unwrap_or("none"), "none");
    let index = file_index.map_or_else(|| "na".to_owned(), |index| index.to_string());
    let rel = normalize_ownership_segment(rel, "unknown_file");
    format!("{prefix}:shard:{shard}:file:{index}:{rel}")
}

/// Inputs of [`build_heartbeat_text`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatInput {
    /// Files completed.
    pub count: u64,
    /// Files expected.
    pub total: u64,
    /// When processing began.
    pub started_at_ms: u64,
    /// Current time.
    pub now_ms: u64,
    /// Files in flight.
    pub in_flight: usize,
    /// Tracked subprocesses under the stage prefix.
    pub tracked_subprocesses: usize,
}

/// `[watchdog] progress c/t (p%) elapsed=Ns rate=x.xx files/s eta=Ns ...`
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn build_heartbeat_text(input: &HeartbeatInput) -> String {
    let count = if input.total > 0 {
        input.count.min(input.total)
    } else {
        input.count
    };
    let elapsed_ms = input.now_ms.saturating_sub(input.started_at_ms).max(1);
    let elapsed_secs = elapsed_ms as f64 / 1000.0;
    let rate = if count > 0 {
        count as f64 / elapsed_secs
    } else {
        0.0
    };
    let remaining = input.total.saturating_sub(count);
    let eta = if rate > 0.0 {
        format!("{}s", (remaining as f64 / rate).ceil() as u64)
    } else {
        "n/a".to_owned()
    };
    let percent = if input.total > 0 {
        format!("{:.1}", count as f64 / input.total as f64 * 100.0)
    } else {
        "0.0".to_owned()
    };
    format!(
        "[watchdog] progress {count}/{total} ({percent}%) elapsed={elapsed}s rate={rate:.2} files/s \
         eta={eta} inFlight={in_flight} trackedSubprocesses={tracked}",
        total = input.total,
        elapsed = elapsed_ms / 1000,
        in_flight = input.in_flight,
        tracked = input.tracked_subprocesses,
    )
}
