//! Unit tests for threshold resolution and the stall decision function.

use index_warden::config::WatchdogThresholds;
use index_warden::watchdog::policy::{
    resolve_soft_kick_ms, StallReason, DEFAULT_SOFT_KICK_COOLDOWN_MS,
    DEFAULT_SOFT_KICK_MAX_ATTEMPTS, DEFAULT_STALL_ABORT_MS,
};
use index_warden::watchdog::{resolve_stall_action, StallAction, StallInputs, StallPolicy};

fn policy(abort: Option<u64>, soft: Option<u64>) -> StallPolicy {
    StallPolicy::resolve(&WatchdogThresholds {
        stall_abort_ms: abort,
        stall_soft_kick_ms: soft,
        ..WatchdogThresholds::default()
    })
}

fn inputs(idle_ms: u64, now_ms: u64) -> StallInputs {
    StallInputs {
        idle_ms,
        abort_ms: 9_000,
        soft_kick_ms: 3_500,
        soft_kick_max_attempts: 2,
        soft_kick_cooldown_ms: 0,
        now_ms,
        ..StallInputs::default()
    }
}

#[test]
fn defaults_derive_soft_kick_from_abort() {
    let resolved = StallPolicy::default();
    assert_eq!(resolved.stall_abort_ms, DEFAULT_STALL_ABORT_MS);
    assert_eq!(resolved.stall_soft_kick_ms, DEFAULT_STALL_ABORT_MS / 2);
    assert_eq!(resolved.stall_soft_kick_cooldown_ms, DEFAULT_SOFT_KICK_COOLDOWN_MS);
    assert_eq!(resolved.stall_soft_kick_max_attempts, DEFAULT_SOFT_KICK_MAX_ATTEMPTS);
    assert!(resolved.soft_kick_enabled());
    assert!(resolved.abort_enabled());
}

#[test]
fn abort_has_a_floor_and_zero_disables() {
    assert_eq!(policy(Some(10), None).stall_abort_ms, 1_000);
    let disabled = policy(Some(0), None);
    assert_eq!(disabled.stall_abort_ms, 0);
    assert!(!disabled.abort_enabled());
    assert_eq!(disabled.abort_poll_interval_ms(), None);
}

#[test]
fn soft_kick_is_capped_below_abort() {
    assert_eq!(resolve_soft_kick_ms(Some(9_000), 9_000), 8_000);
    assert_eq!(resolve_soft_kick_ms(Some(3_500), 9_000), 3_500);
    assert_eq!(resolve_soft_kick_ms(Some(10), 9_000), 1_000);
    assert_eq!(resolve_soft_kick_ms(None, 9_000), 4_500);
}

#[test]
fn soft_kick_disabled_when_zero_or_abort_disabled() {
    assert_eq!(resolve_soft_kick_ms(Some(0), 9_000), 0);
    assert_eq!(resolve_soft_kick_ms(None, 0), 0);
    assert_eq!(resolve_soft_kick_ms(Some(5_000), 0), 5_000);
    assert!(!policy(Some(0), None).soft_kick_enabled());
}

#[test]
fn timer_periods_are_clamped() {
    let resolved = StallPolicy {
        stall_snapshot_ms: 5_000,
        stall_abort_ms: 600_000,
        ..StallPolicy::default()
    };
    assert_eq!(resolved.snapshot_interval_ms(), Some(10_000));
    assert_eq!(resolved.abort_poll_interval_ms(), Some(10_000));

    let short = StallPolicy {
        stall_snapshot_ms: 0,
        stall_abort_ms: 6_000,
        ..StallPolicy::default()
    };
    assert_eq!(short.snapshot_interval_ms(), None);
    assert_eq!(short.abort_poll_interval_ms(), Some(2_000));
}

#[test]
fn escalation_sequence_for_short_thresholds() {
    // idle 1.2s: below soft-kick threshold.
    let decision = resolve_stall_action(&inputs(1_200, 1_200));
    assert_eq!(decision.action, StallAction::None);
    assert_eq!(decision.reason, Some(StallReason::BelowSoftKickThreshold));

    // idle 4s: first soft-kick.
    assert_eq!(resolve_stall_action(&inputs(4_000, 4_000)).action, StallAction::SoftKick);

    // idle 6s after one attempt: second soft-kick.
    let second = StallInputs {
        soft_kick_attempts: 1,
        last_soft_kick_at_ms: 4_000,
        ..inputs(6_000, 6_000)
    };
    assert_eq!(resolve_stall_action(&second).action, StallAction::SoftKick);

    // idle 8s with the budget spent.
    let exhausted = StallInputs {
        soft_kick_attempts: 2,
        last_soft_kick_at_ms: 6_000,
        ..inputs(8_000, 8_000)
    };
    let decision = resolve_stall_action(&exhausted);
    assert_eq!(decision.action, StallAction::None);
    assert_eq!(decision.reason, Some(StallReason::SoftKickAttemptsExhausted));

    // idle 9.5s: abort.
    let abort = StallInputs {
        soft_kick_attempts: 2,
        ..inputs(9_500, 9_500)
    };
    let decision = resolve_stall_action(&abort);
    assert_eq!(decision.action, StallAction::Abort);
    assert_eq!(decision.idle_ms, 9_500);
}

#[test]
fn abort_wins_over_in_flight_soft_kick() {
    let decision = resolve_stall_action(&StallInputs {
        soft_kick_in_flight: true,
        ..inputs(9_000, 9_000)
    });
    assert_eq!(decision.action, StallAction::Abort);
}

#[test]
fn in_flight_soft_kick_blocks_another() {
    let decision = resolve_stall_action(&StallInputs {
        soft_kick_in_flight: true,
        ..inputs(5_000, 5_000)
    });
    assert_eq!(decision.reason, Some(StallReason::SoftKickInFlight));
}

#[test]
fn cooldown_spaces_soft_kicks() {
    let cooling = StallInputs {
        soft_kick_attempts: 1,
        last_soft_kick_at_ms: 4_000,
        soft_kick_cooldown_ms: 3_000,
        ..inputs(5_000, 5_000)
    };
    assert_eq!(
        resolve_stall_action(&cooling).reason,
        Some(StallReason::SoftKickCooldown)
    );

    let cooled = StallInputs {
        now_ms: 7_000,
        idle_ms: 7_000,
        ..cooling
    };
    assert_eq!(resolve_stall_action(&cooled).action, StallAction::SoftKick);
}

#[test]
fn zero_budget_disables_soft_kicks() {
    let decision = resolve_stall_action(&StallInputs {
        soft_kick_max_attempts: 0,
        ..inputs(5_000, 5_000)
    });
    assert_eq!(decision.reason, Some(StallReason::SoftKickDisabled));
}

#[test]
fn disabled_abort_never_aborts() {
    let decision = resolve_stall_action(&StallInputs {
        abort_ms: 0,
        soft_kick_ms: 0,
        ..inputs(u64::MAX, u64::MAX)
    });
    assert_eq!(decision.action, StallAction::None);
}

#[test]
fn from_policy_starts_without_history() {
    let resolved = policy(Some(9_000), Some(3_500));
    let built = StallInputs::from_policy(&resolved, 4_000, 10_000);
    assert_eq!(built.abort_ms, 9_000);
    assert_eq!(built.soft_kick_ms, 3_500);
    assert_eq!(built.soft_kick_attempts, 0);
    assert!(!built.soft_kick_in_flight);
    assert_eq!(resolve_stall_action(&built).action, StallAction::SoftKick);
}
