//! Unit tests for `AppError` display format, codes, and carried results.

use index_warden::errors::StallFailure;
use index_warden::subprocess::SubprocessResult;
use index_warden::AppError;

fn partial_result() -> Box<SubprocessResult> {
    Box::new(SubprocessResult {
        pid: Some(4242),
        exit_code: None,
        signal: None,
        duration_ms: 15,
        stdout: None,
        stderr: None,
    })
}

#[test]
fn display_uses_kind_prefix() {
    assert_eq!(
        AppError::Config("bad value".into()).to_string(),
        "config: bad value"
    );
    assert_eq!(AppError::Kill("EPERM".into()).to_string(), "kill: EPERM");
    assert_eq!(AppError::Io("closed".into()).to_string(), "io: closed");
    assert!(AppError::ShellDisabled.to_string().starts_with("spawn:"));
}

#[test]
fn timeout_display_names_budget() {
    let err = AppError::Timeout {
        timeout_ms: 250,
        result: partial_result(),
    };
    assert_eq!(err.to_string(), "timeout: subprocess exceeded 250ms");
    assert_eq!(err.code(), "SUBPROCESS_TIMEOUT");
}

#[test]
fn stall_timeout_carries_counters() {
    let err = AppError::StallTimeout(StallFailure {
        idle_ms: 9_000,
        progress_done: 3,
        progress_total: 10,
        in_flight: 2,
        ordered_pending: 1,
        tracked_subprocesses: 4,
        soft_kick_attempts: 2,
    });
    assert_eq!(err.code(), "FILE_PROCESS_STALL_TIMEOUT");
    assert_eq!(err.to_string(), "stall: processing stalled for 9000ms at 3/10");
    assert!(err.result().is_none());
    assert!(!err.retryable());
}

#[test]
fn abort_code_and_result() {
    let err = AppError::Aborted {
        result: partial_result(),
    };
    assert_eq!(err.code(), "ABORT_ERR");
    assert_eq!(err.result().and_then(|result| result.pid), Some(4242));
    assert!(!err.retryable());
}

#[test]
fn shell_disabled_shares_spawn_code() {
    let spawn = AppError::Spawn {
        message: "sleep exited with code 1".into(),
        result: partial_result(),
    };
    assert_eq!(spawn.code(), AppError::ShellDisabled.code());
    assert!(AppError::ShellDisabled.result().is_none());
}

#[test]
fn only_timeouts_and_io_are_retryable() {
    assert!(AppError::Timeout {
        timeout_ms: 1,
        result: partial_result()
    }
    .retryable());
    assert!(AppError::Io("reset".into()).retryable());
    assert!(!AppError::Config("x".into()).retryable());
    assert!(!AppError::Kill("x".into()).retryable());
}

#[test]
fn messages_have_no_trailing_period() {
    for err in [
        AppError::Config("x".into()),
        AppError::ShellDisabled,
        AppError::Aborted {
            result: partial_result(),
        },
    ] {
        let rendered = err.to_string();
        assert!(!rendered.ends_with('.'), "trailing period: {rendered}");
    }
}
