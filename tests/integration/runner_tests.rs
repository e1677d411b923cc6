//! Integration tests for spawning tracked children with real processes.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use index_warden::subprocess::registry::RegistryEventKind;
use index_warden::subprocess::{
    spawn_blocking, with_tracked_cancel_scope, with_tracked_scope, CapturedOutput, OutputMode,
    ScopeFilter, SpawnOptions, SubprocessRegistry,
};
use index_warden::AppError;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{is_running, wait_until, within_five_seconds};

fn sh(script: &str) -> [String; 2] {
    ["-c".to_owned(), script.to_owned()]
}

#[tokio::test]
async fn captures_both_streams() {
    let registry = SubprocessRegistry::new();
    let result = registry
        .spawn("sh", sh("printf out; printf err >&2"), SpawnOptions::default())
        .await
        .expect("child should succeed");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.signal, None);
    assert!(result.pid.is_some());
    assert_eq!(result.stdout, Some(CapturedOutput::Text("out".into())));
    assert_eq!(result.stderr, Some(CapturedOutput::Text("err".into())));
    assert_eq!(registry.count(&ScopeFilter::All), 0, "unregistered on exit");
}

#[tokio::test]
async fn unexpected_exit_code_is_rejected_with_output() {
    let registry = SubprocessRegistry::new();
    let err = registry
        .spawn(
            "sh",
            sh("echo partial; exit 3"),
            SpawnOptions::default().with_name("indexer"),
        )
        .await
        .expect_err("exit 3 should be rejected");
    let AppError::Spawn { message, result } = err else {
        panic!("expected spawn error");
    };
    assert_eq!(message, "indexer exited with code 3");
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stdout.map(|out| out.as_text()), Some("partial\n".into()));
}

#[tokio::test]
async fn expected_exit_codes_are_accepted() {
    let registry = SubprocessRegistry::new();
    let result = registry
        .spawn(
            "sh",
            sh("exit 3"),
            SpawnOptions::default().with_expected_exit_codes(vec![0, 3]),
        )
        .await
        .expect("exit 3 is expected");
    assert_eq!(result.exit_code, Some(3));

    let lenient = SpawnOptions {
        reject_on_non_zero_exit: false,
        ..SpawnOptions::default()
    };
    let result = registry
        .spawn("sh", sh("exit 7"), lenient)
        .await
        .expect("rejection disabled");
    assert_eq!(result.exit_code, Some(7));
}

#[tokio::test]
async fn shell_requests_are_refused() {
    let registry = SubprocessRegistry::new();
    let options = SpawnOptions {
        shell: true,
        ..SpawnOptions::default()
    };
    let err = registry
        .spawn("echo", ["hi"], options)
        .await
        .expect_err("shell must be refused");
    assert!(matches!(err, AppError::ShellDisabled));
    assert_eq!(registry.count(&ScopeFilter::All), 0);
}

#[tokio::test]
async fn missing_executable_reports_unstarted_result() {
    let registry = SubprocessRegistry::new();
    let err = registry
        .spawn(
            "/definitely/not/a/binary",
            Vec::<String>::new(),
            SpawnOptions::default(),
        )
        .await
        .expect_err("spawn must fail");
    let AppError::Spawn { result, .. } = err else {
        panic!("expected spawn error");
    };
    assert_eq!(result.pid, None);
    assert_eq!(result.exit_code, None);
    assert_eq!(registry.count(&ScopeFilter::All), 0);
}

#[tokio::test]
async fn timeout_kills_the_child() {
    let registry = SubprocessRegistry::new();
    let started = Instant::now();
    let err = within_five_seconds(registry.spawn(
        "sleep",
        ["30"],
        SpawnOptions::default().with_timeout_ms(200),
    ))
    .await
    .expect_err("child should time out");
    assert!(started.elapsed() < Duration::from_secs(5));
    let AppError::Timeout { timeout_ms, result } = err else {
        panic!("expected timeout");
    };
    assert_eq!(timeout_ms, 200);
    assert!(result.pid.is_some());
    assert!(
        wait_until(|| registry.count(&ScopeFilter::All) == 0).await,
        "timed-out child should be unregistered after the kill"
    );
}

#[tokio::test]
async fn zero_timeout_waits_for_exit() {
    let registry = SubprocessRegistry::new();
    let result = registry
        .spawn(
            "sh",
            sh("sleep 0.1; echo done"),
            SpawnOptions::default().with_timeout_ms(0),
        )
        .await
        .expect("zero means no timeout");
    assert_eq!(result.stdout.map(|out| out.as_text()), Some("done\n".into()));
}

#[tokio::test]
async fn cancellation_aborts_the_child() {
    let registry = SubprocessRegistry::new();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });
    let err = within_five_seconds(registry.spawn(
        "sleep",
        ["30"],
        SpawnOptions::default().with_cancel(cancel),
    ))
    .await
    .expect_err("child should be aborted");
    assert!(matches!(err, AppError::Aborted { ref result } if result.pid.is_some()));
    assert!(wait_until(|| registry.count(&ScopeFilter::All) == 0).await);
}

#[tokio::test]
async fn already_cancelled_token_never_spawns() {
    let registry = SubprocessRegistry::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let spawned = Arc::new(Mutex::new(false));
    let seen = Arc::clone(&spawned);
    let options = SpawnOptions {
        on_spawn: Some(Arc::new(move |_pid: u32| *seen.lock().unwrap() = true)),
        ..SpawnOptions::default().with_cancel(cancel)
    };
    let err = registry
        .spawn("sleep", ["30"], options)
        .await
        .expect_err("pre-cancelled");
    assert!(matches!(err, AppError::Aborted { ref result } if result.pid.is_none()));
    assert!(!*spawned.lock().unwrap());
}

#[tokio::test]
async fn output_keeps_the_tail_within_the_cap() {
    let registry = SubprocessRegistry::new();
    let result = registry
        .spawn(
            "sh",
            sh("i=0; while [ $i -lt 200 ]; do printf 'line-%03d\\n' $i; i=$((i+1)); done"),
            SpawnOptions::default().with_max_output_bytes(18),
        )
        .await
        .expect("child should succeed");
    let stdout = result.stdout.expect("captured").as_text();
    assert!(stdout.len() <= 18, "{stdout:?}");
    assert!(stdout.ends_with("line-199\n"), "{stdout:?}");
}

#[tokio::test]
async fn lines_mode_splits_and_strips_carriage_returns() {
    let registry = SubprocessRegistry::new();
    let options = SpawnOptions {
        output_mode: OutputMode::Lines,
        ..SpawnOptions::default()
    };
    let result = registry
        .spawn("sh", sh("printf 'a\\r\\nb\\n'"), options)
        .await
        .expect("child should succeed");
    assert_eq!(
        result.stdout,
        Some(CapturedOutput::Lines(vec!["a".into(), "b".into()]))
    );
}

#[tokio::test]
async fn input_is_written_to_stdin() {
    let registry = SubprocessRegistry::new();
    let result = registry
        .spawn("cat", Vec::<String>::new(), SpawnOptions::default().with_input("hello"))
        .await
        .expect("cat should succeed");
    assert_eq!(result.stdout, Some(CapturedOutput::Text("hello".into())));
}

#[tokio::test]
async fn disabled_capture_yields_no_output() {
    let registry = SubprocessRegistry::new();
    let chunks = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&chunks);
    let options = SpawnOptions {
        capture_stdout: Some(false),
        on_stdout: Some(Arc::new(move |chunk: &str| sink.lock().unwrap().push_str(chunk))),
        ..SpawnOptions::default()
    };
    let result = registry
        .spawn("sh", sh("echo streamed"), options)
        .await
        .expect("child should succeed");
    assert_eq!(result.stdout, None);
    assert_eq!(chunks.lock().unwrap().as_str(), "streamed\n");
}

#[tokio::test]
async fn scope_is_inherited_by_spawns() {
    let registry = SubprocessRegistry::new();
    let cancel = CancellationToken::new();
    let task_registry = registry.clone();
    let options = SpawnOptions::default().with_cancel(cancel.clone());
    let task = tokio::spawn(with_tracked_scope("job:42", async move {
        task_registry.spawn("sleep", ["30"], options).await
    }));

    assert!(wait_until(|| registry.count(&ScopeFilter::exact("job:42")) == 1).await);
    let snapshot = registry.snapshot(&ScopeFilter::prefix("job:"), 5);
    assert_eq!(snapshot.entries[0].command, "sleep");
    assert_eq!(snapshot.entries[0].args, ["30"]);

    cancel.cancel();
    let outcome = within_five_seconds(task).await.expect("task should not panic");
    assert!(matches!(outcome, Err(AppError::Aborted { .. })));
}

#[tokio::test]
async fn cancel_scope_reaches_spawns_without_their_own_token() {
    let registry = SubprocessRegistry::new();
    let cancel = CancellationToken::new();
    let task_registry = registry.clone();
    let options = SpawnOptions::default().with_kill_grace_ms(500);
    let task = tokio::spawn(with_tracked_cancel_scope("job:7", cancel.clone(), async move {
        task_registry.spawn("sleep", ["30"], options).await
    }));

    assert!(wait_until(|| registry.count(&ScopeFilter::exact("job:7")) == 1).await);
    cancel.cancel();
    let outcome = within_five_seconds(task).await.expect("task should not panic");
    assert!(matches!(outcome, Err(AppError::Aborted { .. })));
    assert!(wait_until(|| registry.count(&ScopeFilter::All) == 0).await);
}

#[tokio::test]
async fn dropping_an_unsettled_spawn_untracks_and_kills_its_group() {
    let registry = SubprocessRegistry::new();
    let printed = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&printed);
    let options = SpawnOptions {
        on_stdout: Some(Arc::new(move |chunk: &str| sink.lock().unwrap().push_str(chunk))),
        ..SpawnOptions::default().with_ownership("dropped")
    };

    let spawned = registry.spawn("sh", sh("sleep 30 & echo $!; sleep 30"), options);
    let outcome = tokio::time::timeout(Duration::from_millis(500), spawned).await;
    assert!(outcome.is_err(), "spawn is still pending when dropped");
    assert_eq!(registry.count(&ScopeFilter::exact("dropped")), 0);
    let kinds: Vec<RegistryEventKind> = registry
        .events(&ScopeFilter::exact("dropped"), 10)
        .iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(kinds, [RegistryEventKind::Registered, RegistryEventKind::Unregistered]);

    let background: i32 = printed
        .lock()
        .unwrap()
        .trim()
        .parse()
        .expect("background pid is printed");
    assert!(
        wait_until(|| !is_running(background)).await,
        "background sleep dies with its process group"
    );
}

#[tokio::test]
async fn unref_detached_children_are_not_tracked() {
    let registry = SubprocessRegistry::new();
    let options = SpawnOptions {
        detached: Some(true),
        unref: true,
        ..SpawnOptions::default()
    };
    let result = registry
        .spawn("sh", sh("exit 0"), options)
        .await
        .expect("child should succeed");
    assert_eq!(result.exit_code, Some(0));
    assert!(registry.events(&ScopeFilter::All, 10).is_empty());
}

#[test]
fn blocking_spawn_matches_async_rules() {
    let result = spawn_blocking(
        "sh",
        sh("printf blocking; printf warn >&2"),
        &SpawnOptions::default(),
    )
    .expect("child should succeed");
    assert_eq!(result.stdout, Some(CapturedOutput::Text("blocking".into())));
    assert_eq!(result.stderr, Some(CapturedOutput::Text("warn".into())));

    let err = spawn_blocking("sh", sh("exit 4"), &SpawnOptions::default())
        .expect_err("exit 4 is rejected");
    assert_eq!(err.result().and_then(|result| result.exit_code), Some(4));

    let options = SpawnOptions {
        shell: true,
        ..SpawnOptions::default()
    };
    assert!(matches!(
        spawn_blocking("true", Vec::<String>::new(), &options),
        Err(AppError::ShellDisabled)
    ));
}
