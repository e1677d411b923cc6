//! Unit tests for stalled-file ranking, scheduler summaries, and stall
//! snapshot assembly.

use std::collections::BTreeMap;

use index_warden::diagnostics::{
    build_processing_stall_snapshot, build_scheduler_snapshot, collect_stalled_files,
    format_oldest_in_flight, format_scheduler_summary, format_stalled_file_text, iso_timestamp,
    round_secs, summarize_queue_delay, summarize_soft_kick_cleanup, InFlightFile, InFlightFiles,
    OrderedCompletionSnapshot, ParseSurfaceStats, Progress, QueueDelayTotals, QueueStats,
    SchedulerStats, StallSnapshotInput, SNAPSHOT_SOURCE, STALLED_FILE_LIMIT,
    TOP_PENDING_QUEUE_LIMIT,
};
use index_warden::subprocess::registry::Registration;
use index_warden::subprocess::{SubprocessRegistry, TerminationSummary};

fn in_flight(file: &str, order: Option<u64>, started_at_ms: u64) -> InFlightFile {
    InFlightFile {
        file: file.to_owned(),
        order_index: order,
        ownership_id: Some(format!("stage1:b:code:{file}")),
        started_at_ms,
        ..InFlightFile::default()
    }
}

#[test]
fn stalled_files_rank_by_elapsed_then_order() {
    let files = [
        in_flight("c.rs", Some(2), 5_000),
        in_flight("a.rs", Some(9), 1_000),
        in_flight("b.rs", Some(1), 1_000),
        in_flight("d.rs", None, 1_000),
    ];
    let ranked = collect_stalled_files(files.iter(), 10_000, 10);
    let names: Vec<&str> = ranked.iter().map(|file| file.file.as_str()).collect();
    assert_eq!(names, ["b.rs", "a.rs", "d.rs", "c.rs"]);
    assert_eq!(ranked[0].elapsed_ms, 9_000);
    assert_eq!(ranked[3].elapsed_ms, 5_000);
}

#[test]
fn stalled_files_keep_only_the_top_k() {
    let files: Vec<InFlightFile> = (0..50)
        .map(|i| in_flight(&format!("f{i}.rs"), Some(i), i * 100))
        .collect();
    let ranked = collect_stalled_files(files.iter(), 10_000, STALLED_FILE_LIMIT);
    assert_eq!(ranked.len(), STALLED_FILE_LIMIT);
    let orders: Vec<Option<u64>> = ranked.iter().map(|file| file.order_index).collect();
    assert_eq!(orders, [Some(0), Some(1), Some(2), Some(3), Some(4), Some(5)]);
    assert!(collect_stalled_files(files.iter(), 10_000, 0).is_empty());
}

#[test]
fn in_flight_tracker_begins_and_finishes() {
    let tracker = InFlightFiles::new();
    assert!(tracker.is_empty());
    tracker.begin("k1", in_flight("a.rs", Some(0), 0));
    tracker.begin("k2", in_flight("b.rs", Some(1), 500));
    assert_eq!(tracker.len(), 2);
    assert_eq!(tracker.finish("k1").map(|file| file.file), Some("a.rs".to_owned()));
    assert!(tracker.finish("k1").is_none());
    let stalled = tracker.collect_stalled(2_000, 5);
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].elapsed_ms, 1_500);
}

#[test]
fn stalled_file_text_uses_fallbacks() {
    let files = collect_stalled_files(
        [in_flight("src/a.rs", Some(4), 0), in_flight("", None, 500)].iter(),
        12_400,
        5,
    );
    assert_eq!(format_stalled_file_text(&files), "src/a.rs#4@12s, unknown#?@12s");
    assert_eq!(format_oldest_in_flight(&files), ["src/a.rs@12s", "unknown@12s"]);
}

#[test]
fn seconds_round_half_up() {
    assert_eq!(round_secs(0), 0);
    assert_eq!(round_secs(499), 0);
    assert_eq!(round_secs(500), 1);
    assert_eq!(round_secs(9_500), 10);
}

#[test]
fn queue_delay_summary_handles_empty_accumulators() {
    let empty = summarize_queue_delay(None);
    assert_eq!(empty.count, 0);
    let zero = summarize_queue_delay(Some(&QueueDelayTotals::default()));
    assert!(zero.avg_ms.abs() < f64::EPSILON);
    let summary = summarize_queue_delay(Some(&QueueDelayTotals {
        count: 4,
        total_ms: 1_000,
        max_ms: 700,
    }));
    assert!((summary.avg_ms - 250.0).abs() < f64::EPSILON);
    assert_eq!(summary.max_ms, 700);
}

fn scheduler_stats() -> SchedulerStats {
    let mut queues = BTreeMap::new();
    queues.insert(
        "stage1.cpu".to_owned(),
        QueueStats {
            pending: 3,
            running: 1,
            oldest_wait_ms: 2_400,
            ..QueueStats::default()
        },
    );
    for i in 0..12 {
        queues.insert(
            format!("other.{i:02}"),
            QueueStats {
                pending: i,
                running: 0,
                ..QueueStats::default()
            },
        );
    }
    SchedulerStats {
        queues,
        parse_surface: Some(ParseSurfaceStats {
            running: 1,
            pending: 2,
            current_concurrency: 4,
            ..ParseSurfaceStats::default()
        }),
        ..SchedulerStats::default()
    }
}

#[test]
fn scheduler_snapshot_is_bounded_and_sorted() {
    let snapshot = build_scheduler_snapshot(Some(&scheduler_stats())).expect("snapshot");
    assert_eq!(snapshot.highlighted_queues.len(), 1);
    assert_eq!(snapshot.highlighted_queues[0].name, "stage1.cpu");
    assert_eq!(snapshot.top_pending_queues.len(), TOP_PENDING_QUEUE_LIMIT);
    assert_eq!(snapshot.top_pending_queues[0].name, "other.11");
    assert!(snapshot
        .top_pending_queues
        .windows(2)
        .all(|pair| pair[0].pending >= pair[1].pending));
    assert!(build_scheduler_snapshot(None).is_none());
}

#[test]
fn scheduler_summary_marks_missing_queues() {
    let snapshot = build_scheduler_snapshot(Some(&scheduler_stats()));
    let summary = format_scheduler_summary(snapshot.as_ref()).expect("summary");
    assert_eq!(
        summary,
        "parse=r1/p2/cap4 stage1.cpu=r1/p3/wait2s stage1.io=n/a stage1.postings=n/a"
    );
    assert!(format_scheduler_summary(None).is_none());
}

#[test]
fn iso_timestamp_skips_zero() {
    assert_eq!(iso_timestamp(0), None);
    assert_eq!(
        iso_timestamp(1_700_000_000_123).as_deref(),
        Some("2023-11-14T22:13:20.123Z")
    );
}

#[test]
fn soft_kick_cleanup_merges_and_dedupes() {
    let first = TerminationSummary {
        attempted: 2,
        failures: 1,
        terminated_pids: vec![20, 10],
        terminated_ownership_ids: vec!["a".into(), String::new()],
        ..TerminationSummary::default()
    };
    let second = TerminationSummary {
        attempted: 1,
        failures: 0,
        terminated_pids: vec![10],
        terminated_ownership_ids: vec!["a".into(), "b".into()],
        ..TerminationSummary::default()
    };
    let merged = summarize_soft_kick_cleanup(&[first, second]);
    assert_eq!(merged.attempted, 3);
    assert_eq!(merged.failures, 1);
    assert_eq!(merged.terminated_pids, [10, 20]);
    assert_eq!(merged.ownership_ids, ["a", "b"]);
    assert!(merged.is_successful());
}

#[test]
fn soft_kick_without_targets_is_not_successful() {
    let merged = summarize_soft_kick_cleanup(&[TerminationSummary::default()]);
    assert!(!merged.is_successful());
    let all_failed = summarize_soft_kick_cleanup(&[TerminationSummary {
        attempted: 2,
        failures: 2,
        ..TerminationSummary::default()
    }]);
    assert!(!all_failed.is_successful());
}

#[test]
fn stall_snapshot_collects_bounded_state() {
    let registry = SubprocessRegistry::new();
    let _inside = registry.register(
        4_000_001,
        Registration::new("worker").with_ownership("stage1:b:code:shard:s0:file:1:a.rs"),
    );
    let _outside = registry.register(4_000_002, Registration::new("worker").with_ownership("other"));
    let tracker = InFlightFiles::new();
    for i in 0..10 {
        tracker.begin(format!("k{i}"), in_flight(&format!("f{i}.rs"), Some(i), 1_000 + i));
    }
    let ordered = serde_json::json!({ "nextIndex": 3, "pendingCount": 2 });
    let snapshot = build_processing_stall_snapshot(&StallSnapshotInput {
        reason: "stall_snapshot",
        idle_ms: None,
        include_stack: false,
        now_ms: 61_000,
        last_progress_at_ms: 31_000,
        progress: Some(Progress { count: 4, total: 10 }),
        process_start_ms: 1_000,
        in_flight: &tracker,
        ordered_completion: Some(OrderedCompletionSnapshot {
            pending: 2,
            next_index: 3,
            pending_count: 2,
        }),
        ordered_snapshot: Some(&ordered),
        postings_snapshot: None,
        queue_delay: None,
        ownership_prefix: "stage1:b:code:",
        registry: &registry,
        scheduler: None,
    });
    assert_eq!(snapshot.source, SNAPSHOT_SOURCE);
    assert_eq!(snapshot.idle_ms, 30_000);
    assert_eq!(snapshot.progress_done, 4);
    assert_eq!(snapshot.progress_elapsed_ms, 60_000);
    assert_eq!(snapshot.in_flight, 10);
    assert_eq!(snapshot.ordered_pending, 2);
    assert_eq!(snapshot.stalled_files.len(), STALLED_FILE_LIMIT);
    assert_eq!(snapshot.tracked_subprocesses.total, 1);
    assert_eq!(snapshot.tracked_subprocesses.entries[0].pid, 4_000_001);
    assert!(snapshot.scheduler.is_none());
    assert!(snapshot.process.stack.is_none());
    assert_eq!(snapshot.process.pid, std::process::id());

    let rendered = serde_json::to_value(&snapshot).expect("serialize");
    assert_eq!(rendered["orderedSnapshot"]["nextIndex"], 3);
    assert_eq!(rendered["trackedSubprocesses"]["total"], 1);
}
