use index_warden::diagnostics::process_snapshot::{
    capture_process_snapshot, classify_handle, summarize_handles, ProcessSnapshotOptions,
    ESCALATION_FRAME_LIMIT, ROUTINE_FRAME_LIMIT,
};

#[test]
fn handle_targets_are_classified() {
    assert_eq!(classify_handle("socket:[12345]"), "socket");
    assert_eq!(classify_handle("pipe:[99]"), "pipe");
    assert_eq!(classify_handle("anon_inode:[eventpoll]"), "anon_inode:eventpoll");
    assert_eq!(classify_handle("/dev/null"), "device");
    assert_eq!(classify_handle("/tmp/index.db"), "file");
}

#[test]
fn handle_summary_keeps_most_common_kinds() {
    let kinds = ["file", "socket", "file", "pipe", "file", "socket", "device"]
        .into_iter()
        .map(str::to_owned);
    let summary = summarize_handles(kinds, 2);
    assert_eq!(summary.total, 7);
    assert_eq!(summary.by_type.len(), 2);
    assert_eq!(summary.by_type[0].kind, "file");
    assert_eq!(summary.by_type[0].count, 3);
    assert_eq!(summary.by_type[1].kind, "socket");
    assert_eq!(summary.omitted_types, 2);
}

#[test]
fn frame_limit_depends_on_escalation() {
    assert_eq!(
        ProcessSnapshotOptions::for_stall(true).frame_limit,
        ESCALATION_FRAME_LIMIT
    );
    assert_eq!(
        ProcessSnapshotOptions::for_stall(false).frame_limit,
        ROUTINE_FRAME_LIMIT
    );
}

#[test]
fn stack_is_captured_only_on_request() {
    let without = capture_process_snapshot(&ProcessSnapshotOptions::for_stall(false));
    assert!(without.stack.is_none());
    assert!(without.runtime.is_none());

    let with = capture_process_snapshot(&ProcessSnapshotOptions {
        include_stack: true,
        frame_limit: 3,
        handle_type_limit: 4,
    });
    let stack = with.stack.expect("stack requested");
    assert!(stack.frames.len() <= 3);
    assert!(with.handles.by_type.len() <= 4);
}

#[tokio::test]
async fn runtime_counters_inside_tokio() {
    let snapshot = capture_process_snapshot(&ProcessSnapshotOptions::for_stall(false));
    let runtime = snapshot.runtime.expect("inside a runtime");
    assert!(runtime.workers >= 1);
}
