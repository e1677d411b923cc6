//! Unit tests for deterministic ownership ids and heartbeat text.

use index_warden::config::OwnershipConfig;
use index_warden::watchdog::policy::{
    build_heartbeat_text, normalize_ownership_segment, stage1_file_ownership_id,
    stage1_ownership_prefix, HeartbeatInput,
};

fn ownership(build_id: &str, prefix: Option<&str>) -> OwnershipConfig {
    OwnershipConfig {
        build_id: build_id.to_owned(),
        stage1_file_prefix: prefix.map(str::to_owned),
    }
}

#[test]
fn segments_are_sanitized() {
    assert_eq!(normalize_ownership_segment("src/a b.rs", "x"), "src_a_b.rs");
    assert_eq!(normalize_ownership_segment("  ok-1:2  ", "x"), "ok-1:2");
    assert_eq!(normalize_ownership_segment("a//\\b", "x"), "a_b");
    assert_eq!(normalize_ownership_segment("   ", "fallback"), "fallback");
}

#[test]
fn default_prefix_embeds_build_and_mode() {
    assert_eq!(
        stage1_ownership_prefix(&ownership("b 1", None), "code"),
        "stage1:b_1:code"
    );
    assert_eq!(
        stage1_ownership_prefix(&ownership("b1", None), ""),
        "stage1:b1:mode"
    );
}

#[test]
fn configured_prefix_replaces_stage_and_build() {
    assert_eq!(
        stage1_ownership_prefix(&ownership("b1", Some("custom:run-7")), "prose"),
        "custom:run-7:prose"
    );
    assert_eq!(
        stage1_ownership_prefix(&ownership("b1", Some("   ")), "prose"),
        "stage1:b1:prose"
    );
}

#[test]
fn file_ids_are_deterministic_and_scoped() {
    let config = ownership("b1", None);
    let id = stage1_file_ownership_id(&config, "code", Some("s0"), Some(17), "src/lib.rs");
    assert_eq!(id, "stage1:b1:code:shard:s0:file:17:src_lib.rs");
    assert_eq!(
        id,
        stage1_file_ownership_id(&config, "code", Some("s0"), Some(17), "src/lib.rs")
    );
    assert!(id.starts_with(&format!("{}:", stage1_ownership_prefix(&config, "code"))));
}

#[test]
fn file_ids_fill_missing_parts() {
    let id = stage1_file_ownership_id(&ownership("b1", None), "code", None, None, "");
    assert_eq!(id, "stage1:b1:code:shard:none:file:na:unknown_file");
}

#[test]
fn heartbeat_reports_rate_and_eta() {
    let text = build_heartbeat_text(&HeartbeatInput {
        count: 50,
        total: 100,
        started_at_ms: 1_000,
        now_ms: 11_000,
        in_flight: 3,
        tracked_subprocesses: 2,
    });
    assert_eq!(
        text,
        "[watchdog] progress 50/100 (50.0%) elapsed=10s rate=5.00 files/s eta=10s \
         inFlight=3 trackedSubprocesses=2"
    );
}

#[test]
fn heartbeat_without_progress_has_no_eta() {
    let text = build_heartbeat_text(&HeartbeatInput {
        count: 0,
        total: 0,
        started_at_ms: 5_000,
        now_ms: 5_000,
        in_flight: 0,
        tracked_subprocesses: 0,
    });
    assert!(text.contains("(0.0%)"), "{text}");
    assert!(text.contains("eta=n/a"), "{text}");
    assert!(text.contains("rate=0.00"), "{text}");
}
