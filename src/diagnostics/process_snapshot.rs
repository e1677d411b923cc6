//! Point-in-time view of the host process.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Frames kept when the stack is captured for an escalation.
pub const ESCALATION_FRAME_LIMIT: usize = 16;

/// Frames kept for routine snapshots.
pub const ROUTINE_FRAME_LIMIT: usize = 8;

/// Handle kinds listed before the remainder is folded away.
pub const HANDLE_TYPE_LIMIT: usize = 8;

/// Capture bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSnapshotOptions {
    /// Capture a backtrace of the calling thread.
    pub include_stack: bool,
    /// Maximum frames kept.
    pub frame_limit: usize,
    /// Maximum handle kinds listed.
    pub handle_type_limit: usize,
}

impl ProcessSnapshotOptions {
    /// Bounds used by stall snapshots.
    #[must_use]
    pub fn for_stall(include_stack: bool) -> Self {
        Self {
            include_stack,
            frame_limit: if include_stack {
                ESCALATION_FRAME_LIMIT
            } else {
                ROUTINE_FRAME_LIMIT
            },
            handle_type_limit: HANDLE_TYPE_LIMIT,
        }
    }
}

/// Captured stack of the calling thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSnapshot {
    /// Frames, innermost first, at most `frame_limit`.
    pub frames: Vec<String>,
    /// Frames dropped by the limit.
    pub truncated_frames: usize,
}

/// Count of one kind of open handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleTypeCount {
    /// Handle kind (`file`, `socket`, `pipe`, ...).
    pub kind: String,
    /// Open handles of this kind.
    pub count: usize,
}

/// Open handles of the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleSummary {
    /// All open handles.
    pub total: usize,
    /// Most common kinds, largest first.
    pub by_type: Vec<HandleTypeCount>,
    /// Kinds omitted by the limit.
    pub omitted_types: usize,
}

/// Async runtime counters, when called inside a tokio runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCounters {
    /// Worker threads.
    pub workers: usize,
    /// Tasks not yet completed.
    pub alive_tasks: usize,
}

/// Host process snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    /// Host pid.
    pub pid: u32,
    /// ISO-8601 capture time.
    pub captured_at: String,
    /// Stack, when requested.
    pub stack: Option<StackSnapshot>,
    /// Open handles.
    pub handles: HandleSummary,
    /// Async runtime counters.
    pub runtime: Option<RuntimeCounters>,
}

/// Capture a bounded snapshot of the current process.
#[must_use]
pub fn capture_process_snapshot(options: &ProcessSnapshotOptions) -> ProcessSnapshot {
    ProcessSnapshot {
        pid: std::process::id(),
        captured_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        stack: options
            .include_stack
            .then(|| capture_stack(options.frame_limit)),
        handles: summarize_handles(open_handle_kinds(), options.handle_type_limit),
        runtime: tokio::runtime::Handle::try_current().ok().map(|handle| {
            let metrics = handle.metrics();
            RuntimeCounters {
                workers: metrics.num_workers(),
                alive_tasks: metrics.num_alive_tasks(),
            }
        }),
    }
}

fn capture_stack(frame_limit: usize) -> StackSnapshot {
    let rendered = Backtrace::force_capture().to_string();
    let frames: Vec<String> = rendered
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let (index, symbol) = line.split_once(": ")?;
            index
                .chars()
                .all(|c| c.is_ascii_digit())
                .then(|| symbol.trim().to_owned())
        })
        .filter(|symbol| !symbol.is_empty())
        .collect();
    let truncated_frames = frames.len().saturating_sub(frame_limit);
    StackSnapshot {
        frames: frames.into_iter().take(frame_limit).collect(),
        truncated_frames,
    }
}

/// Fold handle kinds into counts, keeping the `limit` most common.
#[must_use]
pub fn summarize_handles<I>(kinds: I, limit: usize) -> HandleSummary
where
    I: IntoIterator<Item = String>,
{
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0;
    for kind in kinds {
        *counts.entry(kind).or_default() += 1;
        total += 1;
    }
    let mut by_type: Vec<HandleTypeCount> = counts
        .into_iter()
        .map(|(kind, count)| HandleTypeCount { kind, count })
        .collect();
    by_type.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.kind.cmp(&b.kind)));
    let omitted_types = by_type.len().saturating_sub(limit);
    by_type.truncate(limit);
    HandleSummary {
        total,
        by_type,
        omitted_types,
    }
}

/// Classify an fd link target as read from `/proc/self/fd`.
#[must_use]
pub fn classify_handle(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("anon_inode:") {
        return format!("anon_inode:{}", rest.trim_matches(|c| c == '[' || c == ']'));
    }
    if let Some((kind, _)) = target.split_once(":[") {
        return kind.to_owned();
    }
    if target.starts_with("/dev/") {
        return "device".to_owned();
    }
    "file".to_owned()
}

#[cfg(target_os = "linux")]
fn open_handle_kinds() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .map(|target| classify_handle(&target.to_string_lossy()))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn open_handle_kinds() -> Vec<String> {
    Vec::new()
}
