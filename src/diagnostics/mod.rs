//! Stall diagnostics.
//!
//! Pure reductions of in-flight file state, scheduler statistics, and the
//! tracked-subprocess registry into bounded, serializable reports. Nothing
//! here mutates shared state except the [`InFlightFiles`] tracker itself.

pub mod process_snapshot;

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::subprocess::registry::{ScopeFilter, SubprocessRegistry, TrackedSnapshot, TerminationSummary};
use process_snapshot::{capture_process_snapshot, ProcessSnapshot, ProcessSnapshotOptions};

/// Default number of stalled files reported.
pub const STALLED_FILE_LIMIT: usize = 6;

/// Tracked subprocesses listed in a stall snapshot.
pub const TRACKED_SUBPROCESS_LIMIT: usize = 8;

/// Pending-sorted queues listed in a scheduler snapshot.
pub const TOP_PENDING_QUEUE_LIMIT: usize = 8;

/// Queues always reported when present.
pub const HIGHLIGHTED_QUEUES: [&str; 3] = ["stage1.cpu", "stage1.io", "stage1.postings"];

/// Source tag stamped on every stall snapshot.
pub const SNAPSHOT_SOURCE: &str = "stage1-watchdog";

/// A file currently being processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightFile {
    /// Repository-relative path.
    pub file: String,
    /// Position in the deterministic output order.
    pub order_index: Option<u64>,
    /// Shard that owns the file.
    pub shard_id: Option<String>,
    /// Index of the file within its shard.
    pub file_index: Option<u64>,
    /// Ownership scope of the file's worker subprocesses.
    pub ownership_id: Option<String>,
    /// When processing began.
    pub started_at_ms: u64,
}

/// Shared set of in-flight files keyed by caller-chosen id.
#[derive(Debug, Clone, Default)]
pub struct InFlightFiles {
    files: Arc<Mutex<HashMap<String, InFlightFile>>>,
}

impl InFlightFiles {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlightFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `file` started processing under `key`.
    pub fn begin(&self, key: impl Into<String>, file: InFlightFile) {
        self.lock().insert(key.into(), file);
    }

    /// Record that `key` finished; returns its entry if it was in flight.
    pub fn finish(&self, key: &str) -> Option<InFlightFile> {
        self.lock().remove(key)
    }

    /// Files currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The `limit` longest-running files at `now_ms`.
    #[must_use]
    pub fn collect_stalled(&self, now_ms: u64, limit: usize) -> Vec<StalledFile> {
        collect_stalled_files(self.lock().values(), now_ms, limit)
    }
}

/// One ranked in-flight file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StalledFile {
    /// Position in the output order.
    pub order_index: Option<u64>,
    /// Repository-relative path.
    pub file: String,
    /// Owning shard.
    pub shard_id: Option<String>,
    /// Index within the shard.
    pub file_index: Option<u64>,
    /// Worker ownership scope.
    pub ownership_id: Option<String>,
    /// Time since processing began.
    pub elapsed_ms: u64,
}

impl StalledFile {
    fn from_in_flight(entry: &InFlightFile, now_ms: u64) -> Self {
        Self {
            order_index: entry.order_index,
            file: entry.file.clone(),
            shard_id: entry.shard_id.clone(),
            file_index: entry.file_index,
            ownership_id: entry.ownership_id.clone(),
            elapsed_ms: now_ms.saturating_sub(entry.started_at_ms),
        }
    }

    fn order_key(&self) -> u64 {
        self.order_index.unwrap_or(u64::MAX)
    }
}

/// Heap wrapper: "greater" means "more stalled".
struct Ranked(StalledFile);

impl Ranked {
    fn key(&self) -> (u64, Reverse<u64>, Reverse<&str>) {
        (
            self.0.elapsed_ms,
            Reverse(self.0.order_key()),
            Reverse(self.0.file.as_str()),
        )
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Bounded top-K of the longest-running files.
///
/// Ordered by elapsed time descending, then order index ascending with
/// missing indexes last. Only `limit` candidates are held at any time.
#[must_use]
pub fn collect_stalled_files<'a, I>(files: I, now_ms: u64, limit: usize) -> Vec<StalledFile>
where
    I: IntoIterator<Item = &'a InFlightFile>,
{
    if limit == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(limit + 1);
    for entry in files {
        let candidate = Ranked(StalledFile::from_in_flight(entry, now_ms));
        if heap.len() < limit {
            heap.push(Reverse(candidate));
        } else if heap.peek().is_some_and(|Reverse(weakest)| candidate > *weakest) {
            heap.pop();
            heap.push(Reverse(candidate));
        }
    }
    let mut ranked: Vec<Ranked> = heap.into_iter().map(|Reverse(ranked)| ranked).collect();
    ranked.sort_by(|a, b| b.cmp(a));
    ranked.into_iter().map(|Ranked(file)| file).collect()
}

/// `file#order@Ns` list for compact log lines.
#[must_use]
pub fn format_stalled_file_text(files: &[StalledFile]) -> String {
    files
        .iter()
        .map(|entry| {
            let order = entry
                .order_index
                .map_or_else(|| "?".to_owned(), |index| index.to_string());
            format!(
                "{}#{order}@{}s",
                display_file(&entry.file),
                round_secs(entry.elapsed_ms)
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `file@Ns` list used by the progress heartbeat.
#[must_use]
pub fn format_oldest_in_flight(files: &[StalledFile]) -> Vec<String> {
    files
        .iter()
        .map(|entry| format!("{}@{}s", display_file(&entry.file), round_secs(entry.elapsed_ms)))
        .collect()
}

fn display_file(file: &str) -> &str {
    if file.is_empty() {
        "unknown"
    } else {
        file
    }
}

/// Milliseconds rounded to whole seconds, half up.
#[must_use]
pub fn round_secs(ms: u64) -> u64 {
    ms.saturating_add(500) / 1000
}

/// Raw queue-delay accumulators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDelayTotals {
    /// Samples recorded.
    pub count: u64,
    /// Sum of all samples.
    pub total_ms: u64,
    /// Largest sample.
    pub max_ms: u64,
}

/// Reduced queue-delay metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDelaySummary {
    /// Samples recorded.
    pub count: u64,
    /// Mean sample.
    pub avg_ms: f64,
    /// Largest sample.
    pub max_ms: u64,
}

/// Reduce accumulators to count / mean / max.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn summarize_queue_delay(totals: Option<&QueueDelayTotals>) -> QueueDelaySummary {
    let Some(totals) = totals else {
        return QueueDelaySummary::default();
    };
    QueueDelaySummary {
        count: totals.count,
        avg_ms: if totals.count > 0 {
            totals.total_ms as f64 / totals.count as f64
        } else {
            0.0
        },
        max_ms: totals.max_ms,
    }
}

/// Per-queue scheduler statistics as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueStats {
    /// Resource surface the queue draws from.
    pub surface: Option<String>,
    /// Tasks waiting.
    pub pending: u64,
    /// Tasks executing.
    pub running: u64,
    /// Bytes waiting.
    pub pending_bytes: u64,
    /// Bytes executing.
    pub in_flight_bytes: u64,
    /// Age of the oldest waiting task.
    pub oldest_wait_ms: u64,
}

/// Adaptive concurrency state of the parse surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParseSurfaceStats {
    /// Lower concurrency bound.
    pub min_concurrency: u64,
    /// Upper concurrency bound.
    pub max_concurrency: u64,
    /// Current concurrency cap.
    pub current_concurrency: u64,
    /// Tasks executing.
    pub running: u64,
    /// Tasks waiting.
    pub pending: u64,
}

/// Scheduler-wide activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerActivity {
    /// Tasks waiting across all queues.
    pub pending: u64,
    /// Tasks executing across all queues.
    pub running: u64,
}

/// Token utilization ratios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Utilization {
    /// CPU tokens in use.
    pub cpu: f64,
    /// I/O tokens in use.
    pub io: f64,
    /// Memory tokens in use.
    pub mem: f64,
}

/// Raw scheduler statistics consumed from the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerStats {
    /// Queues by name.
    pub queues: BTreeMap<String, QueueStats>,
    /// Parse surface state, when adaptive concurrency is active.
    pub parse_surface: Option<ParseSurfaceStats>,
    /// Aggregate activity.
    pub activity: SchedulerActivity,
    /// Aggregate utilization.
    pub utilization: Utilization,
}

/// One queue as reported in a stall snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    /// Queue name.
    pub name: String,
    /// Resource surface.
    pub surface: Option<String>,
    /// Tasks waiting.
    pub pending: u64,
    /// Tasks executing.
    pub running: u64,
    /// Bytes waiting.
    pub pending_bytes: u64,
    /// Bytes executing.
    pub in_flight_bytes: u64,
    /// Age of the oldest waiting task.
    pub oldest_wait_ms: u64,
}

impl QueueSummary {
    fn new(name: &str, queue: &QueueStats) -> Self {
        Self {
            name: name.to_owned(),
            surface: queue.surface.clone(),
            pending: queue.pending,
            running: queue.running,
            pending_bytes: queue.pending_bytes,
            in_flight_bytes: queue.in_flight_bytes,
            oldest_wait_ms: queue.oldest_wait_ms,
        }
    }
}

/// Bounded scheduler view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    /// Aggregate activity.
    pub activity: SchedulerActivity,
    /// Aggregate utilization.
    pub utilization: Utilization,
    /// Parse surface state.
    pub parse_surface: Option<ParseSurfaceStats>,
    /// The stage-1 queues, when present.
    pub highlighted_queues: Vec<QueueSummary>,
    /// Busiest queues by pending, running, then oldest wait.
    pub top_pending_queues: Vec<QueueSummary>,
}

/// Reduce scheduler statistics to a bounded snapshot.
#[must_use]
pub fn build_scheduler_snapshot(stats: Option<&SchedulerStats>) -> Option<SchedulerSnapshot> {
    let stats = stats?;
    let highlighted_queues = HIGHLIGHTED_QUEUES
        .iter()
        .filter_map(|name| stats.queues.get(*name).map(|queue| QueueSummary::new(name, queue)))
        .collect();
    let mut top_pending_queues: Vec<QueueSummary> = stats
        .queues
        .iter()
        .filter(|(_, queue)| queue.pending > 0 || queue.running > 0)
        .map(|(name, queue)| QueueSummary::new(name, queue))
        .collect();
    top_pending_queues.sort_by(|a, b| {
        b.pending
            .cmp(&a.pending)
            .then_with(|| b.running.cmp(&a.running))
            .then_with(|| b.oldest_wait_ms.cmp(&a.oldest_wait_ms))
    });
    top_pending_queues.truncate(TOP_PENDING_QUEUE_LIMIT);
    Some(SchedulerSnapshot {
        activity: stats.activity,
        utilization: stats.utilization,
        parse_surface: stats.parse_surface,
        highlighted_queues,
        top_pending_queues,
    })
}

/// `parse=r/p/capN stage1.cpu=rX/pY/waitNs ...` capacity line.
#[must_use]
pub fn format_scheduler_summary(snapshot: Option<&SchedulerSnapshot>) -> Option<String> {
    let snapshot = snapshot?;
    let parse = snapshot.parse_surface.map_or_else(
        || "parse=n/a".to_owned(),
        |parse| {
            format!(
                "parse=r{}/p{}/cap{}",
                parse.running, parse.pending, parse.current_concurrency
            )
        },
    );
    let mut parts = vec![parse];
    for name in HIGHLIGHTED_QUEUES {
        let queue = snapshot
            .highlighted_queues
            .iter()
            .find(|queue| queue.name == name);
        parts.push(queue.map_or_else(
            || format!("{name}=n/a"),
            |queue| {
                format!(
                    "{name}=r{}/p{}/wait{}s",
                    queue.running,
                    queue.pending,
                    round_secs(queue.oldest_wait_ms)
                )
            },
        ));
    }
    Some(parts.join(" "))
}

/// Progress counters reported by the stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Files completed.
    pub count: u64,
    /// Files expected.
    pub total: u64,
}

impl Progress {
    /// Whether every expected file has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.count >= self.total
    }
}

/// State of the ordered-completion tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderedCompletionSnapshot {
    /// Completed results waiting on an earlier index.
    pub pending: u64,
    /// Next index to emit.
    pub next_index: u64,
    /// Buffered entries.
    pub pending_count: u64,
}

/// Everything a stall snapshot is built from.
#[derive(Debug, Clone, Copy)]
pub struct StallSnapshotInput<'a> {
    /// Why the snapshot was taken.
    pub reason: &'a str,
    /// Precomputed idle time; derived from `last_progress_at_ms` when unset.
    pub idle_ms: Option<u64>,
    /// Capture stack frames.
    pub include_stack: bool,
    /// Snapshot time.
    pub now_ms: u64,
    /// Last progress tick.
    pub last_progress_at_ms: u64,
    /// Stage progress.
    pub progress: Option<Progress>,
    /// When the stage began processing.
    pub process_start_ms: u64,
    /// Files in flight.
    pub in_flight: &'a InFlightFiles,
    /// Ordered-completion tracker state.
    pub ordered_completion: Option<OrderedCompletionSnapshot>,
    /// Opaque ordered-appender state.
    pub ordered_snapshot: Option<&'a Value>,
    /// Opaque postings-queue state.
    pub postings_snapshot: Option<&'a Value>,
    /// Queue-delay accumulators.
    pub queue_delay: Option<&'a QueueDelayTotals>,
    /// Stage ownership prefix for the tracked-subprocess listing.
    pub ownership_prefix: &'a str,
    /// Registry to list tracked subprocesses from.
    pub registry: &'a SubprocessRegistry,
    /// Scheduler statistics.
    pub scheduler: Option<&'a SchedulerStats>,
}

/// Bounded, serializable picture of a stalled stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallSnapshot {
    /// Why the snapshot was taken.
    pub reason: String,
    /// ISO-8601 snapshot time.
    pub generated_at: String,
    /// Fixed source tag.
    pub source: &'static str,
    /// Time since the last progress tick.
    pub idle_ms: u64,
    /// Files completed.
    pub progress_done: u64,
    /// Files expected.
    pub progress_total: u64,
    /// Time since the stage began.
    pub progress_elapsed_ms: u64,
    /// ISO-8601 time of the last progress tick.
    pub last_progress_at: Option<String>,
    /// Files in flight.
    pub in_flight: usize,
    /// Results waiting on ordered emission.
    pub ordered_pending: u64,
    /// Ordered-completion tracker state.
    pub ordered_completion: Option<OrderedCompletionSnapshot>,
    /// Opaque ordered-appender state.
    pub ordered_snapshot: Option<Value>,
    /// Opaque postings-queue state.
    pub postings_snapshot: Option<Value>,
    /// Queue-delay metrics.
    pub queue_delay_ms: QueueDelaySummary,
    /// Longest-running files.
    pub stalled_files: Vec<StalledFile>,
    /// Tracked subprocesses under the stage prefix.
    pub tracked_subprocesses: TrackedSnapshot,
    /// Scheduler view.
    pub scheduler: Option<SchedulerSnapshot>,
    /// Host process view.
    pub process: ProcessSnapshot,
}

/// Assemble a [`StallSnapshot`]; every collection in it is bounded.
#[must_use]
pub fn build_processing_stall_snapshot(input: &StallSnapshotInput<'_>) -> StallSnapshot {
    let now = input.now_ms;
    let idle_ms = input
        .idle_ms
        .unwrap_or_else(|| now.saturating_sub(input.last_progress_at_ms));
    let progress = input.progress.unwrap_or_default();
    let filter = if input.ownership_prefix.is_empty() {
        ScopeFilter::All
    } else {
        ScopeFilter::prefix(input.ownership_prefix)
    };
    StallSnapshot {
        reason: input.reason.to_owned(),
        generated_at: iso_timestamp(now).unwrap_or_default(),
        source: SNAPSHOT_SOURCE,
        idle_ms,
        progress_done: progress.count,
        progress_total: progress.total,
        progress_elapsed_ms: now.saturating_sub(input.process_start_ms),
        last_progress_at: iso_timestamp(input.last_progress_at_ms),
        in_flight: input.in_flight.len(),
        ordered_pending: input.ordered_completion.map_or(0, |ordered| ordered.pending),
        ordered_completion: input.ordered_completion,
        ordered_snapshot: input.ordered_snapshot.cloned(),
        postings_snapshot: input.postings_snapshot.cloned(),
        queue_delay_ms: summarize_queue_delay(input.queue_delay),
        stalled_files: input.in_flight.collect_stalled(now, STALLED_FILE_LIMIT),
        tracked_subprocesses: input.registry.snapshot(&filter, TRACKED_SUBPROCESS_LIMIT),
        scheduler: build_scheduler_snapshot(input.scheduler),
        process: capture_process_snapshot(&ProcessSnapshotOptions::for_stall(input.include_stack)),
    }
}

/// ISO-8601 rendering of epoch milliseconds; `None` for zero.
#[must_use]
pub fn iso_timestamp(epoch_ms: u64) -> Option<String> {
    if epoch_ms == 0 {
        return None;
    }
    let millis = i64::try_from(epoch_ms).ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Merged outcome of the per-scope terminations of one soft-kick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftKickCleanupSummary {
    /// Termination attempts across all scopes.
    pub attempted: usize,
    /// Failed attempts across all scopes.
    pub failures: usize,
    /// Distinct terminated pids, ascending.
    pub terminated_pids: Vec<u32>,
    /// Distinct terminated scopes, sorted.
    pub ownership_ids: Vec<String>,
}

impl SoftKickCleanupSummary {
    /// Whether the soft-kick reached at least one child and not all failed.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.attempted > 0 && self.failures < self.attempted
    }
}

/// Merge per-scope termination summaries into one de-duplicated summary.
#[must_use]
pub fn summarize_soft_kick_cleanup(results: &[TerminationSummary]) -> SoftKickCleanupSummary {
    let terminated_pids: BTreeSet<u32> = results
        .iter()
        .flat_map(|result| result.terminated_pids.iter().copied())
        .collect();
    let ownership_ids: BTreeSet<String> = results
        .iter()
        .flat_map(|result| result.terminated_ownership_ids.iter().cloned())
        .filter(|id| !id.is_empty())
        .collect();
    SoftKickCleanupSummary {
        attempted: results.iter().map(|result| result.attempted).sum(),
        failures: results.iter().map(|result| result.failures).sum(),
        terminated_pids: terminated_pids.into_iter().collect(),
        ownership_ids: ownership_ids.into_iter().collect(),
    }
}
