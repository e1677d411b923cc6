//! In-memory registry of live tracked subprocesses.
//!
//! Entries are keyed by an opaque [`EntryId`] and carry an optional
//! ownership scope so bulk operations can target one unit of work. All
//! state sits behind a synchronous mutex that is never held across an
//! await point: every read-decide-mutate sequence for one entry completes
//! before another task can observe the registry.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::process::Child;
use tracing::{debug, warn};
use uuid::Uuid;

use super::hooks::ShutdownHooks;
use super::kill_tree::{
    kill_process_tree, kill_process_tree_blocking, KillOptions, KillOutcome, KillSignal,
};
use super::options::{SpawnOptions, DEFAULT_KILL_GRACE_MS};
use crate::config::SubprocessConfig;
use crate::{AppError, Result};

/// Default number of ledger events retained.
pub const DEFAULT_EVENT_LEDGER_LIMIT: usize = 512;

static GLOBAL: OnceLock<SubprocessRegistry> = OnceLock::new();

/// Opaque handle for one registered child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(Uuid);

/// Selects registry entries by ownership scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ScopeFilter {
    /// Every entry, scoped or not.
    #[default]
    All,
    /// Entries whose ownership id equals the given string.
    Exact(String),
    /// Entries whose ownership id starts with the given string.
    Prefix(String),
}

impl ScopeFilter {
    /// Exact-match filter.
    #[must_use]
    pub fn exact(ownership_id: impl Into<String>) -> Self {
        Self::Exact(ownership_id.into())
    }

    /// Prefix-match filter.
    #[must_use]
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Whether an entry with `ownership_id` is selected.
    #[must_use]
    pub fn matches(&self, ownership_id: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Exact(wanted) => ownership_id == Some(wanted.as_str()),
            Self::Prefix(prefix) => ownership_id.is_some_and(|id| id.starts_with(prefix.as_str())),
        }
    }
}

/// Metadata recorded for a child at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Ownership scope; `None` lives only in the global collection.
    pub ownership_id: Option<String>,
    /// Executable name or path.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Optional label.
    pub name: Option<String>,
    /// Kill the process group rather than only the pid.
    pub kill_tree: bool,
    /// First termination signal.
    pub kill_signal: KillSignal,
    /// Escalation window for non-forced terminations.
    pub kill_grace_ms: u64,
    /// Whether the child leads its own process group.
    pub detached: bool,
}

impl Registration {
    /// Minimal registration for a command with default kill settings.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            ownership_id: None,
            command: command.into(),
            args: Vec::new(),
            name: None,
            kill_tree: true,
            kill_signal: KillSignal::default(),
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            detached: cfg!(unix),
        }
    }

    /// Registration mirroring resolved spawn options.
    #[must_use]
    pub fn from_options(
        command: &str,
        args: &[String],
        options: &SpawnOptions,
        ownership_id: Option<String>,
    ) -> Self {
        Self {
            ownership_id,
            command: command.to_owned(),
            args: args.to_vec(),
            name: options.name.clone(),
            kill_tree: options.kill_tree,
            kill_signal: options.kill_signal,
            kill_grace_ms: options.resolved_kill_grace_ms(),
            detached: options.resolved_detached(),
        }
    }

    /// Attach an ownership scope.
    #[must_use]
    pub fn with_ownership(mut self, ownership_id: impl Into<String>) -> Self {
        self.ownership_id = Some(ownership_id.into());
        self
    }

    /// Override the kill grace window.
    #[must_use]
    pub fn with_kill_grace_ms(mut self, kill_grace_ms: u64) -> Self {
        self.kill_grace_ms = kill_grace_ms;
        self
    }
}

#[derive(Debug, Clone)]
struct TrackedEntry {
    pid: u32,
    registration: Registration,
    spawned_at_ms: i64,
}

impl TrackedEntry {
    fn kill_options(&self, force: bool) -> KillOptions {
        let options = KillOptions {
            kill_tree: self.registration.kill_tree,
            detached: self.registration.detached,
            signal: self.registration.kill_signal,
            grace_ms: self.registration.kill_grace_ms,
        };
        if force {
            options.forced()
        } else {
            options
        }
    }
}

/// Ledger event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryEventKind {
    /// A child was added.
    Registered,
    /// A child's exit was observed.
    Exited,
    /// A child was removed without an observed exit.
    Unregistered,
    /// A termination attempt finished.
    Killed,
    /// A termination attempt failed.
    KillFailed,
}

/// One entry of the bounded event ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEvent {
    /// What happened.
    pub kind: RegistryEventKind,
    /// Affected process.
    pub pid: u32,
    /// Scope of the affected process.
    pub ownership_id: Option<String>,
    /// Wall-clock time of the event.
    pub at_ms: i64,
    /// Free-form detail such as a termination reason or exit status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Serializable view of one tracked child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedChildView {
    /// Process id.
    pub pid: u32,
    /// Ownership scope.
    pub ownership_id: Option<String>,
    /// Executable.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Optional label.
    pub name: Option<String>,
    /// Registration time.
    pub started_at_ms: i64,
    /// Time since registration.
    pub elapsed_ms: u64,
}

/// Bounded listing of tracked children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSnapshot {
    /// Matching entries before the limit was applied.
    pub total: usize,
    /// Oldest matching entries, at most `limit`.
    pub entries: Vec<TrackedChildView>,
}

/// Result class of one termination attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillAuditOutcome {
    /// Exited within the grace window, or was already gone.
    Terminated,
    /// Needed `SIGKILL`.
    Forced,
    /// The signal could not be delivered.
    Failed,
}

/// Immutable record of one termination attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillAudit {
    /// Target process.
    pub pid: u32,
    /// Target scope.
    pub ownership_id: Option<String>,
    /// First signal sent.
    pub signal: KillSignal,
    /// Result class.
    pub outcome: KillAuditOutcome,
    /// The target is no longer running.
    pub terminated: bool,
    /// `SIGKILL` escalation was needed.
    pub forced: bool,
    /// Delivery error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time.
    pub timestamp_ms: i64,
}

impl KillAudit {
    fn from_result(entry: &TrackedEntry, signal: KillSignal, result: &Result<KillOutcome>) -> Self {
        let (outcome, terminated, forced, error) = match result {
            Ok(outcome) if outcome.forced => (KillAuditOutcome::Forced, outcome.terminated, true, None),
            Ok(outcome) => (KillAuditOutcome::Terminated, outcome.terminated, false, None),
            Err(err) => (KillAuditOutcome::Failed, false, false, Some(err.to_string())),
        };
        Self {
            pid: entry.pid,
            ownership_id: entry.registration.ownership_id.clone(),
            signal,
            outcome,
            terminated,
            forced,
            error,
            timestamp_ms: now_ms(),
        }
    }
}

/// Parameters for [`SubprocessRegistry::terminate_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminateRequest {
    /// Why the termination happens; recorded in the ledger.
    pub reason: String,
    /// Skip the grace window.
    pub force: bool,
    /// Entries to drain.
    pub filter: ScopeFilter,
}

impl TerminateRequest {
    /// Request for `filter` with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>, filter: ScopeFilter) -> Self {
        Self {
            reason: reason.into(),
            force: false,
            filter,
        }
    }

    /// Skip the grace window.
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Aggregate outcome of one bulk termination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationSummary {
    /// Reason passed in the request.
    pub reason: String,
    /// Entries matched and drained.
    pub tracked: usize,
    /// Termination attempts made.
    pub attempted: usize,
    /// Attempts that failed.
    pub failures: usize,
    /// Pids signalled, ascending.
    pub targeted_pids: Vec<u32>,
    /// Pids confirmed gone, ascending.
    pub terminated_pids: Vec<u32>,
    /// Distinct scopes touched, sorted.
    pub ownership_ids: Vec<String>,
    /// Distinct scopes with at least one confirmed termination, sorted.
    pub terminated_ownership_ids: Vec<String>,
    /// One audit per attempt, ordered by pid then ownership id.
    pub kill_audit: Vec<KillAudit>,
}

impl TerminationSummary {
    fn from_audits(reason: String, tracked: usize, mut kill_audit: Vec<KillAudit>) -> Self {
        kill_audit.sort_by(|a, b| {
            a.pid
                .cmp(&b.pid)
                .then_with(|| a.ownership_id.cmp(&b.ownership_id))
        });
        let targeted_pids = kill_audit.iter().map(|audit| audit.pid).collect();
        let terminated_pids = kill_audit
            .iter()
            .filter(|audit| audit.terminated)
            .map(|audit| audit.pid)
            .collect();
        let ownership_ids: BTreeSet<String> = kill_audit
            .iter()
            .filter_map(|audit| audit.ownership_id.clone())
            .collect();
        let terminated_ownership_ids: BTreeSet<String> = kill_audit
            .iter()
            .filter(|audit| audit.terminated)
            .filter_map(|audit| audit.ownership_id.clone())
            .collect();
        Self {
            reason,
            tracked,
            attempted: kill_audit.len(),
            failures: kill_audit
                .iter()
                .filter(|audit| audit.outcome == KillAuditOutcome::Failed)
                .count(),
            targeted_pids,
            terminated_pids,
            ownership_ids: ownership_ids.into_iter().collect(),
            terminated_ownership_ids: terminated_ownership_ids.into_iter().collect(),
            kill_audit,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<EntryId, TrackedEntry>,
    events: VecDeque<RegistryEvent>,
}

#[derive(Debug)]
struct RegistryInner {
    state: Mutex<RegistryState>,
    event_limit: usize,
    install_hooks: bool,
}

/// Process-wide (or test-isolated) registry of live children.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Debug, Clone)]
pub struct SubprocessRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SubprocessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessRegistry {
    /// Isolated registry without shutdown hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::build(DEFAULT_EVENT_LEDGER_LIMIT, false)
    }

    /// Isolated registry with a custom ledger bound.
    #[must_use]
    pub fn with_event_limit(event_limit: usize) -> Self {
        Self::build(event_limit, false)
    }

    fn build(event_limit: usize, install_hooks: bool) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                event_limit: event_limit.max(1),
                install_hooks,
            }),
        }
    }

    /// The process-wide registry; shutdown hooks install on its first
    /// registration.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| Self::build(DEFAULT_EVENT_LEDGER_LIMIT, true))
    }

    /// Create the process-wide registry from configuration.
    ///
    /// Has no effect if the global registry already exists.
    pub fn init_global(config: &SubprocessConfig) -> &'static Self {
        GLOBAL.get_or_init(|| Self::build(config.event_ledger_limit, true))
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn push_event(&self, state: &mut RegistryState, event: RegistryEvent) {
        if state.events.len() >= self.inner.event_limit {
            state.events.pop_front();
        }
        state.events.push_back(event);
    }

    /// Track a live child; the returned handle removes it again.
    pub fn register(&self, pid: u32, registration: Registration) -> Unregister {
        if self.inner.install_hooks {
            ShutdownHooks::global().install();
        }
        let id = EntryId(Uuid::new_v4());
        let spawned_at_ms = now_ms();
        debug!(pid, ownership_id = ?registration.ownership_id, "registering tracked subprocess");
        let mut state = self.lock();
        let event = RegistryEvent {
            kind: RegistryEventKind::Registered,
            pid,
            ownership_id: registration.ownership_id.clone(),
            at_ms: spawned_at_ms,
            detail: Some(registration.command.clone()),
        };
        self.push_event(&mut state, event);
        state.entries.insert(
            id,
            TrackedEntry {
                pid,
                registration,
                spawned_at_ms,
            },
        );
        drop(state);
        Unregister {
            registry: self.clone(),
            id,
        }
    }

    /// Register a tokio child and hand back a wrapper that removes the
    /// entry when the child is reaped or dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the child has already been reaped.
    pub fn track(&self, child: Child, registration: Registration) -> Result<TrackedChild> {
        let Some(pid) = child.id() else {
            return Err(AppError::Spawn {
                message: format!("{} has already exited", registration.command),
                result: Box::new(super::SubprocessResult::not_started(0)),
            });
        };
        let unregister = self.register(pid, registration);
        Ok(TrackedChild { child, unregister })
    }

    fn remove(&self, id: EntryId, kind: RegistryEventKind, detail: Option<String>) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.remove(&id) else {
            return false;
        };
        let event = RegistryEvent {
            kind,
            pid: entry.pid,
            ownership_id: entry.registration.ownership_id,
            at_ms: now_ms(),
            detail,
        };
        self.push_event(&mut state, event);
        true
    }

    /// Number of live entries selected by `filter`.
    #[must_use]
    pub fn count(&self, filter: &ScopeFilter) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| filter.matches(entry.registration.ownership_id.as_deref()))
            .count()
    }

    /// Oldest live entries selected by `filter`, at most `limit`.
    #[must_use]
    pub fn snapshot(&self, filter: &ScopeFilter, limit: usize) -> TrackedSnapshot {
        let now = now_ms();
        let state = self.lock();
        let mut matched: Vec<&TrackedEntry> = state
            .entries
            .values()
            .filter(|entry| filter.matches(entry.registration.ownership_id.as_deref()))
            .collect();
        let total = matched.len();
        matched.sort_by(|a, b| {
            a.spawned_at_ms
                .cmp(&b.spawned_at_ms)
                .then_with(|| a.pid.cmp(&b.pid))
        });
        let entries = matched
            .into_iter()
            .take(limit)
            .map(|entry| TrackedChildView {
                pid: entry.pid,
                ownership_id: entry.registration.ownership_id.clone(),
                command: entry.registration.command.clone(),
                args: entry.registration.args.clone(),
                name: entry.registration.name.clone(),
                started_at_ms: entry.spawned_at_ms,
                elapsed_ms: u64::try_from(now - entry.spawned_at_ms).unwrap_or(0),
            })
            .collect();
        TrackedSnapshot { total, entries }
    }

    /// Most recent ledger events selected by `filter`, oldest first.
    #[must_use]
    pub fn events(&self, filter: &ScopeFilter, limit: usize) -> Vec<RegistryEvent> {
        let state = self.lock();
        let mut recent: Vec<RegistryEvent> = state
            .events
            .iter()
            .rev()
            .filter(|event| filter.matches(event.ownership_id.as_deref()))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    fn drain(&self, filter: &ScopeFilter, reason: &str) -> Vec<TrackedEntry> {
        let mut state = self.lock();
        let ids: Vec<EntryId> = state
            .entries
            .iter()
            .filter(|(_, entry)| filter.matches(entry.registration.ownership_id.as_deref()))
            .map(|(id, _)| *id)
            .collect();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = state.entries.remove(&id) {
                let event = RegistryEvent {
                    kind: RegistryEventKind::Unregistered,
                    pid: entry.pid,
                    ownership_id: entry.registration.ownership_id.clone(),
                    at_ms: now_ms(),
                    detail: Some(reason.to_owned()),
                };
                self.push_event(&mut state, event);
                drained.push(entry);
            }
        }
        drained
    }

    fn record_audits(&self, audits: &[KillAudit], reason: &str) {
        let mut state = self.lock();
        for audit in audits {
            let event = RegistryEvent {
                kind: if audit.outcome == KillAuditOutcome::Failed {
                    RegistryEventKind::KillFailed
                } else {
                    RegistryEventKind::Killed
                },
                pid: audit.pid,
                ownership_id: audit.ownership_id.clone(),
                at_ms: audit.timestamp_ms,
                detail: Some(
                    audit
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("{reason} ({})", audit.signal)),
                ),
            };
            self.push_event(&mut state, event);
        }
    }

    /// Drain every entry selected by the request, then kill them all
    /// concurrently.
    ///
    /// Individual failures are reported in the audit, never returned.
    pub async fn terminate_all(&self, request: TerminateRequest) -> TerminationSummary {
        let TerminateRequest {
            reason,
            force,
            filter,
        } = request;
        let drained = self.drain(&filter, &reason);
        let tracked = drained.len();
        if tracked > 0 {
            debug!(tracked, force, reason = %reason, "terminating tracked subprocesses");
        }

        let kills = drained.iter().map(|entry| async move {
            let options = entry.kill_options(force);
            let result = kill_process_tree(entry.pid, options).await;
            KillAudit::from_result(entry, options.signal, &result)
        });
        let audits = join_all(kills).await;

        for audit in audits.iter().filter(|audit| audit.error.is_some()) {
            warn!(pid = audit.pid, error = ?audit.error, "tracked subprocess termination failed");
        }
        self.record_audits(&audits, &reason);
        TerminationSummary::from_audits(reason, tracked, audits)
    }

    /// Synchronous drain-and-kill for contexts without a runtime.
    ///
    /// Sends the signal and immediately escalates survivors.
    pub fn terminate_all_blocking(&self, request: &TerminateRequest) -> TerminationSummary {
        let drained = self.drain(&request.filter, &request.reason);
        let tracked = drained.len();
        let audits: Vec<KillAudit> = drained
            .iter()
            .map(|entry| {
                let options = entry.kill_options(request.force);
                let result = kill_process_tree_blocking(entry.pid, options);
                KillAudit::from_result(entry, options.signal, &result)
            })
            .collect();
        self.record_audits(&audits, &request.reason);
        TerminationSummary::from_audits(request.reason.clone(), tracked, audits)
    }
}

/// Idempotent removal handle returned by [`SubprocessRegistry::register`].
#[derive(Debug, Clone)]
pub struct Unregister {
    registry: SubprocessRegistry,
    id: EntryId,
}

impl Unregister {
    /// Remove the entry; `false` if it was already gone.
    pub fn unregister(&self) -> bool {
        self.registry
            .remove(self.id, RegistryEventKind::Unregistered, None)
    }

    /// Remove the entry after observing the child's exit.
    pub fn exited(&self, status: Option<ExitStatus>) -> bool {
        self.registry.remove(
            self.id,
            RegistryEventKind::Exited,
            status.map(|status| status.to_string()),
        )
    }

    /// Registry handle this entry belongs to.
    #[must_use]
    pub fn registry(&self) -> &SubprocessRegistry {
        &self.registry
    }
}

/// A tokio child whose registry entry follows its lifetime.
#[derive(Debug)]
pub struct TrackedChild {
    child: Child,
    unregister: Unregister,
}

impl TrackedChild {
    /// Process id, while the child has not been reaped.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Underlying child, for stdio access.
    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Wait for exit and drop the registry entry.
    ///
    /// # Errors
    ///
    /// Propagates the I/O error from waiting on the child.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await;
        self.unregister.exited(status.as_ref().ok().copied());
        status
    }

    /// Remove the registry entry while leaving the child running.
    pub fn unregister(&self) -> bool {
        self.unregister.unregister()
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        self.unregister.unregister();
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
