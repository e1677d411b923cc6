//! Task-local ownership scope.
//!
//! Spawns that do not name an ownership id inherit the scope bound by the
//! nearest enclosing [`with_tracked_scope`]. A scope entered through
//! [`with_tracked_cancel_scope`] also carries a cancellation token that
//! spawns without their own token inherit.

use std::future::Future;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
struct TrackedScope {
    ownership_id: Option<String>,
    cancel: Option<CancellationToken>,
}

tokio::task_local! {
    static TRACKED_SCOPE: TrackedScope;
}

/// Run `future` with `scope` as the default ownership id of every spawn
/// inside it. A blank scope clears any inherited one.
pub async fn with_tracked_scope<F>(scope: impl Into<String>, future: F) -> F::Output
where
    F: Future,
{
    let cancel = current_cancel();
    enter(scope.into(), cancel, future).await
}

/// Like [`with_tracked_scope`], and spawns inside it that carry no token of
/// their own are cancelled by `cancel`.
pub async fn with_tracked_cancel_scope<F>(
    scope: impl Into<String>,
    cancel: CancellationToken,
    future: F,
) -> F::Output
where
    F: Future,
{
    enter(scope.into(), Some(cancel), future).await
}

async fn enter<F>(scope: String, cancel: Option<CancellationToken>, future: F) -> F::Output
where
    F: Future,
{
    let ownership_id = (!scope.trim().is_empty()).then_some(scope);
    TRACKED_SCOPE
        .scope(
            TrackedScope {
                ownership_id,
                cancel,
            },
            future,
        )
        .await
}

/// Scope bound to the current task, if any.
#[must_use]
pub fn current_scope() -> Option<String> {
    TRACKED_SCOPE
        .try_with(|scope| scope.ownership_id.clone())
        .ok()
        .flatten()
}

/// Cancellation token bound to the current task's scope, if any.
#[must_use]
pub fn current_cancel() -> Option<CancellationToken> {
    TRACKED_SCOPE
        .try_with(|scope| scope.cancel.clone())
        .ok()
        .flatten()
}

/// Explicit id wins; otherwise the inherited scope.
#[must_use]
pub fn resolve_ownership_id(explicit: Option<&str>) -> Option<String> {
    match explicit {
        Some(id) if !id.trim().is_empty() => Some(id.to_owned()),
        _ => current_scope(),
    }
}

/// Explicit token wins; otherwise the one bound to the scope.
#[must_use]
pub fn resolve_cancel(explicit: Option<&CancellationToken>) -> Option<CancellationToken> {
    explicit.cloned().or_else(current_cancel)
}
