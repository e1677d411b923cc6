//! Unit tests for the settle guard and task-local ownership scopes.

use index_warden::subprocess::runner::{SettleOnce, Settled};
use index_warden::subprocess::scope::{
    current_cancel, current_scope, resolve_cancel, resolve_ownership_id,
};
use index_warden::subprocess::{with_tracked_cancel_scope, with_tracked_scope};
use tokio_util::sync::CancellationToken;

#[test]
fn first_settlement_wins() {
    let settle = SettleOnce::new();
    assert_eq!(settle.state(), Settled::Pending);
    assert!(settle.reject());
    assert!(!settle.resolve());
    assert!(!settle.reject());
    assert_eq!(settle.state(), Settled::Rejected);
}

#[test]
fn resolve_is_sticky() {
    let settle = SettleOnce::new();
    assert!(settle.resolve());
    assert!(!settle.reject());
    assert_eq!(settle.state(), Settled::Resolved);
}

#[test]
fn no_scope_outside_a_task() {
    assert_eq!(current_scope(), None);
    assert_eq!(resolve_ownership_id(None), None);
    assert_eq!(resolve_ownership_id(Some("x")), Some("x".to_owned()));
    assert!(current_cancel().is_none());
    assert!(resolve_cancel(None).is_none());
}

#[tokio::test]
async fn scope_is_inherited_and_overridable() {
    with_tracked_scope("outer", async {
        assert_eq!(current_scope().as_deref(), Some("outer"));
        assert_eq!(resolve_ownership_id(None).as_deref(), Some("outer"));
        assert_eq!(resolve_ownership_id(Some("  ")).as_deref(), Some("outer"));
        assert_eq!(resolve_ownership_id(Some("explicit")).as_deref(), Some("explicit"));

        with_tracked_scope("inner", async {
            assert_eq!(current_scope().as_deref(), Some("inner"));
        })
        .await;

        with_tracked_scope("  ", async {
            assert_eq!(current_scope(), None);
        })
        .await;

        assert_eq!(current_scope().as_deref(), Some("outer"));
    })
    .await;
}

#[tokio::test]
async fn cancel_scope_is_inherited_by_nested_scopes() {
    let scoped = CancellationToken::new();
    with_tracked_cancel_scope("batch", scoped.clone(), async {
        assert_eq!(current_scope().as_deref(), Some("batch"));

        with_tracked_scope("batch:file", async {
            assert_eq!(current_scope().as_deref(), Some("batch:file"));
            let inherited = resolve_cancel(None).expect("scope token is inherited");
            scoped.cancel();
            assert!(inherited.is_cancelled());
        })
        .await;

        let own = CancellationToken::new();
        let resolved = resolve_cancel(Some(&own)).expect("explicit token");
        assert!(!resolved.is_cancelled(), "explicit token wins");
    })
    .await;
    assert!(current_cancel().is_none());
}
