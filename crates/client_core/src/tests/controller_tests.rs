use std::{sync::Arc, time::Duration};

use super::*;
use crate::{
    guard::{decide, RouteDecision},
    session::{AuthChangeEvent, AuthStatus, SignUpResponse},
    test_support::{session_for, user, ScriptedProvider},
};

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn drain(events: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn resolved_count(events: &[ControllerEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ControllerEvent::Resolved { .. }))
        .count()
}

/// Records every state the watch channel exposes until the handle is aborted.
fn record_states(
    controller: &SessionController,
) -> (Arc<std::sync::Mutex<Vec<AuthState>>>, JoinHandle<()>) {
    let seen = Arc::new(std::sync::Mutex::new(vec![controller.state()]));
    let mut receiver = controller.subscribe();
    let sink = Arc::clone(&seen);
    let task = tokio::spawn(async move {
        while receiver.changed().await.is_ok() {
            let state = receiver.borrow_and_update().clone();
            sink.lock().expect("recorder lock").push(state);
        }
    });
    (seen, task)
}

#[tokio::test]
async fn starts_loading_before_initialize() {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::new(provider);

    let state = controller.state();
    assert!(state.is_loading());
    assert!(state.session().is_none());
    assert_eq!(state.status(), AuthStatus::Loading);
    assert_eq!(decide(&state), RouteDecision::Wait);
}

#[tokio::test]
async fn initialize_recovers_persisted_session() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_current(Some(session_for(1))).await;
    let controller = SessionController::new(provider.clone());
    let mut events = controller.subscribe_events();

    controller.initialize().await;

    let state = controller.state();
    assert!(!state.is_loading());
    assert_eq!(state.session(), Some(&session_for(1)));
    assert_eq!(state.user(), Some(&user(1)));
    assert_eq!(state.status(), AuthStatus::Authenticated);
    assert_eq!(provider.subscribe_calls(), 1);
    assert_eq!(resolved_count(&drain(&mut events)), 1);
}

#[tokio::test]
async fn initialize_without_persisted_session_resolves_signed_out() {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::new(provider);
    let mut events = controller.subscribe_events();

    controller.initialize().await;

    let state = controller.state();
    assert!(!state.is_loading());
    assert!(state.session().is_none());
    assert!(state.user().is_none());
    assert_eq!(
        drain(&mut events),
        vec![ControllerEvent::Resolved {
            authenticated: false
        }]
    );
}

#[tokio::test]
async fn listener_sign_out_before_initial_query_resolves_loading_once() {
    let provider = Arc::new(ScriptedProvider::new().gated());
    provider.set_current(Some(session_for(2))).await;
    let controller = SessionController::new(provider.clone());
    let mut events = controller.subscribe_events();

    let init = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.initialize().await }
    });
    eventually(|| provider.listener_count() == 1).await;

    provider.emit(AuthChange::signed_out());
    let resolved = tokio::time::timeout(Duration::from_secs(2), controller.wait_until_resolved())
        .await
        .expect("listener resolves loading");
    assert!(resolved.session().is_none());

    provider.release_query();
    init.await.expect("initialize task");

    let state = controller.state();
    assert!(!state.is_loading());
    assert_eq!(state.session(), Some(&session_for(2)));
    assert_eq!(resolved_count(&drain(&mut events)), 1);
}

#[tokio::test]
async fn listener_session_before_initial_query_keeps_loading_until_query() {
    let provider = Arc::new(ScriptedProvider::new().gated());
    provider.set_current(Some(session_for(3))).await;
    let controller = SessionController::new(provider.clone());
    let mut events = controller.subscribe_events();

    let init = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.initialize().await }
    });
    eventually(|| provider.listener_count() == 1).await;

    provider.emit(AuthChange::new(
        AuthChangeEvent::InitialSession,
        Some(session_for(3)),
    ));
    eventually(|| controller.state().session().is_some()).await;
    assert!(controller.state().is_loading());
    assert_eq!(controller.state().status(), AuthStatus::Authenticated);

    provider.release_query();
    init.await.expect("initialize task");

    assert!(!controller.state().is_loading());
    assert_eq!(resolved_count(&drain(&mut events)), 1);
}

#[tokio::test]
async fn initial_query_failure_still_resolves_loading() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.fail_current(true);
    let controller = SessionController::new(provider);

    controller.initialize().await;

    let state = controller.state();
    assert!(!state.is_loading());
    assert!(state.session().is_none());
    assert_eq!(state.status(), AuthStatus::Unauthenticated);
    assert_eq!(decide(&state), RouteDecision::Redirect(crate::guard::LOGIN_ROUTE));
}

#[tokio::test]
async fn initial_query_failure_keeps_session_delivered_by_listener() {
    let provider = Arc::new(ScriptedProvider::new().gated());
    provider.fail_current(true);
    let controller = SessionController::new(provider.clone());

    let init = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.initialize().await }
    });
    eventually(|| provider.listener_count() == 1).await;
    provider.emit(AuthChange::new(
        AuthChangeEvent::SignedIn,
        Some(session_for(4)),
    ));
    eventually(|| controller.state().session().is_some()).await;

    provider.release_query();
    init.await.expect("initialize task");

    let state = controller.state();
    assert!(!state.is_loading());
    assert_eq!(state.session(), Some(&session_for(4)));
}

#[tokio::test]
async fn loading_never_returns_to_true_and_user_tracks_session() {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::new(provider.clone());
    let (seen, recorder) = record_states(&controller);

    controller.initialize().await;
    provider.set_sign_in_result(Ok(session_for(5))).await;
    controller
        .sign_in("user5@example.com", "pw")
        .await
        .expect("sign in");
    eventually(|| controller.state().session().is_some()).await;
    controller.sign_out().await;
    provider.emit(AuthChange::new(
        AuthChangeEvent::TokenRefreshed,
        Some(session_for(6)),
    ));
    eventually(|| controller.state().session() == Some(&session_for(6))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    recorder.abort();

    let seen = seen.lock().expect("recorder lock").clone();
    assert!(seen.len() >= 2);
    let mut resolved = false;
    for state in &seen {
        assert_eq!(state.session().is_some(), state.user().is_some());
        if resolved {
            assert!(!state.is_loading(), "loading re-entered: {state:?}");
        }
        resolved |= !state.is_loading();
    }
}

#[tokio::test]
async fn sign_in_does_not_touch_state_until_refreshed() {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;

    provider.defer_sign_in_visibility();
    provider.set_sign_in_result(Ok(session_for(7))).await;
    let session = controller
        .sign_in("user7@example.com", "pw")
        .await
        .expect("sign in");
    assert_eq!(session.user, user(7));
    assert!(controller.state().session().is_none());

    provider.set_current(Some(session_for(7))).await;
    let refreshed = controller.force_refresh().await.expect("refresh");
    assert_eq!(refreshed, Some(session_for(7)));

    let state = controller.state();
    assert_eq!(state.session(), Some(&session_for(7)));
    assert_eq!(decide(&state), RouteDecision::Render);
}

#[tokio::test]
async fn refresh_after_sign_in_beats_the_listener() {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;

    provider.set_sign_in_result(Ok(session_for(8))).await;
    controller
        .sign_in("user8@example.com", "pw")
        .await
        .expect("sign in");
    controller.force_refresh().await.expect("refresh");

    // No yield between refresh and the guard check.
    assert_eq!(decide(&controller.state()), RouteDecision::Render);
    assert_eq!(controller.access_token().as_deref(), Some("access-8"));
}

#[tokio::test]
async fn sign_in_failure_is_returned_without_state_change() {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;
    let before = controller.state();

    let err = controller
        .sign_in("nobody@example.com", "wrong")
        .await
        .expect_err("credentials rejected");
    assert!(matches!(err, AuthError::Credentials(_)));
    assert_eq!(err.user_message(), "Invalid login credentials");
    assert_eq!(controller.state(), before);
}

#[tokio::test]
async fn sign_out_clears_state_even_when_provider_fails() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_current(Some(session_for(9))).await;
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;
    let mut events = controller.subscribe_events();

    provider.fail_invalidate(true);
    controller.sign_out().await;

    let state = controller.state();
    assert!(state.session().is_none());
    assert!(state.user().is_none());
    assert!(!state.is_loading());
    assert_eq!(provider.invalidate_calls(), 1);
    assert!(drain(&mut events).contains(&ControllerEvent::ViewReset));
}

#[tokio::test]
async fn sign_out_wins_over_refresh_already_in_flight() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_current(Some(session_for(20))).await;
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;

    provider.hold_next_query();
    let refresh = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.force_refresh().await }
    });
    eventually(|| !provider.hold_pending()).await;

    controller.sign_out().await;
    provider.release_held_query();
    let refreshed = refresh
        .await
        .expect("refresh task")
        .expect("refresh result");

    assert!(refreshed.is_none());
    let state = controller.state();
    assert!(state.session().is_none());
    assert!(!state.is_loading());
    assert_eq!(decide(&state), RouteDecision::Redirect(crate::guard::LOGIN_ROUTE));
}

#[tokio::test]
async fn sign_out_during_initial_query_drops_its_session() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_current(Some(session_for(21))).await;
    provider.hold_next_query();
    let controller = SessionController::new(provider.clone());
    let mut events = controller.subscribe_events();

    let init = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.initialize().await }
    });
    eventually(|| !provider.hold_pending()).await;

    controller.sign_out().await;
    provider.release_held_query();
    init.await.expect("initialize task");

    let state = controller.state();
    assert!(state.session().is_none());
    assert!(!state.is_loading());
    assert_eq!(resolved_count(&drain(&mut events)), 1);
}

#[tokio::test]
async fn refresh_event_queued_before_sign_out_does_not_restore_session() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_current(Some(session_for(22))).await;
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;

    provider.emit(AuthChange::new(
        AuthChangeEvent::TokenRefreshed,
        Some(session_for(23)),
    ));
    controller.sign_out().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(controller.state().session().is_none());
    assert!(!controller.state().is_loading());
}

#[tokio::test]
async fn force_refresh_failure_leaves_state_untouched() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.set_current(Some(session_for(10))).await;
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;

    provider.fail_current(true);
    let err = controller.force_refresh().await.expect_err("offline");
    assert!(err.is_retryable());
    assert_eq!(controller.state().session(), Some(&session_for(10)));
}

#[tokio::test]
async fn second_initialize_is_ignored() {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::new(provider.clone());

    controller.initialize().await;
    controller.initialize().await;

    assert_eq!(provider.subscribe_calls(), 1);
    assert_eq!(provider.current_calls(), 1);
}

#[tokio::test]
async fn shutdown_stops_applying_provider_events() {
    let provider = Arc::new(ScriptedProvider::new());
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;
    assert!(controller.is_listening().await);

    controller.shutdown().await;
    eventually(|| provider.listener_count() == 0).await;
    assert!(!controller.is_listening().await);

    provider.emit(AuthChange::new(
        AuthChangeEvent::SignedIn,
        Some(session_for(11)),
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(controller.state().session().is_none());
}

#[tokio::test]
async fn lagged_listener_resynchronizes_with_provider() {
    let provider = Arc::new(ScriptedProvider::with_capacity(1));
    let controller = SessionController::new(provider.clone());
    controller.initialize().await;
    assert_eq!(provider.current_calls(), 1);

    provider.set_current(Some(session_for(12))).await;
    for n in [13, 14, 15] {
        provider.emit(AuthChange::new(
            AuthChangeEvent::TokenRefreshed,
            Some(session_for(n)),
        ));
    }

    eventually(|| provider.current_calls() >= 2).await;
    eventually(|| controller.state().session() == Some(&session_for(15))).await;
}

#[tokio::test]
async fn sign_up_carries_requested_role_through() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .set_sign_up_result(Ok(SignUpResponse {
            user: user(16),
            session: None,
        }))
        .await;
    let controller = SessionController::new(provider);
    controller.initialize().await;

    let outcome = controller
        .sign_up("user16@example.com", "pw", ProfileRole::Auditor)
        .await
        .expect("sign up");

    assert_eq!(outcome.user, user(16));
    assert_eq!(outcome.requested_role, ProfileRole::Auditor);
    assert!(outcome.needs_verification());
    assert!(controller.state().session().is_none());
}

#[tokio::test]
async fn watch_stream_yields_current_state_first() {
    use futures::StreamExt;

    let provider = Arc::new(ScriptedProvider::new());
    provider.set_current(Some(session_for(17))).await;
    let controller = SessionController::new(provider);
    controller.initialize().await;

    let mut stream = controller.watch_stream();
    let first = stream.next().await.expect("current state");
    assert_eq!(first.session(), Some(&session_for(17)));
}
