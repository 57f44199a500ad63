use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::UserId;
use tokio::sync::{broadcast, Mutex, Notify};

use crate::{
    error::AuthError,
    provider::IdentityProvider,
    session::{AuthChange, AuthChangeEvent, Session, SignUpResponse, User},
};

pub(crate) fn user(n: u128) -> User {
    User {
        id: UserId(uuid::Uuid::from_u128(n)),
        email: Some(format!("user{n}@example.com")),
    }
}

pub(crate) fn session_for(n: u128) -> Session {
    Session {
        access_token: format!("access-{n}"),
        token_type: "bearer".to_string(),
        refresh_token: Some(format!("refresh-{n}")),
        expires_at: DateTime::<Utc>::from_timestamp(4_102_444_800, 0),
        user: user(n),
    }
}

/// In-memory provider whose answers and timing are set by the test.
pub(crate) struct ScriptedProvider {
    events: broadcast::Sender<AuthChange>,
    current: Mutex<Option<Session>>,
    sign_in_result: Mutex<Option<Result<Session, AuthError>>>,
    sign_up_result: Mutex<Option<Result<SignUpResponse, AuthError>>>,
    fail_current: AtomicBool,
    fail_invalidate: AtomicBool,
    /// When false, a successful sign-in is not yet visible to
    /// `get_current_session` and no event is emitted.
    sign_in_updates_store: AtomicBool,
    query_gate: Option<Arc<Notify>>,
    /// When set, the next query reads its answer, then waits for
    /// [`release_held_query`] before returning it.
    hold_next_query: AtomicBool,
    held_query: Notify,
    current_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    invalidate_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self::with_capacity(16)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            events,
            current: Mutex::new(None),
            sign_in_result: Mutex::new(None),
            sign_up_result: Mutex::new(None),
            fail_current: AtomicBool::new(false),
            fail_invalidate: AtomicBool::new(false),
            sign_in_updates_store: AtomicBool::new(true),
            query_gate: None,
            hold_next_query: AtomicBool::new(false),
            held_query: Notify::new(),
            current_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            invalidate_calls: AtomicUsize::new(0),
        }
    }

    /// The first `get_current_session` call blocks until [`release_query`].
    pub(crate) fn gated(mut self) -> Self {
        self.query_gate = Some(Arc::new(Notify::new()));
        self
    }

    pub(crate) fn release_query(&self) {
        if let Some(gate) = &self.query_gate {
            gate.notify_one();
        }
    }

    pub(crate) fn hold_next_query(&self) {
        self.hold_next_query.store(true, Ordering::SeqCst);
    }

    /// True until an armed query has read its answer.
    pub(crate) fn hold_pending(&self) -> bool {
        self.hold_next_query.load(Ordering::SeqCst)
    }

    pub(crate) fn release_held_query(&self) {
        self.held_query.notify_one();
    }

    pub(crate) async fn set_current(&self, session: Option<Session>) {
        *self.current.lock().await = session;
    }

    pub(crate) async fn set_sign_in_result(&self, result: Result<Session, AuthError>) {
        *self.sign_in_result.lock().await = Some(result);
    }

    pub(crate) async fn set_sign_up_result(&self, result: Result<SignUpResponse, AuthError>) {
        *self.sign_up_result.lock().await = Some(result);
    }

    pub(crate) fn fail_current(&self, fail: bool) {
        self.fail_current.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_invalidate(&self, fail: bool) {
        self.fail_invalidate.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn defer_sign_in_visibility(&self) {
        self.sign_in_updates_store.store(false, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, change: AuthChange) {
        let _ = self.events.send(change);
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub(crate) fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn invalidate_calls(&self) -> usize {
        self.invalidate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn get_current_session(&self) -> Result<Option<Session>, AuthError> {
        let call = self.current_calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            if let Some(gate) = &self.query_gate {
                gate.notified().await;
            }
        }
        if self.fail_current.load(Ordering::SeqCst) {
            return Err(AuthError::Communication("provider offline".into()));
        }
        let answer = self.current.lock().await.clone();
        if self.hold_next_query.swap(false, Ordering::SeqCst) {
            self.held_query.notified().await;
        }
        Ok(answer)
    }

    async fn sign_in_with_credentials(
        &self,
        _email: &str,
        _password: &str,
    ) -> Result<Session, AuthError> {
        let result = self
            .sign_in_result
            .lock()
            .await
            .take()
            .unwrap_or_else(|| Err(AuthError::Credentials("Invalid login credentials".into())));
        if let Ok(session) = &result {
            if self.sign_in_updates_store.load(Ordering::SeqCst) {
                *self.current.lock().await = Some(session.clone());
                self.emit(AuthChange::new(
                    AuthChangeEvent::SignedIn,
                    Some(session.clone()),
                ));
            }
        }
        result
    }

    async fn sign_up_with_credentials(
        &self,
        _email: &str,
        _password: &str,
    ) -> Result<SignUpResponse, AuthError> {
        self.sign_up_result
            .lock()
            .await
            .take()
            .unwrap_or_else(|| Err(AuthError::Credentials("User already registered".into())))
    }

    async fn invalidate_session(&self) -> Result<(), AuthError> {
        self.invalidate_calls.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().await = None;
        self.emit(AuthChange::signed_out());
        if self.fail_invalidate.load(Ordering::SeqCst) {
            return Err(AuthError::Communication("logout timed out".into()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.events.subscribe()
    }
}
