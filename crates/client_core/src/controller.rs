use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};

use shared::domain::ProfileRole;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{info, warn};

use crate::{
    error::AuthError,
    provider::IdentityProvider,
    session::{AuthChange, AuthState, Session, SignUpOutcome},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// `loading` went false. Sent once per controller.
    Resolved { authenticated: bool },
    SessionChanged { authenticated: bool },
    /// Views should drop whatever they cached for the previous user.
    ViewReset,
}

/// Handle on the provider listener task.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Single writer of [`AuthState`]. The initial pull query and the provider's
/// push listener both write through here; last write wins.
pub struct SessionController {
    provider: Arc<dyn IdentityProvider>,
    state: watch::Sender<AuthState>,
    events: broadcast::Sender<ControllerEvent>,
    initialized: AtomicBool,
    /// Bumped by every `sign_out`. Provider reads that started under an older
    /// value are not written back.
    sign_outs: AtomicU64,
    listener: Mutex<Option<Subscription>>,
}

impl SessionController {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Arc<Self> {
        let (state, _) = watch::channel(AuthState::initial());
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            provider,
            state,
            events,
            initialized: AtomicBool::new(false),
            sign_outs: AtomicU64::new(0),
            listener: Mutex::new(None),
        })
    }

    /// Registers the provider listener, then establishes the initial state
    /// from the provider's persisted grant. `loading` is false on return,
    /// whatever the provider did.
    pub async fn initialize(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("auth: controller already initialized; ignoring");
            return;
        }

        let receiver = self.provider.subscribe();
        let task = tokio::spawn(run_listener(Arc::downgrade(self), receiver));
        *self.listener.lock().await = Some(Subscription::new(task));

        let generation = self.sign_outs.load(Ordering::SeqCst);
        match self.provider.get_current_session().await {
            Ok(session) => {
                info!(
                    authenticated = session.is_some(),
                    "auth: initial session query resolved"
                );
                self.write_session_since(session, true, Some(generation));
            }
            Err(err) => {
                warn!(error = %err, "auth: initial session query failed; continuing signed out");
                self.resolve_loading();
            }
        }
    }

    /// Exchanges credentials. State is left to the listener or a follow-up
    /// [`force_refresh`](Self::force_refresh).
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        match self.provider.sign_in_with_credentials(email, password).await {
            Ok(session) => {
                info!(user_id = %session.user.id, "auth: sign-in accepted");
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, "auth: sign-in rejected");
                Err(err)
            }
        }
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        profile_role: ProfileRole,
    ) -> Result<SignUpOutcome, AuthError> {
        let response = self
            .provider
            .sign_up_with_credentials(email, password)
            .await
            .inspect_err(|err| warn!(error = %err, "auth: sign-up rejected"))?;
        info!(
            user_id = %response.user.id,
            needs_verification = response.session.is_none(),
            "auth: sign-up accepted"
        );
        Ok(SignUpOutcome {
            user: response.user,
            session: response.session,
            requested_role: profile_role,
        })
    }

    /// Re-reads the provider and overwrites the session. `loading` is not
    /// touched. On failure the state is left as it was. A read overtaken by
    /// [`sign_out`](Self::sign_out) is dropped and the current session
    /// returned instead.
    pub async fn force_refresh(&self) -> Result<Option<Session>, AuthError> {
        let generation = self.sign_outs.load(Ordering::SeqCst);
        let session = self.provider.get_current_session().await?;
        if self.write_session_since(session.clone(), false, Some(generation)) {
            Ok(session)
        } else {
            info!("auth: discarding session read that started before sign-out");
            Ok(self.state().session().cloned())
        }
    }

    /// Always ends signed out, even if the provider call fails.
    pub async fn sign_out(&self) {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.provider.invalidate_session().await {
            warn!(error = %err, "auth: provider sign-out failed; clearing local session anyway");
        }
        self.write_session(None, true);
        let _ = self.events.send(ControllerEvent::ViewReset);
        info!("auth: signed out");
    }

    /// Stops applying provider events.
    pub async fn shutdown(&self) {
        if let Some(subscription) = self.listener.lock().await.take() {
            subscription.unsubscribe();
            info!("auth: provider listener unsubscribed");
        }
    }

    pub async fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn watch_stream(&self) -> WatchStream<AuthState> {
        WatchStream::new(self.state.subscribe())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state
            .borrow()
            .session
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    /// Waits until `loading` is false and returns that state.
    pub async fn wait_until_resolved(&self) -> AuthState {
        let mut receiver = self.state.subscribe();
        let resolved = match receiver.wait_for(|state| !state.loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        resolved
    }

    fn apply_provider_change(&self, change: AuthChange) {
        info!(
            event = ?change.event,
            authenticated = change.session.is_some(),
            "auth: provider session change"
        );
        let resolve = change.session.is_none();
        self.write_session(change.session, resolve);
    }

    fn write_session(&self, session: Option<Session>, resolve: bool) {
        self.write_session_since(session, resolve, None);
    }

    /// With `since`, the session is only written if no sign-out happened after
    /// that generation was read. `resolve` applies either way. Returns whether
    /// the session was accepted.
    fn write_session_since(
        &self,
        session: Option<Session>,
        resolve: bool,
        since: Option<u64>,
    ) -> bool {
        let mut authenticated = false;
        let mut session_changed = false;
        let mut resolved_now = false;
        let mut accepted = true;
        self.state.send_if_modified(|state| {
            // Checked under the watch lock, which `sign_out` also writes through.
            accepted = since.map_or(true, |generation| {
                generation == self.sign_outs.load(Ordering::SeqCst)
            });
            if accepted && state.session != session {
                state.session = session;
                session_changed = true;
            }
            if resolve && state.loading {
                state.loading = false;
                resolved_now = true;
            }
            authenticated = state.session.is_some();
            session_changed || resolved_now
        });

        if session_changed {
            let _ = self
                .events
                .send(ControllerEvent::SessionChanged { authenticated });
        }
        if resolved_now {
            let _ = self.events.send(ControllerEvent::Resolved { authenticated });
        }
        accepted
    }

    fn resolve_loading(&self) {
        let mut resolved_now = false;
        let mut authenticated = false;
        self.state.send_if_modified(|state| {
            authenticated = state.session.is_some();
            if state.loading {
                state.loading = false;
                resolved_now = true;
            }
            resolved_now
        });
        if resolved_now {
            let _ = self.events.send(ControllerEvent::Resolved { authenticated });
        }
    }
}

async fn run_listener(
    controller: Weak<SessionController>,
    mut receiver: broadcast::Receiver<AuthChange>,
) {
    loop {
        match receiver.recv().await {
            Ok(change) => {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.apply_provider_change(change);
            }
            Err(RecvError::Lagged(skipped)) => {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                warn!(skipped, "auth: provider events dropped; resynchronizing");
                if let Err(err) = controller.force_refresh().await {
                    warn!(error = %err, "auth: resynchronization failed");
                }
            }
            Err(RecvError::Closed) => {
                info!("auth: provider event stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
