use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{ProfileRole, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
}

/// A provider-issued grant. Tokens are kept out of `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::zero())
    }

    /// Grants without an expiry never count as expiring.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now() + margin)
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Loading,
    Authenticated,
    Unauthenticated,
}

/// Observable authentication truth. `user` is derived from `session`, so the
/// two can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub(crate) session: Option<Session>,
    pub(crate) loading: bool,
}

impl AuthState {
    pub(crate) fn initial() -> Self {
        Self {
            session: None,
            loading: true,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(|session| &session.user)
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn status(&self) -> AuthStatus {
        match (self.loading, &self.session) {
            (_, Some(_)) => AuthStatus::Authenticated,
            (true, None) => AuthStatus::Loading,
            (false, None) => AuthStatus::Unauthenticated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChangeEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// Push notification from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChange {
    pub event: AuthChangeEvent,
    pub session: Option<Session>,
}

impl AuthChange {
    pub fn new(event: AuthChangeEvent, session: Option<Session>) -> Self {
        Self { event, session }
    }

    pub fn signed_out() -> Self {
        Self::new(AuthChangeEvent::SignedOut, None)
    }
}

/// Provider-level sign-up result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpResponse {
    pub user: User,
    pub session: Option<Session>,
}

/// Sign-up result handed back to callers. The role is carried through for
/// downstream profile registration and is not interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpOutcome {
    pub user: User,
    pub session: Option<Session>,
    pub requested_role: ProfileRole,
}

impl SignUpOutcome {
    pub fn needs_verification(&self) -> bool {
        self.session.is_none()
    }
}
