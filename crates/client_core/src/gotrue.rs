use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use shared::error::ProviderErrorBody;
use storage::SessionStore;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use url::Url;

use crate::{
    error::AuthError,
    provider::IdentityProvider,
    session::{AuthChange, AuthChangeEvent, Session, SignUpResponse, User},
};

/// Grants this close to expiry are refreshed before being handed out.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct GoTrueConfig {
    pub project_url: String,
    pub anon_key: String,
    pub storage_key: String,
    pub refresh_margin: Duration,
}

impl GoTrueConfig {
    pub fn new(project_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            project_url: project_url.into(),
            anon_key: anon_key.into(),
            storage_key: storage::DEFAULT_SESSION_KEY.to_string(),
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    user: User,
}

impl TokenResponse {
    fn into_session(self) -> Result<Session, AuthError> {
        // Whole seconds, matching what the provider and the store keep.
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Some(at),
            (None, Some(secs)) => Some(Utc::now().timestamp().checked_add(secs).ok_or_else(
                || AuthError::UnexpectedResponse(format!("expires_in out of range: {secs}")),
            )?),
            (None, None) => None,
        };
        let expires_at = expires_at
            .map(|secs| {
                DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                    AuthError::UnexpectedResponse(format!("grant expiry out of range: {secs}"))
                })
            })
            .transpose()?;
        Ok(Session {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        })
    }
}

/// Supabase GoTrue over REST, with the current grant persisted in a
/// [`SessionStore`].
pub struct GoTrueProvider {
    http: Client,
    auth_url: Url,
    anon_key: String,
    store: Arc<dyn SessionStore>,
    storage_key: String,
    refresh_margin: Duration,
    events: broadcast::Sender<AuthChange>,
    // Refresh tokens are single-use, and a refresh finishing after sign-out
    // would persist the grant again. Refreshes and sign-out take this in turn.
    refresh_lock: Mutex<()>,
}

impl GoTrueProvider {
    pub fn new(config: GoTrueConfig, store: Arc<dyn SessionStore>) -> Result<Self, AuthError> {
        let mut base = Url::parse(config.project_url.trim())?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let auth_url = base.join("auth/v1/")?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            http: Client::new(),
            auth_url,
            anon_key: config.anon_key,
            store,
            storage_key: config.storage_key,
            refresh_margin: config.refresh_margin,
            events,
            refresh_lock: Mutex::new(()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        Ok(self.auth_url.join(path)?)
    }

    async fn post_token(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<Session, AuthError> {
        let mut url = self.endpoint("token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;
        let token: TokenResponse = response.json().await?;
        token.into_session()
    }

    async fn load_persisted(&self) -> Result<Option<Session>, AuthError> {
        let stored = self
            .store
            .load(&self.storage_key)
            .await
            .map_err(AuthError::Storage)?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        match serde_json::from_str::<Session>(&stored.payload) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(error = %err, "auth: discarding unreadable persisted session");
                self.clear_persisted().await?;
                Ok(None)
            }
        }
    }

    async fn persist(&self, session: &Session) -> Result<(), AuthError> {
        let payload = serde_json::to_string(session)
            .map_err(|err| AuthError::Storage(anyhow::Error::new(err)))?;
        self.store
            .save(&self.storage_key, &payload)
            .await
            .map_err(AuthError::Storage)
    }

    async fn clear_persisted(&self) -> Result<(), AuthError> {
        self.store
            .clear(&self.storage_key)
            .await
            .map(|_| ())
            .map_err(AuthError::Storage)
    }

    fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        let _ = self.events.send(AuthChange::new(event, session));
    }

    async fn refresh(&self, stale: Session) -> Result<Option<Session>, AuthError> {
        let Some(refresh_token) = stale.refresh_token.clone() else {
            info!(user_id = %stale.user.id, "auth: persisted session expired without refresh token");
            self.clear_persisted().await?;
            self.emit(AuthChangeEvent::SignedOut, None);
            return Ok(None);
        };

        match self
            .post_token("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(fresh) => {
                self.persist(&fresh).await?;
                info!(user_id = %fresh.user.id, "auth: session refreshed");
                self.emit(AuthChangeEvent::TokenRefreshed, Some(fresh.clone()));
                Ok(Some(fresh))
            }
            Err(err @ AuthError::Credentials(_)) => {
                warn!(error = %err, "auth: refresh rejected; signing out");
                self.clear_persisted().await?;
                self.emit(AuthChangeEvent::SignedOut, None);
                Ok(None)
            }
            Err(err) if !stale.is_expired() => {
                warn!(error = %err, "auth: refresh failed; using grant until it expires");
                Ok(Some(stale))
            }
            Err(err) => Err(err),
        }
    }

    async fn remote_logout(&self, session: &Session) -> Result<(), AuthError> {
        let response = self
            .http
            .post(self.endpoint("logout")?)
            .header("apikey", &self.anon_key)
            .header(reqwest::header::AUTHORIZATION, session.bearer_header())
            .send()
            .await?;
        // Already invalid on the provider side.
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            return Ok(());
        }
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl IdentityProvider for GoTrueProvider {
    async fn get_current_session(&self) -> Result<Option<Session>, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let Some(session) = self.load_persisted().await? else {
            return Ok(None);
        };
        if session.expires_within(self.refresh_margin) {
            return self.refresh(session).await;
        }
        Ok(Some(session))
    }

    async fn sign_in_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let session = self
            .post_token("password", json!({ "email": email, "password": password }))
            .await?;
        self.persist(&session).await?;
        info!(user_id = %session.user.id, "auth: password grant issued");
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SignUpResponse, AuthError> {
        let response = self
            .http
            .post(self.endpoint("signup")?)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let body: serde_json::Value = check_status(response).await?.json().await?;

        // Auto-confirmed projects answer with a full grant, others with the
        // bare user record.
        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)
                .map_err(|err| AuthError::UnexpectedResponse(err.to_string()))?;
            let session = token.into_session()?;
            self.persist(&session).await?;
            self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
            return Ok(SignUpResponse {
                user: session.user.clone(),
                session: Some(session),
            });
        }

        let user_value = if body.get("user").is_some() {
            body["user"].clone()
        } else {
            body
        };
        let user: User = serde_json::from_value(user_value)
            .map_err(|err| AuthError::UnexpectedResponse(err.to_string()))?;
        Ok(SignUpResponse {
            user,
            session: None,
        })
    }

    async fn invalidate_session(&self) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let persisted = match self.load_persisted().await {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(error = %err, "auth: could not read session before sign-out");
                None
            }
        };
        let remote = match &persisted {
            Some(session) => self.remote_logout(session).await,
            None => Ok(()),
        };
        let cleared = self.clear_persisted().await;
        self.emit(AuthChangeEvent::SignedOut, None);
        remote?;
        cleared
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }
}

async fn check_status(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ProviderErrorBody>(&text)
        .ok()
        .and_then(|body| body.message())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });

    Err(match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::UNPROCESSABLE_ENTITY => {
            AuthError::Credentials(message)
        }
        _ => AuthError::Provider {
            status: status.as_u16(),
            message,
        },
    })
}

#[cfg(test)]
#[path = "tests/gotrue_tests.rs"]
mod tests;
