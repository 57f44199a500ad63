use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    error::AuthError,
    session::{AuthChange, Session, SignUpResponse},
};

/// The identity provider of record, as seen by the session controller.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns the persisted grant, if any. May refresh it first.
    async fn get_current_session(&self) -> Result<Option<Session>, AuthError>;
    async fn sign_in_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError>;
    async fn sign_up_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SignUpResponse, AuthError>;
    /// Local state must be cleared even when the remote call fails.
    async fn invalidate_session(&self) -> Result<(), AuthError>;
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;
}
