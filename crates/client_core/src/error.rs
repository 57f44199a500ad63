use shared::domain::ProfileRole;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad password, unknown account, unconfirmed email and the like.
    #[error("{0}")]
    Credentials(String),
    #[error("identity provider unreachable: {0}")]
    Communication(String),
    #[error("identity provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("unexpected identity provider response: {0}")]
    UnexpectedResponse(String),
    #[error("session storage failed: {0:#}")]
    Storage(#[source] anyhow::Error),
    #[error("role '{0}' cannot be chosen at sign-up")]
    InvalidRole(ProfileRole),
}

impl AuthError {
    /// Text suitable for showing next to a login form.
    pub fn user_message(&self) -> String {
        match self {
            Self::Credentials(message) => message.clone(),
            Self::Communication(_) => {
                "Could not reach the sign-in service. Check your connection and try again."
                    .to_string()
            }
            Self::Provider { status, .. } if *status >= 500 => {
                "The sign-in service is having trouble. Try again shortly.".to_string()
            }
            Self::Provider { message, .. } => message.clone(),
            Self::UnexpectedResponse(_) | Self::Storage(_) => {
                "Sign-in failed unexpectedly. Try again.".to_string()
            }
            Self::InvalidRole(role) => format!("The '{role}' role cannot be chosen at sign-up."),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Communication(_) => true,
            Self::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::UnexpectedResponse(err.to_string())
        } else {
            Self::Communication(err.to_string())
        }
    }
}

impl From<url::ParseError> for AuthError {
    fn from(err: url::ParseError) -> Self {
        Self::UnexpectedResponse(format!("invalid provider url: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum ApiClientError {
    /// The API rejected the bearer token. Callers should prompt for sign-in.
    #[error("session rejected by the API; sign in again")]
    Unauthorized,
    #[error("operation forbidden: {0}")]
    Forbidden(String),
    #[error("API returned {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("API request failed: {0}")]
    Transport(reqwest::Error),
    #[error("could not decode API response: {0}")]
    Decode(String),
    #[error("invalid API url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for ApiClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err)
        }
    }
}
