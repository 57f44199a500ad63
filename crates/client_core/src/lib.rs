pub mod api;
pub mod controller;
pub mod error;
pub mod flows;
pub mod gotrue;
pub mod guard;
pub mod provider;
pub mod session;

pub use api::{ApiClient, FileUpload};
pub use controller::{ControllerEvent, SessionController, Subscription};
pub use error::{ApiClientError, AuthError};
pub use gotrue::{GoTrueConfig, GoTrueProvider};
pub use guard::RouteDecision;
pub use provider::IdentityProvider;
pub use session::{AuthState, AuthStatus, Session, User};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
