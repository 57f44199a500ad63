use crate::{controller::SessionController, session::AuthState};

/// Entry view unauthenticated users are sent to.
pub const LOGIN_ROUTE: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Session truth is not established yet; show a neutral waiting state.
    Wait,
    Redirect(&'static str),
    Render,
}

pub fn decide(state: &AuthState) -> RouteDecision {
    if state.is_loading() {
        return RouteDecision::Wait;
    }
    match state.session() {
        Some(_) => RouteDecision::Render,
        None => RouteDecision::Redirect(LOGIN_ROUTE),
    }
}

/// Like [`decide`], but waits out the loading window first, so the result is
/// never [`RouteDecision::Wait`].
pub async fn resolve(controller: &SessionController) -> RouteDecision {
    decide(&controller.wait_until_resolved().await)
}
