//! The two credential flows the login form drives.

use shared::{domain::ProfileRole, protocol::RoleUpdate};
use tracing::{info, warn};

use crate::{
    api::ApiClient,
    controller::SessionController,
    error::{ApiClientError, AuthError},
    session::{Session, SignUpOutcome},
};

/// Signs in and waits until the controller's state carries the new session,
/// so a guard check right after this returns cannot see stale state.
pub async fn sign_in_and_refresh(
    controller: &SessionController,
    email: &str,
    password: &str,
) -> Result<Session, AuthError> {
    let issued = controller.sign_in(email, password).await?;
    match controller.force_refresh().await? {
        Some(current) => Ok(current),
        None => {
            warn!(user_id = %issued.user.id, "auth: provider lost the grant it just issued");
            Err(AuthError::UnexpectedResponse(
                "no session available after sign-in".to_string(),
            ))
        }
    }
}

#[derive(Debug)]
pub enum RoleAssignment {
    Assigned,
    Failed(ApiClientError),
}

#[derive(Debug)]
pub struct Registration {
    pub outcome: SignUpOutcome,
    pub role_assignment: RoleAssignment,
}

impl Registration {
    pub fn role_assigned(&self) -> bool {
        matches!(self.role_assignment, RoleAssignment::Assigned)
    }
}

/// Creates the account, then records its role with the API. A failed role
/// registration is reported on the result but does not fail the sign-up.
pub async fn register_account(
    controller: &SessionController,
    api: &ApiClient,
    email: &str,
    password: &str,
    role: ProfileRole,
) -> Result<Registration, AuthError> {
    if !role.is_self_assignable() {
        return Err(AuthError::InvalidRole(role));
    }

    let outcome = controller.sign_up(email, password, role).await?;
    let update = RoleUpdate {
        user_id: outcome.user.id,
        role: outcome.requested_role,
    };

    let role_assignment = match api.set_user_role(outcome.session.as_ref(), &update).await {
        Ok(_) => {
            info!(user_id = %update.user_id, role = %update.role, "auth: profile role recorded");
            RoleAssignment::Assigned
        }
        Err(err) => {
            warn!(
                user_id = %update.user_id,
                role = %update.role,
                error = %err,
                "auth: profile role registration failed; account still created"
            );
            RoleAssignment::Failed(err)
        }
    };

    Ok(Registration {
        outcome,
        role_assignment,
    })
}

#[cfg(test)]
#[path = "tests/flows_tests.rs"]
mod tests;
