//! Session collaborator interface.
//!
//! Authentication itself is owned by an external session layer; the gateway
//! forwards the authenticated identity as an `x-user-id` header. This
//! middleware validates presence, loads the user row, and hands it to
//! handlers through request extensions. No header, or an unknown user,
//! means 401.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::api::{error::ApiError, AppState};
use crate::models::User;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated user, available via `Extension` after [`session_auth`].
#[derive(Debug, Clone)]
pub struct AuthedUser(pub User);

pub async fn session_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or(ApiError::Unauthorized)?;

    let user = state
        .store
        .get_user(&user_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::Unauthorized)?;

    req.extensions_mut().insert(AuthedUser(user));
    Ok(next.run(req).await)
}
