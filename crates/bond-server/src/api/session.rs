//! Session API endpoints.

use axum::extract::State;
use axum::Json;
use bond_core::IdentityRecord;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Response after signing out.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(example = json!({"signed_out": true, "identity": "alice"}))]
pub struct SignOutResponse {
    /// Always true on success.
    #[schema(example = true)]
    pub signed_out: bool,

    /// Identity that was signed out.
    #[schema(example = "alice")]
    pub identity: String,
}

/// The owner's identity record.
#[utoipa::path(
    get,
    path = "/api/me",
    tag = "session",
    operation_id = "getMe",
    summary = "Get the signed-in identity record",
    description = "Returns the owner's stored record, including pending incoming \
        requests and current bonds.",
    responses(
        (status = 200, description = "Identity record", body = IdentityRecord),
        (status = 404, description = "Identity not registered", body = super::ErrorResponse)
    )
)]
pub async fn get_me(State(state): State<SharedState>) -> ApiResult<Json<IdentityRecord>> {
    let owner = state.session().owner();
    state
        .session()
        .me()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound {
            error_code: "unknown_identity".to_string(),
            message: format!("No identity record for '{owner}'"),
        })
}

/// Stop the radio and forget cached state.
#[utoipa::path(
    post,
    path = "/api/session/sign-out",
    tag = "session",
    operation_id = "signOut",
    summary = "Sign out",
    description = "Stops broadcasting and scanning, stops background tasks and \
        clears the nearby list and rate-limit cache. Stored relationships are kept.",
    responses(
        (status = 200, description = "Signed out", body = SignOutResponse),
        (status = 503, description = "Radio failed to stop", body = super::ErrorResponse)
    )
)]
pub async fn sign_out(State(state): State<SharedState>) -> ApiResult<Json<SignOutResponse>> {
    state.session().sign_out().await?;
    Ok(Json(SignOutResponse {
        signed_out: true,
        identity: state.session().owner().to_string(),
    }))
}
