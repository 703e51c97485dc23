//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `health` - Service health checks
//! - `nearby` - Peers currently in range
//! - `bonds` - Bond requests, bonds and time together
//! - `session` - Signed-in identity and sign out
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod bonds;
pub mod error;
pub mod health;
pub mod nearby;
pub mod openapi;
pub mod session;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                    - Health check
/// /api
/// ├── /nearby                - Nearby, not yet bonded peers
/// ├── /bonds                 - Bonds by time together
/// ├── /bonds/{peer}          - Request/accept (POST), dissolve (DELETE)
/// ├── /incoming              - Pending requests
/// ├── /incoming/{peer}       - Decline (DELETE)
/// ├── /me                    - Identity record
/// ├── /session/sign-out      - Sign out
/// ├── /openapi.json          - OpenAPI specification
/// └── /docs                  - Swagger UI
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/nearby", get(nearby::get_nearby))
                .route("/me", get(session::get_me))
                .route("/session/sign-out", post(session::sign_out))
                .merge(bonds::router()),
        )
        .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", openapi::ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
