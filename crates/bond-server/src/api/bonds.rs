//! Bond management API endpoints.
//!
//! A bond forms when both identities of a pair ask for it. Asking first
//! leaves a pending request in the peer's incoming list; the peer accepts by
//! asking back, or declines. Time together only accumulates for mutual
//! bonds.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use bond_core::{BondState, BondedPeer, Identity, PairRecord};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Default number of bonds returned.
pub const DEFAULT_BOND_LIMIT: usize = 50;

/// Creates the bonds router, mounted at `/api`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/bonds", get(list_bonds))
        .route("/bonds/{peer}", delete(unbond).post(request_bond))
        .route("/incoming", get(list_incoming))
        .route("/incoming/{peer}", delete(decline_bond))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for the bonds listing.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct BondsQuery {
    /// Maximum number of bonds to return.
    #[param(example = 10, minimum = 1)]
    pub limit: Option<usize>,
}

/// Bonded peers ordered by time together.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(example = json!({
    "bonds": [
        {"identity": "bob", "total_together_minutes": 42, "similarity_score": 0.82}
    ]
}))]
pub struct BondsResponse {
    /// Bonded peers, most time together first.
    pub bonds: Vec<BondedPeer>,
}

/// Pending requests awaiting this device owner's answer.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(example = json!({"incoming": ["carol"]}))]
pub struct IncomingResponse {
    /// Identities that asked to bond.
    pub incoming: Vec<Identity>,
}

/// Result of a bond transition.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(example = json!({
    "peer": "bob",
    "state": "mutual",
    "total_together_minutes": 0
}))]
pub struct BondActionResponse {
    /// The other identity of the pair.
    pub peer: Identity,

    /// Joint bond state after the transition.
    pub state: BondState,

    /// Minutes accumulated together so far.
    #[schema(example = 0)]
    pub total_together_minutes: u64,
}

impl BondActionResponse {
    fn new(peer: Identity, pair: &PairRecord) -> Self {
        Self {
            peer,
            state: BondState::of(pair),
            total_together_minutes: pair.total_together_minutes,
        }
    }
}

fn parse_peer(raw: &str) -> ApiResult<Identity> {
    Ok(Identity::parse(raw)?)
}

// ============================================================================
// Handlers
// ============================================================================

/// List bonded peers with time together.
#[utoipa::path(
    get,
    path = "/api/bonds",
    tag = "bonds",
    operation_id = "listBonds",
    summary = "List bonds by time together",
    description = "Returns mutually bonded peers with accumulated minutes, most \
        time together first.",
    params(BondsQuery),
    responses(
        (status = 200, description = "Bonds retrieved", body = BondsResponse),
        (status = 400, description = "Invalid limit", body = super::ErrorResponse)
    )
)]
pub async fn list_bonds(
    State(state): State<SharedState>,
    Query(query): Query<BondsQuery>,
) -> ApiResult<Json<BondsResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_BOND_LIMIT);
    if limit == 0 {
        return Err(ApiError::BadRequest {
            error_code: "invalid_limit".to_string(),
            message: "limit must be at least 1".to_string(),
        });
    }
    let bonds = state.session().bonds(limit).await?;
    Ok(Json(BondsResponse { bonds }))
}

/// Request a bond with a peer, or accept the peer's pending request.
#[utoipa::path(
    post,
    path = "/api/bonds/{peer}",
    tag = "bonds",
    operation_id = "requestBond",
    summary = "Request or accept a bond",
    description = "Sets this owner's bond flag for the pair. If the peer already \
        asked, the bond becomes mutual; otherwise the peer sees an incoming request.",
    params(("peer" = String, Path, description = "Peer identity", example = "bob")),
    responses(
        (status = 200, description = "Bond flag set", body = BondActionResponse),
        (status = 400, description = "Invalid identity or self bond", body = super::ErrorResponse),
        (status = 503, description = "Document store unavailable", body = super::ErrorResponse)
    )
)]
pub async fn request_bond(
    State(state): State<SharedState>,
    Path(peer): Path<String>,
) -> ApiResult<Json<BondActionResponse>> {
    let peer = parse_peer(&peer)?;
    let pair = state.session().request_bond(&peer).await?;
    Ok(Json(BondActionResponse::new(peer, &pair)))
}

/// Dissolve a bond.
#[utoipa::path(
    delete,
    path = "/api/bonds/{peer}",
    tag = "bonds",
    operation_id = "unbond",
    summary = "Dissolve a bond",
    description = "Clears both bond flags of the pair. Accumulated time is kept.",
    params(("peer" = String, Path, description = "Peer identity", example = "bob")),
    responses(
        (status = 200, description = "Bond dissolved", body = BondActionResponse),
        (status = 400, description = "Invalid identity", body = super::ErrorResponse),
        (status = 503, description = "Document store unavailable", body = super::ErrorResponse)
    )
)]
pub async fn unbond(
    State(state): State<SharedState>,
    Path(peer): Path<String>,
) -> ApiResult<Json<BondActionResponse>> {
    let peer = parse_peer(&peer)?;
    let pair = state.session().unbond(&peer).await?;
    Ok(Json(BondActionResponse::new(peer, &pair)))
}

/// List pending incoming requests.
#[utoipa::path(
    get,
    path = "/api/incoming",
    tag = "bonds",
    operation_id = "listIncoming",
    summary = "List pending bond requests",
    responses(
        (status = 200, description = "Incoming requests", body = IncomingResponse)
    )
)]
pub async fn list_incoming(
    State(state): State<SharedState>,
) -> ApiResult<Json<IncomingResponse>> {
    let incoming = state.session().incoming().await?;
    Ok(Json(IncomingResponse { incoming }))
}

/// Decline a pending request.
#[utoipa::path(
    delete,
    path = "/api/incoming/{peer}",
    tag = "bonds",
    operation_id = "declineBond",
    summary = "Decline a bond request",
    description = "Clears the requesting peer's bond flag so the request disappears.",
    params(("peer" = String, Path, description = "Requesting identity", example = "carol")),
    responses(
        (status = 200, description = "Request declined", body = BondActionResponse),
        (status = 400, description = "Invalid identity", body = super::ErrorResponse)
    )
)]
pub async fn decline_bond(
    State(state): State<SharedState>,
    Path(peer): Path<String>,
) -> ApiResult<Json<BondActionResponse>> {
    let peer = parse_peer(&peer)?;
    let pair = state.session().decline_bond(&peer).await?;
    Ok(Json(BondActionResponse::new(peer, &pair)))
}
