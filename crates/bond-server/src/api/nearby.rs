//! Nearby peers API endpoint.
//!
//! Lists peers heard on the radio within the liveness window that are not
//! yet bonded with, and have not requested a bond from, this device's owner.

use axum::extract::State;
use axum::Json;
use bond_core::NearbyPeer;
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::SharedState;

/// Nearby peers, strongest signal first.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(example = json!({
    "peers": [{
        "identity": "bob",
        "rssi": -58,
        "similarity_score": 0.82,
        "summary": "Bakes sourdough and climbs on weekends.",
        "icebreakers": ["Ask about their starter"],
        "last_seen_at": "2025-01-15T03:30:00Z"
    }],
    "count": 1
}))]
pub struct NearbyResponse {
    /// Peers currently in range.
    pub peers: Vec<NearbyPeer>,

    /// Number of peers.
    #[schema(example = 1)]
    pub count: usize,
}

/// List nearby peers.
#[utoipa::path(
    get,
    path = "/api/nearby",
    tag = "nearby",
    operation_id = "getNearby",
    summary = "List nearby, not yet bonded peers",
    description = "Returns peers detected within the liveness window, excluding \
        peers already bonded or with a pending incoming request.",
    responses(
        (status = 200, description = "Nearby peers", body = NearbyResponse)
    )
)]
pub async fn get_nearby(State(state): State<SharedState>) -> Json<NearbyResponse> {
    let peers = state.session().nearby();
    Json(NearbyResponse {
        count: peers.len(),
        peers,
    })
}
