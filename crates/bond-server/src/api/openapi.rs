//! OpenAPI specification generation for the bond API.
//!
//! The document is served by Swagger UI at `/api/openapi.json` and written to
//! disk by the `gen-openapi` binary for client generation.

use bond_core::{BondState, BondedPeer, Identity, IdentityRecord, NearbyPeer};
use utoipa::OpenApi;

use super::bonds::{BondActionResponse, BondsResponse, IncomingResponse};
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::nearby::NearbyResponse;
use super::session::SignOutResponse;

/// Returns the OpenAPI specification as a string (for writing to file).
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for bond.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "bond API",
        version = "0.1.0",
        description = r#"
# bond API

bond finds people around you over Bluetooth and keeps track of the time you
spend together once you have both agreed to bond.

## Overview

Each device runs this API for its signed-in identity:

1. **Nearby**: Peers heard in the last few seconds that you have not bonded with
2. **Bonds**: Ask to bond, accept or decline requests, dissolve bonds
3. **Time together**: Minutes accumulate once per minute while a bonded peer is nearby

## Bond states

A pair of identities is `unbonded`, `low_requested`, `high_requested` or
`mutual`. Requests appear in the other identity's incoming list until they
are accepted or declined.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local bond device")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "nearby", description = "Peers currently in radio range"),
        (name = "bonds", description = "Bond requests, bonds and time together"),
        (name = "session", description = "Signed-in identity and sign out")
    ),
    paths(
        super::health::health_check,
        super::nearby::get_nearby,
        super::bonds::list_bonds,
        super::bonds::request_bond,
        super::bonds::unbond,
        super::bonds::list_incoming,
        super::bonds::decline_bond,
        super::session::get_me,
        super::session::sign_out,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            Identity,
            IdentityRecord,
            NearbyPeer,
            NearbyResponse,
            BondedPeer,
            BondState,
            BondsResponse,
            IncomingResponse,
            BondActionResponse,
            SignOutResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "bond API");
        assert!(spec.paths.paths.contains_key("/api/bonds/{peer}"));
        assert!(spec.paths.paths.contains_key("/api/nearby"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"bond API\""));
        assert!(json.contains("NearbyPeer"));
    }
}
