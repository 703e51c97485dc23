//! # bond-core
//!
//! Core logic for bond: in-person discovery over Bluetooth Low Energy,
//! pairwise bonds between identities and time spent together.
//!
//! This crate provides:
//! - An identity beacon that advertises the owner and reports nearby peers
//! - A relationship store with race-tolerant pair creation and a four-state
//!   bonding lattice kept in sync with per-identity indices
//! - Rate-limited accumulation of minutes spent together by mutual bonds
//! - A detection coordinator maintaining a liveness-filtered nearby list
//!
//! ## Architecture
//!
//! - [`beacon`] - Advertised payload codec and advertise/scan lifecycle
//! - [`radio`] - Radio backends (BlueZ and an in-process mock)
//! - [`store`] - Document store abstraction, bonding lattice, relationships
//! - [`accumulator`] - Per-peer rate-limited time accumulation
//! - [`coordinator`] - Detection handling and liveness sweep
//! - [`similarity`] - Remote profile-similarity client
//! - [`session`] - Wires everything together for one signed-in device
//! - [`config`] - Configuration loading, saving, and validation
//! - [`clock`] - Wall-clock abstraction
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod accumulator;
pub mod beacon;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod radio;
pub mod session;
pub mod similarity;
pub mod store;
pub mod types;

// Re-export primary types for convenience
pub use accumulator::{AccumulateError, TickOutcome, TimeAccumulator};
pub use beacon::{
    BeaconError, BeaconRadio, BeaconResult, Detection, PayloadCodec, ProximityBeacon,
    RadioStatus, RawAdvertisement, BOND_SERVICE_UUID,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    default_config_path, default_data_dir, BeaconConfig, BondConfig, ConfigError, ConfigResult,
    IdentityConfig, ServerConfig, SimilarityConfig, StoreConfig, TimingConfig,
};
pub use coordinator::{DetectionCoordinator, NearbyPeer};
pub use error::{BondError, Result};
#[cfg(feature = "bluetooth")]
pub use radio::BluezRadio;
pub use radio::{MockAir, MockRadio};
pub use session::{BondSession, StartReport};
pub use similarity::{
    FallbackSimilarity, HttpSimilarityClient, Similarity, SimilarityError, SimilarityProvider,
};
pub use store::{
    BondState, DocumentStore, IndexField, IndexOp, LocalDocumentStore, RelationshipStore,
    StoreError, StoreResult,
};
pub use types::{
    BondedPeer, HealthResponse, Identity, IdentityError, IdentityRecord, PairKey, PairRecord,
    Side,
};
