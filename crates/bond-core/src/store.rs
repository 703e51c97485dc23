//! Pair and identity persistence.
//!
//! - [`DocumentStore`] models the remote document store: single-document
//!   reads and atomic single-document updates, nothing more.
//! - [`LocalDocumentStore`] implements it in-process with optional JSON
//!   snapshot persistence.
//! - [`lattice`] is the pure bonding-state to index-membership mapping.
//! - [`RelationshipStore`] layers race-safe find-or-create and the bonding
//!   transitions on top.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Identity, IdentityRecord, PairKey, PairRecord, Side};

pub mod lattice;
pub mod local;
pub mod relationships;
#[cfg(test)]
pub(crate) mod testing;

pub use lattice::{BondState, IndexOp};
pub use local::LocalDocumentStore;
pub use relationships::RelationshipStore;

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A pair was requested between an identity and itself.
    #[error("Cannot form a pair of '{0}' with itself")]
    SelfPair(Identity),

    /// No `users` document exists for the identity.
    #[error("No identity record for '{0}'")]
    UnknownIdentity(Identity),

    /// A `pairs` document id did not resolve.
    #[error("No pair document with id '{0}'")]
    UnknownPair(String),

    /// An identity is not part of the pair it was used with.
    #[error("'{identity}' is not a member of pair {pair}")]
    NotAMember {
        /// The outsider.
        identity: Identity,
        /// The pair.
        pair: PairKey,
    },

    /// The store could not be reached or rejected the operation.
    #[error("Document store unavailable: {0}")]
    Unavailable(String),

    /// The local snapshot could not be read or written.
    #[error("Failed to persist store at {path}: {source}")]
    Persistence {
        /// Snapshot path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The local snapshot is corrupt.
    #[error("Failed to decode store snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    /// `true` for failures that may succeed on the next natural retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Persistence { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The two set-valued fields of an identity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexField {
    /// Pending requests awaiting this identity's reciprocation.
    Incoming,
    /// Live mutual bonds.
    Bonded,
}

impl fmt::Display for IndexField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Incoming => "incoming",
            Self::Bonded => "bonded",
        })
    }
}

/// The remote document store.
///
/// Every method is a single round trip and touches a single document. No
/// method offers cross-document atomicity.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Query `pairs` for an exact `(ID1, ID2)` match.
    async fn query_pair(&self, key: &PairKey) -> StoreResult<Option<PairRecord>>;

    /// Insert a new `pairs` document with both flags false and no time.
    async fn create_pair(&self, key: &PairKey, similarity_score: f64) -> StoreResult<PairRecord>;

    /// Set one side's bond flag and return the updated document.
    async fn set_pair_flag(&self, pair_id: &str, side: Side, value: bool)
        -> StoreResult<PairRecord>;

    /// Atomically add one minute and stamp `lastSeen`.
    async fn increment_together_minutes(
        &self,
        pair_id: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<PairRecord>;

    /// Query `users` by username.
    async fn get_user(&self, identity: &Identity) -> StoreResult<Option<IdentityRecord>>;

    /// Insert a new `users` document with empty sets.
    async fn create_user(&self, identity: &Identity, email: &str) -> StoreResult<IdentityRecord>;

    /// Ensure `member` is present in `field` of `target` (array union).
    async fn array_union(
        &self,
        target: &Identity,
        field: IndexField,
        member: &Identity,
    ) -> StoreResult<()>;

    /// Ensure `member` is absent from `field` of `target` (array remove).
    async fn array_remove(
        &self,
        target: &Identity,
        field: IndexField,
        member: &Identity,
    ) -> StoreResult<()>;
}
