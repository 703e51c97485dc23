//! Pair relationships and bonding transitions for one device owner.
//!
//! # Pair creation
//!
//! [`RelationshipStore::find_or_create_pair`] looks the pair up, looks it up a
//! second time, and only then creates it. The second lookup catches a record
//! another device created in between. Within this process, calls for the
//! same pair are serialized through a per-key async mutex: a concurrent caller
//! waits for the one in flight and then repeats the lookup, which finds the
//! freshly created record. The mutex is local to the process and gives no
//! exclusion across devices; a true cross-device race can still leave a
//! duplicate document, which lookups tolerate by returning the oldest.
//!
//! # Bonding transitions
//!
//! A transition first commits one flag on the pair record, then reconciles
//! both identities' `incoming`/`bonded` sets from the committed flags using
//! [`lattice::plan`]. If the process dies between the two steps,
//! [`RelationshipStore::reconcile_pair`] (or the next transition) rebuilds the
//! sets from the flags alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use super::lattice::{self, BondState, IndexOp};
use super::{DocumentStore, IndexField, StoreError, StoreResult};
use crate::types::{BondedPeer, Identity, IdentityRecord, PairKey, PairRecord, Side};

type InFlightRegistry = Arc<StdMutex<HashMap<PairKey, Arc<Mutex<()>>>>>;

/// Held while a find-or-create for one pair key is in flight.
struct InFlight {
    key: PairKey,
    registry: InFlightRegistry,
    _slot: OwnedMutexGuard<()>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the registry and this guard reference the slot: nobody waits.
        if registry
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) <= 2)
        {
            registry.remove(&self.key);
        }
    }
}

/// Whose flag a transition writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Writer {
    Owner,
    Peer,
}

/// Relationship persistence and transitions on behalf of `owner`.
pub struct RelationshipStore {
    owner: Identity,
    documents: Arc<dyn DocumentStore>,
    in_flight: InFlightRegistry,
}

impl RelationshipStore {
    /// Create a store acting for `owner`.
    #[must_use]
    pub fn new(owner: Identity, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            owner,
            documents,
            in_flight: Arc::default(),
        }
    }

    /// The identity this store acts for.
    #[must_use]
    pub const fn owner(&self) -> &Identity {
        &self.owner
    }

    fn key(a: &Identity, b: &Identity) -> StoreResult<PairKey> {
        PairKey::canonical(a, b).ok_or_else(|| StoreError::SelfPair(a.clone()))
    }

    async fn enter(&self, key: &PairKey) -> InFlight {
        let slot = {
            let mut registry = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(registry.entry(key.clone()).or_default())
        };
        let guard = slot.lock_owned().await;
        InFlight {
            key: key.clone(),
            registry: Arc::clone(&self.in_flight),
            _slot: guard,
        }
    }

    /// Ensure a `users` document exists for `identity`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    #[instrument(skip(self, email), fields(identity = %identity))]
    pub async fn register_identity(
        &self,
        identity: &Identity,
        email: &str,
    ) -> StoreResult<IdentityRecord> {
        if let Some(existing) = self.documents.get_user(identity).await? {
            return Ok(existing);
        }
        let created = self.documents.create_user(identity, email).await?;
        info!("Registered identity record");
        Ok(created)
    }

    /// Look up the pair of `a` and `b` without creating it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SelfPair`] when `a == b`, otherwise propagates
    /// store failures.
    pub async fn find_pair(&self, a: &Identity, b: &Identity) -> StoreResult<Option<PairRecord>> {
        let key = Self::key(a, b)?;
        self.documents.query_pair(&key).await
    }

    /// Find the pair of `a` and `b`, creating it with `initial_score` if no
    /// record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SelfPair`] when `a == b`, otherwise propagates
    /// store failures.
    #[instrument(skip(self, a, b), fields(pair))]
    pub async fn find_or_create_pair(
        &self,
        a: &Identity,
        b: &Identity,
        initial_score: f64,
    ) -> StoreResult<PairRecord> {
        let key = Self::key(a, b)?;
        tracing::Span::current().record("pair", tracing::field::display(&key));
        let _in_flight = self.enter(&key).await;

        if let Some(existing) = self.documents.query_pair(&key).await? {
            return Ok(existing);
        }
        if let Some(existing) = self.documents.query_pair(&key).await? {
            debug!("Pair appeared between lookups");
            return Ok(existing);
        }

        let created = self
            .documents
            .create_pair(&key, initial_score.clamp(0.0, 1.0))
            .await?;
        info!(pair_id = %created.id, "Created pair record");
        Ok(created)
    }

    /// Set the owner's own bond flag toward `other`, then reconcile indices.
    ///
    /// # Errors
    ///
    /// Propagates store failures. A failure after the flag write leaves the
    /// indices stale until the next transition or [`Self::reconcile_pair`].
    pub async fn set_own_bond_status(
        &self,
        other: &Identity,
        bonding: bool,
    ) -> StoreResult<PairRecord> {
        self.transition(other, Writer::Owner, bonding).await
    }

    /// Set `other`'s bond flag toward the owner, then reconcile indices.
    /// Used to withdraw a bond or decline a request on the peer's behalf.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_own_bond_status`].
    pub async fn set_other_bond_status(
        &self,
        other: &Identity,
        bonding: bool,
    ) -> StoreResult<PairRecord> {
        self.transition(other, Writer::Peer, bonding).await
    }

    #[instrument(skip(self), fields(owner = %self.owner, other = %other))]
    async fn transition(
        &self,
        other: &Identity,
        writer: Writer,
        bonding: bool,
    ) -> StoreResult<PairRecord> {
        let pair = self.find_or_create_pair(&self.owner, other, 0.0).await?;
        let owner_side = pair
            .side_of(&self.owner)
            .ok_or_else(|| StoreError::NotAMember {
                identity: self.owner.clone(),
                pair: pair.key(),
            })?;
        let side = match writer {
            Writer::Owner => owner_side,
            Writer::Peer => owner_side.other(),
        };

        let updated = self
            .documents
            .set_pair_flag(&pair.id, side, bonding)
            .await?;
        info!(
            ?side,
            bonding,
            state = ?BondState::of(&updated),
            "Bond flag committed"
        );

        // Plan from a fresh read so a flag the peer wrote meanwhile is honored.
        let latest = match self.documents.query_pair(&updated.key()).await? {
            Some(fresh) if fresh.id == updated.id => fresh,
            _ => updated,
        };
        self.reconcile(&latest).await?;
        Ok(latest)
    }

    /// Rebuild both identities' sets for `pair` from its flags.
    ///
    /// Returns the ops that were applied; empty when the sets already agreed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownIdentity`] if either identity has no
    /// record, otherwise propagates store failures.
    pub async fn reconcile(&self, pair: &PairRecord) -> StoreResult<Vec<IndexOp>> {
        let key = pair.key();
        let low = self
            .documents
            .get_user(key.low())
            .await?
            .ok_or_else(|| StoreError::UnknownIdentity(key.low().clone()))?;
        let high = self
            .documents
            .get_user(key.high())
            .await?
            .ok_or_else(|| StoreError::UnknownIdentity(key.high().clone()))?;

        let ops = lattice::plan(&key, BondState::of(pair), &low, &high);
        for op in &ops {
            self.apply_op(op).await?;
        }
        if !ops.is_empty() {
            debug!(pair = %key, applied = ops.len(), "Reconciled indices");
        }
        Ok(ops)
    }

    /// Re-derive the indices of the pair of `a` and `b` from its flags.
    ///
    /// Returns `None` when no pair exists.
    ///
    /// # Errors
    ///
    /// Same as [`Self::reconcile`].
    pub async fn reconcile_pair(
        &self,
        a: &Identity,
        b: &Identity,
    ) -> StoreResult<Option<PairRecord>> {
        let Some(pair) = self.find_pair(a, b).await? else {
            return Ok(None);
        };
        self.reconcile(&pair).await?;
        Ok(Some(pair))
    }

    async fn apply_op(&self, op: &IndexOp) -> StoreResult<()> {
        if op.present {
            self.documents
                .array_union(&op.target, op.field, &op.member)
                .await
        } else {
            self.documents
                .array_remove(&op.target, op.field, &op.member)
                .await
        }
    }

    /// Ensure `member` is in `target`'s incoming set.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn add_to_incoming(&self, target: &Identity, member: &Identity) -> StoreResult<()> {
        self.documents
            .array_union(target, IndexField::Incoming, member)
            .await
    }

    /// Ensure `member` is not in `target`'s incoming set.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn remove_from_incoming(
        &self,
        target: &Identity,
        member: &Identity,
    ) -> StoreResult<()> {
        self.documents
            .array_remove(target, IndexField::Incoming, member)
            .await
    }

    /// Ensure `member` is in `target`'s bonded set.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn add_to_bonded(&self, target: &Identity, member: &Identity) -> StoreResult<()> {
        self.documents
            .array_union(target, IndexField::Bonded, member)
            .await
    }

    /// Ensure `member` is not in `target`'s bonded set.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn remove_from_bonded(
        &self,
        target: &Identity,
        member: &Identity,
    ) -> StoreResult<()> {
        self.documents
            .array_remove(target, IndexField::Bonded, member)
            .await
    }

    /// Add one minute of time together to `pair`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn record_together_minute(
        &self,
        pair: &PairRecord,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<PairRecord> {
        self.documents
            .increment_together_minutes(&pair.id, seen_at)
            .await
    }

    /// The identity record of `identity`, if registered.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_identity_record(
        &self,
        identity: &Identity,
    ) -> StoreResult<Option<IdentityRecord>> {
        self.documents.get_user(identity).await
    }

    /// Identities awaiting `identity`'s reciprocation.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_incoming(&self, identity: &Identity) -> StoreResult<Vec<Identity>> {
        Ok(self
            .get_identity_record(identity)
            .await?
            .map(|record| record.incoming.into_iter().collect())
            .unwrap_or_default())
    }

    /// Identities mutually bonded with `identity`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_bonded(&self, identity: &Identity) -> StoreResult<Vec<Identity>> {
        Ok(self
            .get_identity_record(identity)
            .await?
            .map(|record| record.bonded.into_iter().collect())
            .unwrap_or_default())
    }

    /// Bonded peers of `identity` with accumulated time, most time first,
    /// at most `limit` entries.
    ///
    /// Bonded entries whose pair record is missing are skipped.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_bonded_with_time(
        &self,
        identity: &Identity,
        limit: usize,
    ) -> StoreResult<Vec<BondedPeer>> {
        let mut peers = Vec::new();
        for peer in self.list_bonded(identity).await? {
            match self.find_pair(identity, &peer).await? {
                Some(pair) => peers.push(BondedPeer {
                    identity: peer,
                    total_together_minutes: pair.total_together_minutes,
                    similarity_score: pair.similarity_score,
                }),
                None => warn!(peer = %peer, "Bonded peer without pair record"),
            }
        }
        peers.sort_by(|a, b| {
            b.total_together_minutes
                .cmp(&a.total_together_minutes)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        peers.truncate(limit);
        Ok(peers)
    }
}
