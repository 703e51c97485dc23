//! In-process document store with optional JSON snapshot persistence.
//!
//! The snapshot mirrors the remote layout: a `users` collection and a `pairs`
//! collection keyed by generated document id. Like the remote store,
//! `create_pair` does not check for an existing document; duplicate
//! prevention is the caller's job.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DocumentStore, IndexField, StoreError, StoreResult};
use crate::types::{Identity, IdentityRecord, PairKey, PairRecord, Side};

/// File name of the snapshot inside the data directory.
pub const SNAPSHOT_FILE: &str = "bond-store.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Collections {
    #[serde(default)]
    users: BTreeMap<String, IdentityRecord>,
    #[serde(default)]
    pairs: BTreeMap<String, PairRecord>,
}

impl Collections {
    fn user_mut(&mut self, identity: &Identity) -> StoreResult<&mut IdentityRecord> {
        self.users
            .values_mut()
            .find(|user| &user.identity == identity)
            .ok_or_else(|| StoreError::UnknownIdentity(identity.clone()))
    }

    fn pair_mut(&mut self, pair_id: &str) -> StoreResult<&mut PairRecord> {
        self.pairs
            .get_mut(pair_id)
            .ok_or_else(|| StoreError::UnknownPair(pair_id.to_string()))
    }

    fn index_mut(
        &mut self,
        identity: &Identity,
        field: IndexField,
    ) -> StoreResult<&mut BTreeSet<Identity>> {
        let user = self.user_mut(identity)?;
        Ok(match field {
            IndexField::Incoming => &mut user.incoming,
            IndexField::Bonded => &mut user.bonded,
        })
    }
}

/// Document store held in memory.
#[derive(Debug, Default)]
pub struct LocalDocumentStore {
    collections: RwLock<Collections>,
    snapshot_path: Option<PathBuf>,
}

impl LocalDocumentStore {
    /// A store that lives only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store persisted under `data_dir`, loading the existing snapshot
    /// if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read or decoded.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        let path = data_dir.join(SNAPSHOT_FILE);
        let collections = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| {
                StoreError::Persistence {
                    path: path.display().to_string(),
                    source,
                }
            })?;
            let collections: Collections = serde_json::from_str(&content)?;
            info!(
                path = %path.display(),
                users = collections.users.len(),
                pairs = collections.pairs.len(),
                "Loaded store snapshot"
            );
            collections
        } else {
            Collections::default()
        };

        Ok(Self {
            collections: RwLock::new(collections),
            snapshot_path: Some(path),
        })
    }

    fn persist(&self, collections: &Collections) -> StoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let persistence_error = |source| StoreError::Persistence {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(persistence_error)?;
        }
        let content = serde_json::to_string_pretty(collections)?;
        std::fs::write(path, content).map_err(persistence_error)?;
        debug!(path = %path.display(), "Wrote store snapshot");
        Ok(())
    }

    /// Apply `change` to a copy of the collections, persist the copy and only
    /// then swap it in. A failed write leaves memory untouched. Returns `None`
    /// without writing when `change` reports nothing changed.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut Collections) -> StoreResult<Option<T>> + Send,
    ) -> StoreResult<Option<T>> {
        let mut collections = self.collections.write().await;
        let mut next = collections.clone();
        let Some(value) = change(&mut next)? else {
            return Ok(None);
        };
        self.persist(&next)?;
        *collections = next;
        Ok(Some(value))
    }

    /// Number of pair documents. Duplicates from creation races count twice.
    pub async fn pair_count(&self) -> usize {
        self.collections.read().await.pairs.len()
    }
}

fn new_document_id() -> String {
    Uuid::now_v7().to_string()
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn query_pair(&self, key: &PairKey) -> StoreResult<Option<PairRecord>> {
        let collections = self.collections.read().await;
        Ok(collections
            .pairs
            .values()
            .find(|pair| &pair.low == key.low() && &pair.high == key.high())
            .cloned())
    }

    async fn create_pair(&self, key: &PairKey, similarity_score: f64) -> StoreResult<PairRecord> {
        let record = PairRecord {
            id: new_document_id(),
            low: key.low().clone(),
            high: key.high().clone(),
            low_bonded: false,
            high_bonded: false,
            similarity_score,
            total_together_minutes: 0,
            last_seen_at: None,
        };
        self.commit(|collections| {
            collections.pairs.insert(record.id.clone(), record.clone());
            Ok(Some(()))
        })
        .await?;
        Ok(record)
    }

    async fn set_pair_flag(
        &self,
        pair_id: &str,
        side: Side,
        value: bool,
    ) -> StoreResult<PairRecord> {
        let updated = self
            .commit(|collections| {
                let pair = collections.pair_mut(pair_id)?;
                match side {
                    Side::Low => pair.low_bonded = value,
                    Side::High => pair.high_bonded = value,
                }
                Ok(Some(pair.clone()))
            })
            .await?;
        updated.ok_or_else(|| StoreError::UnknownPair(pair_id.to_string()))
    }

    async fn increment_together_minutes(
        &self,
        pair_id: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<PairRecord> {
        let updated = self
            .commit(|collections| {
                let pair = collections.pair_mut(pair_id)?;
                pair.total_together_minutes = pair.total_together_minutes.saturating_add(1);
                pair.last_seen_at = Some(seen_at);
                Ok(Some(pair.clone()))
            })
            .await?;
        updated.ok_or_else(|| StoreError::UnknownPair(pair_id.to_string()))
    }

    async fn get_user(&self, identity: &Identity) -> StoreResult<Option<IdentityRecord>> {
        let collections = self.collections.read().await;
        Ok(collections
            .users
            .values()
            .find(|user| &user.identity == identity)
            .cloned())
    }

    async fn create_user(&self, identity: &Identity, email: &str) -> StoreResult<IdentityRecord> {
        let record = IdentityRecord {
            id: new_document_id(),
            identity: identity.clone(),
            email: email.to_string(),
            incoming: BTreeSet::new(),
            bonded: BTreeSet::new(),
        };
        self.commit(|collections| {
            collections.users.insert(record.id.clone(), record.clone());
            Ok(Some(()))
        })
        .await?;
        Ok(record)
    }

    async fn array_union(
        &self,
        target: &Identity,
        field: IndexField,
        member: &Identity,
    ) -> StoreResult<()> {
        self.commit(|collections| {
            let inserted = collections.index_mut(target, field)?.insert(member.clone());
            Ok(inserted.then_some(()))
        })
        .await?;
        Ok(())
    }

    async fn array_remove(
        &self,
        target: &Identity,
        field: IndexField,
        member: &Identity,
    ) -> StoreResult<()> {
        self.commit(|collections| {
            let removed = collections.index_mut(target, field)?.remove(member);
            Ok(removed.then_some(()))
        })
        .await?;
        Ok(())
    }
}
