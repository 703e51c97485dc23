//! A [`DocumentStore`] wrapper with failure injection for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DocumentStore, IndexField, LocalDocumentStore, StoreError, StoreResult};
use crate::types::{Identity, IdentityRecord, PairKey, PairRecord, Side};

/// Delegates to a shared [`LocalDocumentStore`], misbehaving on request.
#[derive(Default)]
pub struct ScriptedStore {
    pub inner: Arc<LocalDocumentStore>,
    /// Pair lookups that will report "not found" regardless of contents.
    pub miss_lookups: AtomicUsize,
    /// Every pair lookup fails as unavailable.
    pub fail_lookups: AtomicBool,
    /// Every increment fails as unavailable.
    pub fail_increments: AtomicBool,
    /// Every flag write fails as unavailable.
    pub fail_flag_writes: AtomicBool,
    /// After the next flag write, set the opposite flag too, as if the peer's
    /// device accepted concurrently. The returned record predates it.
    pub peer_accepts_after_flag_write: AtomicBool,
    /// Yield to the scheduler before each pair lookup, widening race windows.
    pub yield_on_lookup: AtomicBool,
    /// Pair lookups that reached the store.
    pub lookups: AtomicUsize,
    /// Pair creations that reached the store.
    pub creates: AtomicUsize,
}

impl ScriptedStore {
    pub fn over(inner: Arc<LocalDocumentStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("injected failure".to_string())
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn query_pair(&self, key: &PairKey) -> StoreResult<Option<PairRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.yield_on_lookup.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let missed = self
            .miss_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if missed {
            return Ok(None);
        }
        self.inner.query_pair(key).await
    }

    async fn create_pair(&self, key: &PairKey, similarity_score: f64) -> StoreResult<PairRecord> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_pair(key, similarity_score).await
    }

    async fn set_pair_flag(
        &self,
        pair_id: &str,
        side: Side,
        value: bool,
    ) -> StoreResult<PairRecord> {
        if self.fail_flag_writes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let written = self.inner.set_pair_flag(pair_id, side, value).await?;
        if self.peer_accepts_after_flag_write.swap(false, Ordering::SeqCst) {
            self.inner.set_pair_flag(pair_id, side.other(), true).await?;
        }
        Ok(written)
    }

    async fn increment_together_minutes(
        &self,
        pair_id: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<PairRecord> {
        if self.fail_increments.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.increment_together_minutes(pair_id, seen_at).await
    }

    async fn get_user(&self, identity: &Identity) -> StoreResult<Option<IdentityRecord>> {
        self.inner.get_user(identity).await
    }

    async fn create_user(&self, identity: &Identity, email: &str) -> StoreResult<IdentityRecord> {
        self.inner.create_user(identity, email).await
    }

    async fn array_union(
        &self,
        target: &Identity,
        field: IndexField,
        member: &Identity,
    ) -> StoreResult<()> {
        self.inner.array_union(target, field, member).await
    }

    async fn array_remove(
        &self,
        target: &Identity,
        field: IndexField,
        member: &Identity,
    ) -> StoreResult<()> {
        self.inner.array_remove(target, field, member).await
    }
}
