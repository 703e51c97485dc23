//! Rate-limited accumulation of time spent together.
//!
//! [`TimeAccumulator::tick`] adds one minute to a pair at most once per
//! interval per peer, and only while the pair is mutually bonded. The
//! rate-limit entry is written before the store is touched so a burst of
//! detections cannot all pass the check; every failure removes it again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::store::{RelationshipStore, StoreError};
use crate::types::Identity;

/// Why a tick did not accumulate.
#[derive(Debug, Error)]
pub enum AccumulateError {
    /// No pair record exists; ticks never create one.
    #[error("No pair found with '{peer}'")]
    NoPair {
        /// The detected peer.
        peer: Identity,
    },

    /// At least one side has not bonded.
    #[error("Not mutually bonded with '{peer}'")]
    NotMutuallyBonded {
        /// The detected peer.
        peer: Identity,
    },

    /// The store lookup or increment failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a tick that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// One minute was added.
    Accumulated {
        /// New running total.
        total_minutes: u64,
    },
    /// The previous tick for this peer was within the interval.
    SkippedTooSoon {
        /// Time left until the next tick may accumulate.
        #[serde(skip)]
        retry_in: Duration,
    },
}

/// Per-peer rate-limited time accumulation for one owner.
pub struct TimeAccumulator {
    relationships: Arc<RelationshipStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    last_tick: Mutex<HashMap<Identity, DateTime<Utc>>>,
}

impl TimeAccumulator {
    /// Create an accumulator acting for the owner of `relationships`.
    #[must_use]
    pub fn new(
        relationships: Arc<RelationshipStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            relationships,
            clock,
            interval,
            last_tick: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<Identity, DateTime<Utc>>> {
        self.last_tick.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check the rate limit and claim the slot in one critical section.
    fn claim(&self, peer: &Identity, now: DateTime<Utc>) -> Result<(), Duration> {
        let mut cache = self.cache();
        if let Some(last) = cache.get(peer) {
            let elapsed = now - *last;
            if elapsed < self.interval {
                return Err(self.interval - elapsed);
            }
        }
        cache.insert(peer.clone(), now);
        Ok(())
    }

    /// Drop the claim made at `stamp`, unless a later tick replaced it.
    fn roll_back(&self, peer: &Identity, stamp: DateTime<Utc>) {
        let mut cache = self.cache();
        if cache.get(peer) == Some(&stamp) {
            cache.remove(peer);
        }
    }

    /// Accumulate one minute with `peer` if the interval has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`AccumulateError::NoPair`] or
    /// [`AccumulateError::NotMutuallyBonded`] when gating fails, or the store
    /// error. In every error case the rate-limit entry is rolled back so the
    /// next tick retries.
    #[instrument(skip(self), fields(peer = %peer))]
    pub async fn tick(&self, peer: &Identity) -> Result<TickOutcome, AccumulateError> {
        let now = self.clock.now();
        if let Err(retry_in) = self.claim(peer, now) {
            debug!(retry_in_secs = retry_in.num_seconds(), "Tick skipped, too soon");
            return Ok(TickOutcome::SkippedTooSoon { retry_in });
        }

        let result = self.accumulate(peer, now).await;
        match &result {
            Ok(TickOutcome::Accumulated { total_minutes }) => {
                info!(total_minutes, "Accumulated time together");
            }
            Ok(TickOutcome::SkippedTooSoon { .. }) => {}
            Err(e) => {
                self.roll_back(peer, now);
                match e {
                    AccumulateError::Store(_) => warn!(error = %e, "Tick failed"),
                    _ => debug!(reason = %e, "Tick gated"),
                }
            }
        }
        result
    }

    async fn accumulate(
        &self,
        peer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, AccumulateError> {
        let owner = self.relationships.owner();
        let pair = self
            .relationships
            .find_pair(owner, peer)
            .await?
            .ok_or_else(|| AccumulateError::NoPair { peer: peer.clone() })?;
        if !pair.is_mutual() {
            return Err(AccumulateError::NotMutuallyBonded { peer: peer.clone() });
        }
        let updated = self.relationships.record_together_minute(&pair, now).await?;
        Ok(TickOutcome::Accumulated {
            total_minutes: updated.total_together_minutes,
        })
    }

    /// Forget every rate-limit entry.
    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    /// Number of peers currently rate limited.
    #[must_use]
    pub fn tracked_peers(&self) -> usize {
        self.cache().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio_test::assert_ok;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::ScriptedStore;
    use crate::store::{DocumentStore, LocalDocumentStore};
    use crate::types::PairKey;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    struct Fixture {
        shared: Arc<LocalDocumentStore>,
        scripted: Arc<ScriptedStore>,
        relationships: Arc<RelationshipStore>,
        clock: ManualClock,
        accumulator: TimeAccumulator,
    }

    async fn fixture(mutual: bool) -> Fixture {
        let shared = Arc::new(LocalDocumentStore::in_memory());
        let scripted = Arc::new(ScriptedStore::over(shared.clone()));
        let relationships = Arc::new(RelationshipStore::new(id("alice"), scripted.clone()));
        let bob = RelationshipStore::new(id("bob"), shared.clone());
        relationships.register_identity(&id("alice"), "").await.unwrap();
        bob.register_identity(&id("bob"), "").await.unwrap();

        relationships.set_own_bond_status(&id("bob"), true).await.unwrap();
        if mutual {
            bob.set_own_bond_status(&id("alice"), true).await.unwrap();
        }

        let clock = ManualClock::default();
        let accumulator = TimeAccumulator::new(
            relationships.clone(),
            Arc::new(clock.clone()),
            Duration::seconds(60),
        );
        Fixture {
            shared,
            scripted,
            relationships,
            clock,
            accumulator,
        }
    }

    async fn total(f: &Fixture) -> u64 {
        f.relationships
            .find_pair(&id("alice"), &id("bob"))
            .await
            .unwrap()
            .unwrap()
            .total_together_minutes
    }

    #[tokio::test]
    async fn test_ticks_within_interval_count_once() {
        let f = fixture(true).await;
        let first = assert_ok!(f.accumulator.tick(&id("bob")).await);
        assert_eq!(first, TickOutcome::Accumulated { total_minutes: 1 });

        f.clock.advance(Duration::seconds(10));
        let lookups = f.scripted.lookups();
        let second = assert_ok!(f.accumulator.tick(&id("bob")).await);
        assert_eq!(
            second,
            TickOutcome::SkippedTooSoon {
                retry_in: Duration::seconds(50)
            }
        );
        assert_eq!(f.scripted.lookups(), lookups, "skip must not touch the store");
        assert_eq!(total(&f).await, 1);
    }

    #[tokio::test]
    async fn test_ticks_an_interval_apart_each_count() {
        let f = fixture(true).await;
        assert_ok!(f.accumulator.tick(&id("bob")).await);
        f.clock.advance(Duration::seconds(60));
        assert_ok!(f.accumulator.tick(&id("bob")).await);
        f.clock.advance(Duration::seconds(75));
        let third = assert_ok!(f.accumulator.tick(&id("bob")).await);
        assert_eq!(third, TickOutcome::Accumulated { total_minutes: 3 });

        let key = PairKey::canonical(&id("alice"), &id("bob")).unwrap();
        let pair = f.shared.query_pair(&key).await.unwrap().unwrap();
        assert_eq!(pair.last_seen_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn test_one_sided_bond_never_accumulates_or_poisons_cache() {
        let f = fixture(false).await;
        let err = f.accumulator.tick(&id("bob")).await.unwrap_err();
        assert!(matches!(err, AccumulateError::NotMutuallyBonded { .. }));
        assert_eq!(f.accumulator.tracked_peers(), 0);

        f.clock.advance(Duration::seconds(5));
        let lookups = f.scripted.lookups();
        let err = f.accumulator.tick(&id("bob")).await.unwrap_err();
        assert!(matches!(err, AccumulateError::NotMutuallyBonded { .. }));
        assert!(f.scripted.lookups() > lookups, "retry must reach the store");
        assert_eq!(total(&f).await, 0);
    }

    #[tokio::test]
    async fn test_missing_pair_is_not_created() {
        let f = fixture(true).await;
        let err = f.accumulator.tick(&id("carol")).await.unwrap_err();
        assert!(matches!(err, AccumulateError::NoPair { .. }));
        assert_eq!(f.shared.pair_count().await, 1);
        assert_eq!(f.accumulator.tracked_peers(), 0);
    }

    #[tokio::test]
    async fn test_failed_increment_rolls_back() {
        let f = fixture(true).await;
        f.scripted.fail_increments.store(true, Ordering::SeqCst);
        let err = f.accumulator.tick(&id("bob")).await.unwrap_err();
        assert!(matches!(err, AccumulateError::Store(ref e) if e.is_transient()));

        f.scripted.fail_increments.store(false, Ordering::SeqCst);
        f.clock.advance(Duration::seconds(1));
        let retried = assert_ok!(f.accumulator.tick(&id("bob")).await);
        assert_eq!(retried, TickOutcome::Accumulated { total_minutes: 1 });
    }

    #[tokio::test]
    async fn test_unwritable_snapshot_never_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let documents = Arc::new(LocalDocumentStore::open(&data_dir).unwrap());
        let relationships = Arc::new(RelationshipStore::new(id("alice"), documents.clone()));
        let bob = RelationshipStore::new(id("bob"), documents.clone());
        relationships.register_identity(&id("alice"), "").await.unwrap();
        bob.register_identity(&id("bob"), "").await.unwrap();
        relationships.set_own_bond_status(&id("bob"), true).await.unwrap();
        bob.set_own_bond_status(&id("alice"), true).await.unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, "not a directory").unwrap();

        let clock = ManualClock::default();
        let accumulator = TimeAccumulator::new(
            relationships.clone(),
            Arc::new(clock.clone()),
            Duration::seconds(60),
        );
        for _ in 0..3 {
            let err = accumulator.tick(&id("bob")).await.unwrap_err();
            assert!(matches!(err, AccumulateError::Store(_)));
            clock.advance(Duration::seconds(1));
        }

        let pair = relationships.find_pair(&id("alice"), &id("bob")).await.unwrap().unwrap();
        assert_eq!(pair.total_together_minutes, 0);
        assert_eq!(accumulator.tracked_peers(), 0);
    }

    #[tokio::test]
    async fn test_failed_lookup_rolls_back() {
        let f = fixture(true).await;
        f.scripted.fail_lookups.store(true, Ordering::SeqCst);
        assert!(f.accumulator.tick(&id("bob")).await.is_err());
        assert_eq!(f.accumulator.tracked_peers(), 0);
    }

    #[tokio::test]
    async fn test_clear_cache_unthrottles() {
        let f = fixture(true).await;
        assert_ok!(f.accumulator.tick(&id("bob")).await);
        f.accumulator.clear_cache();
        let again = assert_ok!(f.accumulator.tick(&id("bob")).await);
        assert_eq!(again, TickOutcome::Accumulated { total_minutes: 2 });
    }

    #[tokio::test]
    async fn test_concurrent_burst_accumulates_once() {
        let f = fixture(true).await;
        f.scripted.yield_on_lookup.store(true, Ordering::SeqCst);
        let peer = id("bob");
        let (a, b, c) = tokio::join!(
            f.accumulator.tick(&peer),
            f.accumulator.tick(&peer),
            f.accumulator.tick(&peer),
        );
        let accumulated = [a, b, c]
            .into_iter()
            .filter(|r| matches!(r, Ok(TickOutcome::Accumulated { .. })))
            .count();
        assert_eq!(accumulated, 1);
        assert_eq!(total(&f).await, 1);
    }
}
