//! Turns radio detections into store calls and a live "nearby" list.
//!
//! Every detection refreshes the peer's last-seen stamp and fires a
//! time-accumulation tick. A peer seen for the first time gets one similarity
//! lookup and a pair record; once that succeeds, it is shown in the nearby
//! list unless the owner's record already lists it as bonded or incoming.
//! A periodic sweep reloads the owner's record and drops peers not heard
//! within the liveness window; there is no explicit "peer left" event.
//!
//! The detection pump never waits on the network: introductions run as
//! their own tasks, at most one per peer at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::accumulator::TimeAccumulator;
use crate::beacon::Detection;
use crate::clock::Clock;
use crate::similarity::{Similarity, SimilarityProvider};
use crate::store::{RelationshipStore, StoreResult};
use crate::types::{Identity, IdentityRecord};

/// A peer currently in range and not yet bonded.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct NearbyPeer {
    /// The peer.
    pub identity: Identity,
    /// Most recent signal strength in dBm.
    pub rssi: i16,
    /// Similarity score with the owner.
    pub similarity_score: f64,
    /// One-line description of the peer.
    pub summary: String,
    /// Conversation starters.
    pub icebreakers: Vec<String>,
    /// When the peer was last heard.
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Default)]
struct CoordinatorState {
    last_seen: HashMap<Identity, DateTime<Utc>>,
    nearby: BTreeMap<Identity, NearbyPeer>,
    /// In-range peers whose pair exists, with the similarity fetched for them.
    introduced: HashMap<Identity, Similarity>,
    /// Peers with an introduction in flight.
    introducing: HashSet<Identity>,
    known: Option<IdentityRecord>,
}

impl CoordinatorState {
    fn hides(&self, peer: &Identity) -> bool {
        self.known
            .as_ref()
            .is_some_and(|record| record.bonded.contains(peer) || record.incoming.contains(peer))
    }

    fn snapshot(&self) -> Vec<NearbyPeer> {
        let mut peers: Vec<_> = self.nearby.values().cloned().collect();
        peers.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.identity.cmp(&b.identity)));
        peers
    }

    /// Show `peer` if it is still in range, introduced and not hidden.
    /// Returns whether the list changed.
    fn surface(&mut self, peer: &Identity, rssi: i16, seen_at: DateTime<Utc>) -> bool {
        if !self.last_seen.contains_key(peer) || self.hides(peer) {
            return false;
        }
        let Some(similarity) = self.introduced.get(peer).cloned() else {
            return false;
        };
        let entry = NearbyPeer {
            identity: peer.clone(),
            rssi,
            similarity_score: similarity.score,
            summary: similarity.peer_summary,
            icebreakers: similarity.icebreakers,
            last_seen_at: seen_at,
        };
        if self.nearby.insert(peer.clone(), entry).is_none() {
            debug!(peer = %peer, rssi, "Peer surfaced as nearby");
        }
        true
    }
}

/// What a detection set in motion.
struct Sighting {
    tick: JoinHandle<()>,
    needs_introduction: bool,
    seen_at: DateTime<Utc>,
}

/// Bridges detections to the relationship store and time accumulator.
pub struct DetectionCoordinator {
    relationships: Arc<RelationshipStore>,
    accumulator: Arc<TimeAccumulator>,
    similarity: Arc<dyn SimilarityProvider>,
    clock: Arc<dyn Clock>,
    liveness_window: Duration,
    state: Mutex<CoordinatorState>,
    nearby_tx: watch::Sender<Vec<NearbyPeer>>,
}

impl DetectionCoordinator {
    /// Create a coordinator for the owner of `relationships`.
    #[must_use]
    pub fn new(
        relationships: Arc<RelationshipStore>,
        accumulator: Arc<TimeAccumulator>,
        similarity: Arc<dyn SimilarityProvider>,
        clock: Arc<dyn Clock>,
        liveness_window: Duration,
    ) -> Self {
        let (nearby_tx, _) = watch::channel(Vec::new());
        Self {
            relationships,
            accumulator,
            similarity,
            clock,
            liveness_window,
            state: Mutex::new(CoordinatorState::default()),
            nearby_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &CoordinatorState) {
        self.nearby_tx.send_replace(state.snapshot());
    }

    /// Handle one detection, running a first-sighting introduction inline.
    /// Returns the spawned accumulation tick so callers may await it;
    /// dropping the handle detaches it.
    pub async fn handle_detection(&self, detection: Detection) -> Option<JoinHandle<()>> {
        let sighting = self.record_sighting(&detection)?;
        if sighting.needs_introduction {
            self.introduce_and_surface(&detection.peer, detection.rssi, sighting.seen_at)
                .await;
        }
        Some(sighting.tick)
    }

    /// The synchronous part of a detection: stamp, tick and, for a known
    /// peer, refresh its nearby entry. Claims the introduction when the peer
    /// is new and nobody else is introducing it.
    fn record_sighting(&self, detection: &Detection) -> Option<Sighting> {
        let Detection { peer, rssi } = detection;
        if peer == self.relationships.owner() {
            return None;
        }

        let seen_at = self.clock.now();
        let tick = {
            let accumulator = Arc::clone(&self.accumulator);
            let peer = peer.clone();
            tokio::spawn(async move {
                // Outcome is logged inside tick.
                let _ = accumulator.tick(&peer).await;
            })
        };

        let mut state = self.state();
        state.last_seen.insert(peer.clone(), seen_at);
        let needs_introduction = if state.introduced.contains_key(peer) {
            if state.surface(peer, *rssi, seen_at) {
                self.publish(&state);
            }
            false
        } else {
            state.introducing.insert(peer.clone())
        };
        Some(Sighting {
            tick,
            needs_introduction,
            seen_at,
        })
    }

    async fn introduce_and_surface(&self, peer: &Identity, rssi: i16, seen_at: DateTime<Utc>) {
        let result = self.introduce(peer).await;
        let mut state = self.state();
        state.introducing.remove(peer);
        if let Err(e) = result {
            warn!(peer = %peer, error = %e, "Failed to record pair for new peer");
            return;
        }
        // A sweep may have expired the peer while we were introducing it.
        if !state.last_seen.contains_key(peer) {
            state.introduced.remove(peer);
            return;
        }
        if state.surface(peer, rssi, seen_at) {
            self.publish(&state);
        }
    }

    /// First sighting: fetch similarity once, make sure a pair exists and
    /// refresh the owner's record so bonded peers are hidden.
    async fn introduce(&self, peer: &Identity) -> StoreResult<()> {
        let owner = self.relationships.owner();
        let similarity = match self.similarity.score(owner, peer).await {
            Ok(similarity) => similarity,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Using fallback similarity");
                Similarity::fallback()
            }
        };

        let pair = self
            .relationships
            .find_or_create_pair(owner, peer, similarity.score)
            .await?;
        info!(peer = %peer, pair_id = %pair.id, score = similarity.score, "New peer nearby");

        let known = self.relationships.get_identity_record(owner).await?;
        let mut state = self.state();
        state.introduced.entry(peer.clone()).or_insert(similarity);
        if known.is_some() {
            state.known = known;
        }
        Ok(())
    }

    /// Reload the owner's record and hide peers it now lists.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the previous record stays in effect.
    pub async fn refresh_identity_record(&self) -> StoreResult<Option<IdentityRecord>> {
        let known = self
            .relationships
            .get_identity_record(self.relationships.owner())
            .await?;
        let mut state = self.state();
        state.known.clone_from(&known);
        let before = state.nearby.len();
        let hidden: Vec<_> = state
            .nearby
            .keys()
            .filter(|peer| state.hides(peer))
            .cloned()
            .collect();
        for peer in &hidden {
            state.nearby.remove(peer);
        }
        if state.nearby.len() != before {
            self.publish(&state);
        }
        Ok(known)
    }

    /// Drop peers not heard within the liveness window. Returns who expired.
    pub fn sweep(&self) -> Vec<Identity> {
        let now = self.clock.now();
        let mut state = self.state();
        let expired: Vec<_> = state
            .last_seen
            .iter()
            .filter(|(_, seen)| now - **seen > self.liveness_window)
            .map(|(peer, _)| peer.clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }
        for peer in &expired {
            state.last_seen.remove(peer);
            state.nearby.remove(peer);
            state.introduced.remove(peer);
            debug!(peer = %peer, "Peer out of range");
        }
        self.publish(&state);
        expired
    }

    /// Reload the owner's record, then sweep. A peer whose request or bond
    /// was written from another device is hidden here even if the owner
    /// never touches the store.
    pub async fn sweep_and_refresh(&self) -> Vec<Identity> {
        if let Err(e) = self.refresh_identity_record().await {
            debug!(error = %e, "Keeping previous identity record");
        }
        self.sweep()
    }

    /// Current nearby peers, strongest signal first.
    #[must_use]
    pub fn nearby(&self) -> Vec<NearbyPeer> {
        self.state().snapshot()
    }

    /// Observe nearby-list snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<NearbyPeer>> {
        self.nearby_tx.subscribe()
    }

    /// The owner's record as last loaded.
    #[must_use]
    pub fn known_record(&self) -> Option<IdentityRecord> {
        self.state().known.clone()
    }

    /// Forget every peer and cached lookup.
    pub fn clear(&self) {
        let mut state = self.state();
        *state = CoordinatorState::default();
        self.publish(&state);
    }

    /// Feed detections from `detections` until the channel closes.
    pub async fn run_detection_pump(self: Arc<Self>, mut detections: mpsc::Receiver<Detection>) {
        while let Some(detection) = detections.recv().await {
            // Ticks run detached.
            let Some(sighting) = self.record_sighting(&detection) else {
                continue;
            };
            if sighting.needs_introduction {
                let coordinator = Arc::clone(&self);
                tokio::spawn(async move {
                    coordinator
                        .introduce_and_surface(&detection.peer, detection.rssi, sighting.seen_at)
                        .await;
                });
            }
        }
        debug!("Detection channel closed");
    }

    /// Sweep every `period` for as long as the task runs.
    pub async fn run_sweeper(self: Arc<Self>, period: StdDuration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.sweep_and_refresh().await;
        }
    }
}
