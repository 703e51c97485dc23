//! One signed-in device: beacon, relationships, accumulation and detection.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::accumulator::TimeAccumulator;
use crate::beacon::{BeaconRadio, ProximityBeacon, RadioStatus};
use crate::clock::{to_chrono, Clock};
use crate::config::BondConfig;
use crate::coordinator::{DetectionCoordinator, NearbyPeer};
use crate::error::Result;
use crate::similarity::SimilarityProvider;
use crate::store::{DocumentStore, RelationshipStore};
use crate::types::{BondedPeer, Identity, IdentityRecord, PairRecord};

/// Capacity of the decoded-detection queue between beacon and coordinator.
const DETECTION_QUEUE_CAPACITY: usize = 64;

/// Radio status after [`BondSession::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StartReport {
    /// Broadcast status.
    pub broadcasting: RadioStatus,
    /// Scan status.
    pub scanning: RadioStatus,
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

/// A device session for one owner identity.
pub struct BondSession {
    owner: Identity,
    email: String,
    sweep_interval: std::time::Duration,
    beacon: ProximityBeacon,
    relationships: Arc<RelationshipStore>,
    accumulator: Arc<TimeAccumulator>,
    coordinator: Arc<DetectionCoordinator>,
    tasks: Mutex<Tasks>,
}

impl BondSession {
    /// Assemble a session from configuration and its collaborators.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no valid username is configured.
    pub fn new(
        config: &BondConfig,
        radio: Arc<dyn BeaconRadio>,
        documents: Arc<dyn DocumentStore>,
        similarity: Arc<dyn SimilarityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let owner = config.owner()?;
        let relationships = Arc::new(RelationshipStore::new(owner.clone(), documents));
        let accumulator = Arc::new(TimeAccumulator::new(
            Arc::clone(&relationships),
            Arc::clone(&clock),
            to_chrono(config.timing.accumulate_interval()),
        ));
        let coordinator = Arc::new(DetectionCoordinator::new(
            Arc::clone(&relationships),
            Arc::clone(&accumulator),
            similarity,
            clock,
            to_chrono(config.timing.liveness_window()),
        ));

        Ok(Self {
            owner,
            email: config.identity.email.clone(),
            sweep_interval: config.timing.sweep_interval(),
            beacon: ProximityBeacon::new(radio, &config.beacon),
            relationships,
            accumulator,
            coordinator,
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// Register the owner, start the radio and the background tasks.
    /// Calling it on a running session restarts the radio and tasks.
    ///
    /// # Errors
    ///
    /// Fails if registration fails or the radio refuses to start. A missing
    /// radio is not an error; see [`StartReport`].
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn start(&self) -> Result<StartReport> {
        self.relationships
            .register_identity(&self.owner, &self.email)
            .await?;
        self.coordinator.refresh_identity_record().await?;

        let broadcasting = self.beacon.start_broadcasting(&self.owner).await?;
        let (tx, rx) = mpsc::channel(DETECTION_QUEUE_CAPACITY);
        let scanning = self.beacon.start_scanning(tx).await?;

        let mut tasks = self.tasks.lock().await;
        abort(&mut tasks);
        tasks.pump = Some(tokio::spawn(
            Arc::clone(&self.coordinator).run_detection_pump(rx),
        ));
        tasks.sweeper = Some(tokio::spawn(
            Arc::clone(&self.coordinator).run_sweeper(self.sweep_interval),
        ));

        info!(?broadcasting, ?scanning, "Session started");
        Ok(StartReport {
            broadcasting,
            scanning,
        })
    }

    /// Stop the radio and background tasks and forget all cached state.
    /// In-flight store calls are left to finish on their own.
    ///
    /// # Errors
    ///
    /// Returns the first radio failure; teardown still completes.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn sign_out(&self) -> Result<()> {
        let broadcast = self.beacon.stop_broadcasting().await;
        let scan = self.beacon.stop_scanning().await;

        abort(&mut *self.tasks.lock().await);
        self.coordinator.clear();
        self.accumulator.clear_cache();
        info!("Signed out");

        if let Err(e) = &broadcast {
            warn!(error = %e, "Failed to stop broadcasting");
        }
        if let Err(e) = &scan {
            warn!(error = %e, "Failed to stop scanning");
        }
        broadcast?;
        scan?;
        Ok(())
    }

    /// Whether background tasks are running.
    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.pump.is_some()
    }

    /// Request a bond with `peer`, or accept the request `peer` made.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn request_bond(&self, peer: &Identity) -> Result<PairRecord> {
        let pair = self.relationships.set_own_bond_status(peer, true).await?;
        self.refresh().await;
        Ok(pair)
    }

    /// Accept `peer`'s pending request.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn accept_bond(&self, peer: &Identity) -> Result<PairRecord> {
        self.request_bond(peer).await
    }

    /// Decline `peer`'s pending request by clearing their flag.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn decline_bond(&self, peer: &Identity) -> Result<PairRecord> {
        let pair = self.relationships.set_other_bond_status(peer, false).await?;
        self.refresh().await;
        Ok(pair)
    }

    /// Dissolve the bond with `peer`, clearing both flags.
    ///
    /// # Errors
    ///
    /// Propagates store failures. If the second write fails, the pair is left
    /// one-sided and the peer sees an incoming request until it is retried.
    pub async fn unbond(&self, peer: &Identity) -> Result<PairRecord> {
        self.relationships.set_own_bond_status(peer, false).await?;
        let pair = self.relationships.set_other_bond_status(peer, false).await?;
        self.refresh().await;
        Ok(pair)
    }

    async fn refresh(&self) {
        if let Err(e) = self.coordinator.refresh_identity_record().await {
            warn!(error = %e, "Failed to refresh identity record");
        }
    }

    /// The owner identity.
    #[must_use]
    pub const fn owner(&self) -> &Identity {
        &self.owner
    }

    /// The owner's identity record, freshly loaded.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn me(&self) -> Result<Option<IdentityRecord>> {
        Ok(self.coordinator.refresh_identity_record().await?)
    }

    /// Identities awaiting the owner's reciprocation.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn incoming(&self) -> Result<Vec<Identity>> {
        Ok(self.relationships.list_incoming(&self.owner).await?)
    }

    /// Bonded peers with time together, most first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn bonds(&self, limit: usize) -> Result<Vec<BondedPeer>> {
        Ok(self
            .relationships
            .list_bonded_with_time(&self.owner, limit)
            .await?)
    }

    /// Nearby, not yet bonded peers.
    #[must_use]
    pub fn nearby(&self) -> Vec<NearbyPeer> {
        self.coordinator.nearby()
    }

    /// Observe nearby-list snapshots.
    #[must_use]
    pub fn watch_nearby(&self) -> watch::Receiver<Vec<NearbyPeer>> {
        self.coordinator.subscribe()
    }

    /// The beacon.
    #[must_use]
    pub const fn beacon(&self) -> &ProximityBeacon {
        &self.beacon
    }

    /// The relationship store acting for the owner.
    #[must_use]
    pub fn relationships(&self) -> &Arc<RelationshipStore> {
        &self.relationships
    }

    /// The time accumulator.
    #[must_use]
    pub fn accumulator(&self) -> &Arc<TimeAccumulator> {
        &self.accumulator
    }

    /// The detection coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<DetectionCoordinator> {
        &self.coordinator
    }
}

fn abort(tasks: &mut Tasks) {
    for handle in [tasks.pump.take(), tasks.sweeper.take()].into_iter().flatten() {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::radio::{MockAir, MockRadio};
    use crate::similarity::FallbackSimilarity;
    use crate::store::LocalDocumentStore;

    fn config(username: &str) -> BondConfig {
        let mut config = BondConfig::default();
        config.identity.username = Some(username.to_string());
        config.identity.email = format!("{username}@example.com");
        config
    }

    fn session(username: &str, radio: Arc<dyn BeaconRadio>) -> BondSession {
        BondSession::new(
            &config(username),
            radio,
            Arc::new(LocalDocumentStore::in_memory()),
            Arc::new(FallbackSimilarity),
            Arc::new(ManualClock::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_new_requires_username() {
        let result = BondSession::new(
            &BondConfig::default(),
            Arc::new(MockRadio::unavailable()),
            Arc::new(LocalDocumentStore::in_memory()),
            Arc::new(FallbackSimilarity),
            Arc::new(ManualClock::default()),
        );
        assert!(matches!(result, Err(e) if e.is_config_error()));
    }

    #[tokio::test]
    async fn test_start_registers_and_runs() {
        let air = MockAir::new();
        let session = session("alice", Arc::new(MockRadio::new(&air, -50)));
        let report = session.start().await.unwrap();
        assert_eq!(report.broadcasting, RadioStatus::Active);
        assert_eq!(report.scanning, RadioStatus::Active);
        assert!(session.is_running().await);
        assert_eq!(air.advertiser_count(), 1);

        let me = session.me().await.unwrap().unwrap();
        assert_eq!(me.email, "alice@example.com");
    }

    #[tokio::test]
    async fn test_missing_radio_still_starts() {
        let session = session("alice", Arc::new(MockRadio::unavailable()));
        let report = session.start().await.unwrap();
        assert_eq!(report.broadcasting, RadioStatus::Unavailable);
        assert_eq!(report.scanning, RadioStatus::Unavailable);
        session.sign_out().await.unwrap();
    }

    #[tokio::test]
    async fn test_sign_out_tears_down() {
        let air = MockAir::new();
        let session = session("alice", Arc::new(MockRadio::new(&air, -50)));
        session.start().await.unwrap();
        session.sign_out().await.unwrap();

        assert!(!session.is_running().await);
        assert!(!session.beacon().is_broadcasting().await);
        assert!(!session.beacon().is_scanning().await);
        assert_eq!(air.advertiser_count(), 0);
        assert_eq!(air.scanner_count(), 0);
        assert_eq!(session.accumulator().tracked_peers(), 0);

        // Safe to repeat.
        session.sign_out().await.unwrap();
    }
}
