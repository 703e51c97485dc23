//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bond_core::{
    BeaconRadio, BondConfig, BondSession, DocumentStore, FallbackSimilarity,
    HttpSimilarityClient, LocalDocumentStore, SimilarityProvider, SystemClock,
};
use tracing::{info, warn};

/// Shared application state.
pub type SharedState = Arc<AppState>;

/// Everything a handler can reach.
pub struct AppState {
    session: BondSession,
}

impl AppState {
    /// Wrap an already assembled session.
    #[must_use]
    pub const fn new(session: BondSession) -> Self {
        Self { session }
    }

    /// Build the radio, store and similarity client described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store snapshot cannot be opened, the HTTP
    /// client cannot be built or no identity is configured.
    pub fn from_config(config: &BondConfig) -> anyhow::Result<Self> {
        let documents: Arc<dyn DocumentStore> = if config.store.persist {
            let data_dir = config.store.resolved_data_dir();
            info!(data_dir = %data_dir.display(), "Opening persistent store");
            Arc::new(
                LocalDocumentStore::open(&data_dir)
                    .with_context(|| format!("Failed to open store in {}", data_dir.display()))?,
            )
        } else {
            Arc::new(LocalDocumentStore::in_memory())
        };

        let similarity: Arc<dyn SimilarityProvider> = match &config.similarity.endpoint {
            Some(endpoint) => Arc::new(HttpSimilarityClient::new(
                endpoint.clone(),
                Duration::from_secs(config.similarity.timeout_secs),
            )?),
            None => {
                warn!("No similarity endpoint configured, scores will be zero");
                Arc::new(FallbackSimilarity)
            }
        };

        let session = BondSession::new(
            config,
            radio(),
            documents,
            similarity,
            Arc::new(SystemClock),
        )?;
        Ok(Self::new(session))
    }

    /// The device session.
    #[must_use]
    pub const fn session(&self) -> &BondSession {
        &self.session
    }
}

#[cfg(feature = "bluetooth")]
fn radio() -> Arc<dyn BeaconRadio> {
    Arc::new(bond_core::BluezRadio::new())
}

#[cfg(not(feature = "bluetooth"))]
fn radio() -> Arc<dyn BeaconRadio> {
    warn!("Built without the bluetooth feature, beacon disabled");
    Arc::new(bond_core::MockRadio::unavailable())
}
