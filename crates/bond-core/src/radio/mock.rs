//! In-process radio medium.
//!
//! A [`MockAir`] stands in for the physical channel: every [`MockRadio`]
//! attached to it can advertise and scan, and [`MockAir::pulse`] delivers one
//! round of advertisements to every scanner. Delivery uses `try_send`, so a
//! full scanner queue loses advertisements exactly like a busy radio would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::beacon::{BeaconError, BeaconRadio, BeaconResult, RawAdvertisement};

#[derive(Default)]
struct AirState {
    advertisers: HashMap<u64, Advert>,
    scanners: HashMap<u64, Scanner>,
}

struct Advert {
    service: Uuid,
    local_name: String,
    rssi: i16,
}

struct Scanner {
    service: Uuid,
    sink: mpsc::Sender<RawAdvertisement>,
}

/// Shared medium connecting mock radios.
#[derive(Default)]
pub struct MockAir {
    state: Mutex<AirState>,
    next_id: AtomicU64,
}

impl MockAir {
    /// Create an empty medium.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver every current advertisement to every scanner on the same
    /// service, except the advertiser's own radio.
    pub fn pulse(&self) {
        let state = self.state();
        for (scanner_id, scanner) in &state.scanners {
            for (advertiser_id, advert) in &state.advertisers {
                if advertiser_id == scanner_id || advert.service != scanner.service {
                    continue;
                }
                let _ = scanner.sink.try_send(RawAdvertisement {
                    service_uuids: vec![advert.service],
                    local_name: Some(advert.local_name.clone()),
                    rssi: advert.rssi,
                });
            }
        }
    }

    /// Deliver an arbitrary advertisement to every scanner.
    pub fn inject(&self, advertisement: &RawAdvertisement) {
        for scanner in self.state().scanners.values() {
            let _ = scanner.sink.try_send(advertisement.clone());
        }
    }

    /// Number of radios currently advertising.
    #[must_use]
    pub fn advertiser_count(&self) -> usize {
        self.state().advertisers.len()
    }

    /// Number of radios currently scanning.
    #[must_use]
    pub fn scanner_count(&self) -> usize {
        self.state().scanners.len()
    }
}

/// A radio attached to a [`MockAir`].
pub struct MockRadio {
    air: Option<Arc<MockAir>>,
    id: u64,
    rssi: i16,
}

impl MockRadio {
    /// Attach a radio to `air`. Its advertisements are heard at `rssi` dBm.
    #[must_use]
    pub fn new(air: &Arc<MockAir>, rssi: i16) -> Self {
        Self {
            air: Some(Arc::clone(air)),
            id: air.next_id.fetch_add(1, Ordering::Relaxed),
            rssi,
        }
    }

    /// A radio with no adapter. Every start reports missing capability.
    #[must_use]
    pub const fn unavailable() -> Self {
        Self {
            air: None,
            id: 0,
            rssi: 0,
        }
    }

    fn air(&self) -> BeaconResult<&MockAir> {
        self.air.as_deref().ok_or(BeaconError::AdapterNotFound)
    }
}

#[async_trait]
impl BeaconRadio for MockRadio {
    async fn start_advertising(&self, service: Uuid, local_name: &str) -> BeaconResult<()> {
        self.air()?.state().advertisers.insert(
            self.id,
            Advert {
                service,
                local_name: local_name.to_string(),
                rssi: self.rssi,
            },
        );
        Ok(())
    }

    async fn stop_advertising(&self) -> BeaconResult<()> {
        if let Some(air) = self.air.as_deref() {
            air.state().advertisers.remove(&self.id);
        }
        Ok(())
    }

    async fn start_scanning(
        &self,
        service: Uuid,
        sink: mpsc::Sender<RawAdvertisement>,
    ) -> BeaconResult<()> {
        self.air()?
            .state()
            .scanners
            .insert(self.id, Scanner { service, sink });
        Ok(())
    }

    async fn stop_scanning(&self) -> BeaconResult<()> {
        if let Some(air) = self.air.as_deref() {
            air.state().scanners.remove(&self.id);
        }
        Ok(())
    }
}
