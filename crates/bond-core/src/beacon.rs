//! Bluetooth Low Energy broadcast and scan of identity beacons.
//!
//! Every device advertises a local name made of a fixed three character
//! prefix followed by its (possibly truncated) identity, under one
//! application-wide 128-bit service UUID. Scanning devices filter on that UUID,
//! strip the prefix and raise a [`Detection`] carrying the peer identity and
//! the received signal strength.
//!
//! The radio itself sits behind [`BeaconRadio`] so the beacon logic runs the
//! same against BlueZ (`bluetooth` feature) and the in-process
//! [`crate::radio::MockRadio`].
//!
//! Missing radio capability (no adapter, powered off, permission denied) is
//! never fatal: the operation logs a warning and reports
//! [`RadioStatus::Unavailable`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::BeaconConfig;
use crate::types::Identity;

/// Application-wide service UUID advertised by every device.
pub const BOND_SERVICE_UUID: Uuid = Uuid::from_u128(0x8f3c_2a10_5b7e_4d21_9c64_1e0b_b0d5_a7f2);

/// Fixed prefix placed before the identity in the advertised name.
pub const DEFAULT_NAME_PREFIX: &str = "BND";

/// Practical advertisement budget for the local name, prefix included.
pub const MAX_PAYLOAD_BYTES: usize = 20;

/// Capacity of the raw advertisement queue between radio and decoder.
const RAW_QUEUE_CAPACITY: usize = 256;

/// Errors raised by a radio backend.
#[derive(Debug, Clone, Error)]
pub enum BeaconError {
    /// No Bluetooth adapter is present.
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The adapter is present but powered off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// The process is not allowed to advertise or scan.
    #[error("Bluetooth permission denied: {message}")]
    PermissionDenied {
        /// Backend supplied detail.
        message: String,
    },

    /// Advertising could not be started.
    #[error("Failed to start advertising: {message}")]
    AdvertiseFailed {
        /// Backend supplied detail.
        message: String,
    },

    /// Scanning could not be started.
    #[error("Failed to start scanning: {message}")]
    ScanFailed {
        /// Backend supplied detail.
        message: String,
    },
}

impl BeaconError {
    /// `true` when the failure means the radio cannot be used at all.
    #[must_use]
    pub const fn is_capability_missing(&self) -> bool {
        matches!(
            self,
            Self::AdapterNotFound | Self::AdapterPoweredOff | Self::PermissionDenied { .. }
        )
    }
}

/// Result alias for beacon operations.
pub type BeaconResult<T> = std::result::Result<T, BeaconError>;

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioStatus {
    /// The radio is broadcasting or scanning.
    Active,
    /// The radio capability is missing; nothing was started.
    Unavailable,
}

/// An advertisement as heard by the radio, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Service UUIDs carried by the advertisement.
    pub service_uuids: Vec<Uuid>,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// A nearby peer heard on the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// The peer identity decoded from the advertisement.
    pub peer: Identity,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Encodes identities into advertised names and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadCodec {
    prefix: String,
    max_bytes: usize,
}

impl PayloadCodec {
    /// Create a codec with the given prefix and total byte budget.
    #[must_use]
    pub fn new(prefix: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            prefix: prefix.into(),
            max_bytes,
        }
    }

    /// Bytes left for the identity after the prefix.
    #[must_use]
    pub fn identity_budget(&self) -> usize {
        self.max_bytes.saturating_sub(self.prefix.len())
    }

    /// Encode `identity` as prefix plus identity, truncating the identity
    /// to [`Self::identity_budget`] bytes on a character boundary.
    #[must_use]
    pub fn encode(&self, identity: &Identity) -> String {
        let raw = identity.as_str();
        let mut end = raw.len().min(self.identity_budget());
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}{}", self.prefix, &raw[..end])
    }

    /// Strip the prefix from an advertised name.
    ///
    /// Returns `None` when the prefix is missing or nothing follows it.
    #[must_use]
    pub fn decode<'a>(&self, local_name: &'a str) -> Option<&'a str> {
        local_name
            .strip_prefix(self.prefix.as_str())
            .filter(|rest| !rest.is_empty())
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_PREFIX, MAX_PAYLOAD_BYTES)
    }
}

/// A BLE radio able to advertise one local name and report advertisements.
#[async_trait]
pub trait BeaconRadio: Send + Sync {
    /// Start advertising `local_name` under `service`, replacing any previous
    /// advertisement.
    async fn start_advertising(&self, service: Uuid, local_name: &str) -> BeaconResult<()>;

    /// Stop advertising. Must succeed when not advertising.
    async fn stop_advertising(&self) -> BeaconResult<()>;

    /// Start delivering advertisements for `service` into `sink`.
    ///
    /// Implementations run on radio-stack threads and must not block on the
    /// sink; a full sink drops the advertisement.
    async fn start_scanning(
        &self,
        service: Uuid,
        sink: mpsc::Sender<RawAdvertisement>,
    ) -> BeaconResult<()>;

    /// Stop scanning. Must succeed when not scanning.
    async fn stop_scanning(&self) -> BeaconResult<()>;
}

#[derive(Default)]
struct BeaconState {
    broadcasting: Option<String>,
    decoder: Option<JoinHandle<()>>,
}

/// Owns the advertise/scan lifecycle of one device.
pub struct ProximityBeacon {
    radio: Arc<dyn BeaconRadio>,
    service: Uuid,
    codec: PayloadCodec,
    state: Mutex<BeaconState>,
}

impl ProximityBeacon {
    /// Create a beacon on top of `radio`.
    #[must_use]
    pub fn new(radio: Arc<dyn BeaconRadio>, config: &BeaconConfig) -> Self {
        Self {
            radio,
            service: config.service_uuid,
            codec: config.codec(),
            state: Mutex::new(BeaconState::default()),
        }
    }

    /// The codec used for advertised names.
    #[must_use]
    pub const fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    /// Begin broadcasting `identity`. Restarts the broadcast if one is running.
    ///
    /// # Errors
    ///
    /// Returns a [`BeaconError`] when the radio is present but refuses to
    /// advertise. Missing capability yields `Ok(RadioStatus::Unavailable)`.
    pub async fn start_broadcasting(&self, identity: &Identity) -> BeaconResult<RadioStatus> {
        let mut state = self.state.lock().await;
        if state.broadcasting.take().is_some() {
            debug!("Restarting broadcast");
            self.radio.stop_advertising().await?;
        }

        let local_name = self.codec.encode(identity);
        match self.radio.start_advertising(self.service, &local_name).await {
            Ok(()) => {
                info!(local_name = %local_name, "Broadcasting identity beacon");
                state.broadcasting = Some(local_name);
                Ok(RadioStatus::Active)
            }
            Err(e) if e.is_capability_missing() => {
                warn!(error = %e, "Cannot broadcast, radio unavailable");
                Ok(RadioStatus::Unavailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop broadcasting. No-op when not broadcasting.
    ///
    /// # Errors
    ///
    /// Propagates radio failures other than missing capability.
    pub async fn stop_broadcasting(&self) -> BeaconResult<()> {
        let mut state = self.state.lock().await;
        if state.broadcasting.take().is_none() {
            return Ok(());
        }
        match self.radio.stop_advertising().await {
            Err(e) if !e.is_capability_missing() => Err(e),
            _ => {
                info!("Stopped broadcasting");
                Ok(())
            }
        }
    }

    /// Begin scanning, sending decoded detections into `detections`.
    /// Restarts the scan if one is running.
    ///
    /// Detections are lossy: when `detections` is full the event is dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`BeaconError`] when the radio is present but refuses to
    /// scan. Missing capability yields `Ok(RadioStatus::Unavailable)`.
    pub async fn start_scanning(
        &self,
        detections: mpsc::Sender<Detection>,
    ) -> BeaconResult<RadioStatus> {
        let mut state = self.state.lock().await;
        if let Some(decoder) = state.decoder.take() {
            debug!("Restarting scan");
            self.radio.stop_scanning().await?;
            decoder.abort();
        }

        let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
        match self.radio.start_scanning(self.service, raw_tx).await {
            Ok(()) => {
                let decoder = tokio::spawn(decode_loop(
                    self.service,
                    self.codec.clone(),
                    raw_rx,
                    detections,
                ));
                state.decoder = Some(decoder);
                info!(service = %self.service, "Scanning for identity beacons");
                Ok(RadioStatus::Active)
            }
            Err(e) if e.is_capability_missing() => {
                warn!(error = %e, "Cannot scan, radio unavailable");
                Ok(RadioStatus::Unavailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop scanning. No-op when not scanning.
    ///
    /// # Errors
    ///
    /// Propagates radio failures other than missing capability.
    pub async fn stop_scanning(&self) -> BeaconResult<()> {
        let mut state = self.state.lock().await;
        let Some(decoder) = state.decoder.take() else {
            return Ok(());
        };
        decoder.abort();
        match self.radio.stop_scanning().await {
            Err(e) if !e.is_capability_missing() => Err(e),
            _ => {
                info!("Stopped scanning");
                Ok(())
            }
        }
    }

    /// Whether a broadcast is running.
    pub async fn is_broadcasting(&self) -> bool {
        self.state.lock().await.broadcasting.is_some()
    }

    /// Whether a scan is running.
    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.decoder.is_some()
    }
}

/// Decode one raw advertisement into a detection.
#[must_use]
pub fn decode_advertisement(
    service: Uuid,
    codec: &PayloadCodec,
    advertisement: &RawAdvertisement,
) -> Option<Detection> {
    if !advertisement.service_uuids.contains(&service) {
        return None;
    }
    let name = advertisement.local_name.as_deref()?;
    let remainder = codec.decode(name)?;
    match Identity::parse(remainder) {
        Ok(peer) => Some(Detection {
            peer,
            rssi: advertisement.rssi,
        }),
        Err(e) => {
            trace!(name, error = %e, "Ignoring beacon with unparseable identity");
            None
        }
    }
}

async fn decode_loop(
    service: Uuid,
    codec: PayloadCodec,
    mut raw: mpsc::Receiver<RawAdvertisement>,
    detections: mpsc::Sender<Detection>,
) {
    while let Some(advertisement) = raw.recv().await {
        let Some(detection) = decode_advertisement(service, &codec, &advertisement) else {
            continue;
        };
        match detections.try_send(detection) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                trace!(peer = %dropped.peer, "Detection queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{MockAir, MockRadio};

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[test]
    fn test_encode_prefixes_identity() {
        let codec = PayloadCodec::default();
        assert_eq!(codec.encode(&id("alice")), "BNDalice");
    }

    #[test]
    fn test_encode_truncates_to_payload_budget() {
        let codec = PayloadCodec::default();
        let encoded = codec.encode(&id("abcdefghijklmnopqrstuvwxyz"));
        assert_eq!(encoded.len(), MAX_PAYLOAD_BYTES);
        assert_eq!(encoded, "BNDabcdefghijklmnopq");
    }

    #[test]
    fn test_decode_requires_prefix_and_remainder() {
        let codec = PayloadCodec::default();
        assert_eq!(codec.decode("BNDbob"), Some("bob"));
        assert_eq!(codec.decode("BND"), None);
        assert_eq!(codec.decode("XYZbob"), None);
    }

    #[test]
    fn test_decode_advertisement_filters_service() {
        let codec = PayloadCodec::default();
        let mut advertisement = RawAdvertisement {
            service_uuids: vec![BOND_SERVICE_UUID],
            local_name: Some("BNDbob".into()),
            rssi: -55,
        };
        let detection = decode_advertisement(BOND_SERVICE_UUID, &codec, &advertisement).unwrap();
        assert_eq!(detection.peer, id("bob"));
        assert_eq!(detection.rssi, -55);

        advertisement.service_uuids = vec![Uuid::nil()];
        assert!(decode_advertisement(BOND_SERVICE_UUID, &codec, &advertisement).is_none());
    }

    #[test]
    fn test_capability_classification() {
        assert!(BeaconError::AdapterNotFound.is_capability_missing());
        assert!(BeaconError::PermissionDenied {
            message: "x".into()
        }
        .is_capability_missing());
        assert!(!BeaconError::ScanFailed {
            message: "x".into()
        }
        .is_capability_missing());
    }

    #[tokio::test]
    async fn test_unavailable_radio_is_not_fatal() {
        let beacon = ProximityBeacon::new(
            Arc::new(MockRadio::unavailable()),
            &BeaconConfig::default(),
        );
        let (tx, _rx) = mpsc::channel(4);
        assert_eq!(
            beacon.start_broadcasting(&id("alice")).await.unwrap(),
            RadioStatus::Unavailable
        );
        assert_eq!(
            beacon.start_scanning(tx).await.unwrap(),
            RadioStatus::Unavailable
        );
        assert!(!beacon.is_scanning().await);
        beacon.stop_scanning().await.unwrap();
        beacon.stop_broadcasting().await.unwrap();
    }

    #[tokio::test]
    async fn test_beacons_hear_each_other() {
        let air = MockAir::new();
        let config = BeaconConfig::default();
        let alice = ProximityBeacon::new(Arc::new(MockRadio::new(&air, -40)), &config);
        let bob = ProximityBeacon::new(Arc::new(MockRadio::new(&air, -60)), &config);

        alice.start_broadcasting(&id("alice")).await.unwrap();
        bob.start_broadcasting(&id("bob")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        alice.start_scanning(tx).await.unwrap();

        air.pulse();
        let detection = rx.recv().await.unwrap();
        assert_eq!(detection.peer, id("bob"));
        assert_eq!(detection.rssi, -60);
    }

    #[tokio::test]
    async fn test_restart_and_stop_are_idempotent() {
        let air = MockAir::new();
        let beacon = ProximityBeacon::new(
            Arc::new(MockRadio::new(&air, -40)),
            &BeaconConfig::default(),
        );

        beacon.start_broadcasting(&id("alice")).await.unwrap();
        beacon.start_broadcasting(&id("alice")).await.unwrap();
        assert_eq!(air.advertiser_count(), 1);

        beacon.stop_broadcasting().await.unwrap();
        beacon.stop_broadcasting().await.unwrap();
        assert_eq!(air.advertiser_count(), 0);
        assert!(!beacon.is_broadcasting().await);

        let (tx, _rx) = mpsc::channel(4);
        beacon.start_scanning(tx.clone()).await.unwrap();
        beacon.start_scanning(tx).await.unwrap();
        assert_eq!(air.scanner_count(), 1);
        beacon.stop_scanning().await.unwrap();
        beacon.stop_scanning().await.unwrap();
        assert_eq!(air.scanner_count(), 0);
    }
}
