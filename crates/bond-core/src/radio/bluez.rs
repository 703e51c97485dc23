//! BlueZ radio backend using `bluer`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::{Adapter, AdapterEvent, DiscoveryFilter, DiscoveryTransport, ErrorKind, Session};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::beacon::{BeaconError, BeaconRadio, BeaconResult, RawAdvertisement};

#[derive(Default)]
struct BluezState {
    session: Option<Session>,
    adapter: Option<Adapter>,
    advertisement: Option<AdvertisementHandle>,
    discovery: Option<JoinHandle<()>>,
}

/// Radio backed by the system BlueZ daemon.
#[derive(Default)]
pub struct BluezRadio {
    state: Mutex<BluezState>,
}

impl BluezRadio {
    /// Create a radio. The adapter is resolved lazily on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn map_error(err: &bluer::Error, fallback: fn(String) -> BeaconError) -> BeaconError {
    match err.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => BeaconError::PermissionDenied {
            message: err.to_string(),
        },
        ErrorKind::NotReady => BeaconError::AdapterPoweredOff,
        ErrorKind::NotAvailable | ErrorKind::NotFound => BeaconError::AdapterNotFound,
        _ => fallback(err.to_string()),
    }
}

fn advertise_failed(message: String) -> BeaconError {
    BeaconError::AdvertiseFailed { message }
}

fn scan_failed(message: String) -> BeaconError {
    BeaconError::ScanFailed { message }
}

async fn adapter(state: &mut BluezState) -> BeaconResult<Adapter> {
    if let Some(adapter) = &state.adapter {
        return Ok(adapter.clone());
    }

    let session = Session::new()
        .await
        .map_err(|_| BeaconError::AdapterNotFound)?;
    let adapter = session
        .default_adapter()
        .await
        .map_err(|_| BeaconError::AdapterNotFound)?;
    if !adapter.is_powered().await.unwrap_or(false) {
        return Err(BeaconError::AdapterPoweredOff);
    }

    info!(adapter = adapter.name(), "BlueZ adapter ready");
    state.session = Some(session);
    state.adapter = Some(adapter.clone());
    Ok(adapter)
}

async fn report_device(
    adapter: &Adapter,
    address: bluer::Address,
    sink: &mpsc::Sender<RawAdvertisement>,
) -> bluer::Result<()> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(());
    };
    let service_uuids = device
        .uuids()
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();
    let advertisement = RawAdvertisement {
        service_uuids,
        local_name: device.name().await?,
        rssi,
    };
    if sink.try_send(advertisement).is_err() {
        trace!(%address, "Advertisement queue full, dropping");
    }
    Ok(())
}

#[async_trait]
impl BeaconRadio for BluezRadio {
    async fn start_advertising(&self, service: Uuid, local_name: &str) -> BeaconResult<()> {
        let mut state = self.state.lock().await;
        let adapter = adapter(&mut state).await?;
        state.advertisement = None;

        let advertisement = Advertisement {
            advertisement_type: Type::Peripheral,
            service_uuids: BTreeSet::from([service]),
            local_name: Some(local_name.to_string()),
            discoverable: Some(true),
            ..Default::default()
        };
        let handle = adapter
            .advertise(advertisement)
            .await
            .map_err(|e| map_error(&e, advertise_failed))?;
        state.advertisement = Some(handle);
        Ok(())
    }

    async fn stop_advertising(&self) -> BeaconResult<()> {
        // Dropping the handle unregisters the advertisement.
        self.state.lock().await.advertisement = None;
        Ok(())
    }

    async fn start_scanning(
        &self,
        service: Uuid,
        sink: mpsc::Sender<RawAdvertisement>,
    ) -> BeaconResult<()> {
        let mut state = self.state.lock().await;
        let adapter = adapter(&mut state).await?;
        if let Some(previous) = state.discovery.take() {
            previous.abort();
        }

        adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: std::collections::HashSet::from([service]),
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..Default::default()
            })
            .await
            .map_err(|e| map_error(&e, scan_failed))?;
        let events = adapter
            .discover_devices_with_changes()
            .await
            .map_err(|e| map_error(&e, scan_failed))?;

        let discovery = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    if let Err(e) = report_device(&adapter, address, &sink).await {
                        debug!(%address, error = %e, "Failed to read advertisement");
                    }
                }
            }
        });
        state.discovery = Some(discovery);
        Ok(())
    }

    async fn stop_scanning(&self) -> BeaconResult<()> {
        if let Some(discovery) = self.state.lock().await.discovery.take() {
            discovery.abort();
        }
        Ok(())
    }
}
