//! UWB beacon discovery and connection over Bluetooth LE.
//!
//! Beacons advertise over BLE before any UWB session exists, so discovery and
//! the connect handshake go through the first bluetooth adapter. This backend
//! reports beacon disconnects on the ranging feed but produces no positions
//! itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt as _;
use log::{debug, error, info, warn};
use mac_address::MacAddress;
use tokio::sync::{OnceCell, broadcast};

use crate::config::ScanConfig;
use crate::messages::{Beacon, DiscoveredBeacon, RangingEvent, ScanEvent};
use crate::uwb::{RangingStream, ScanStream, SessionContext, UwbManager, broadcast_stream};

/// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
const ESTIMOTE_COMPANY_ID: u16 = 0x015D;

/// Reported on the scan feed when the adapter stops delivering events.
pub const SCAN_ERROR_EVENTS_CLOSED: i32 = 1;

#[derive(Clone, Debug)]
struct BeaconFilter {
    company_id: u16,
    name_prefix: Option<String>,
}

impl BeaconFilter {
    fn matches(&self, properties: &PeripheralProperties) -> bool {
        if properties.manufacturer_data.contains_key(&self.company_id) {
            return true;
        }
        match (&self.name_prefix, &properties.local_name) {
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
struct KnownBeacon {
    id: PeripheralId,
    beacon: Beacon,
    rssi: Option<i16>,
}

fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

pub struct BleManager {
    adapter: OnceCell<Adapter>,
    filter: BeaconFilter,
    scan_interval: Duration,
    known: Arc<Mutex<Vec<KnownBeacon>>>,
    connected: Arc<Mutex<Option<PeripheralId>>>,
    scan_tx: broadcast::Sender<ScanEvent>,
    ranging_tx: broadcast::Sender<RangingEvent>,
}

impl BleManager {
    pub fn new(config: &ScanConfig) -> Self {
        let (scan_tx, _) = broadcast::channel(16);
        let (ranging_tx, _) = broadcast::channel(16);

        BleManager {
            adapter: OnceCell::new(),
            filter: BeaconFilter {
                company_id: config.company_id.unwrap_or(ESTIMOTE_COMPANY_ID),
                name_prefix: config.name_prefix.clone(),
            },
            scan_interval: Duration::from_secs(config.interval_seconds().max(1)),
            known: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(None)),
            scan_tx,
            ranging_tx,
        }
    }

    fn lookup(&self, beacon: &Beacon) -> Option<PeripheralId> {
        let known = self.known.lock().ok()?;
        known
            .iter()
            .find(|k| k.beacon.id == beacon.id)
            .map(|k| k.id.clone())
    }
}

fn snapshot(known: &Mutex<Vec<KnownBeacon>>) -> Vec<DiscoveredBeacon> {
    match known.lock() {
        Ok(known) => known
            .iter()
            .map(|k| DiscoveredBeacon {
                device: Some(k.beacon.clone()),
                rssi: k.rssi,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn remember(
    adapter: &Adapter,
    filter: &BeaconFilter,
    known: &Mutex<Vec<KnownBeacon>>,
    id: PeripheralId,
) -> anyhow::Result<()> {
    let peripheral = adapter.peripheral(&id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(());
    };
    if !filter.matches(&properties) {
        return Ok(());
    }

    let mut beacon = Beacon::new(format_peripheral_id(&id))
        .with_address(MacAddress::new(properties.address.into_inner()));
    beacon.name = properties.local_name.clone();

    let mut known = known
        .lock()
        .map_err(|_| anyhow!("beacon registry poisoned"))?;
    match known.iter_mut().find(|k| k.id == id) {
        Some(existing) => {
            existing.beacon = beacon;
            existing.rssi = properties.rssi;
        }
        None => {
            debug!("Discovered UWB beacon {}", beacon);
            known.push(KnownBeacon {
                id,
                beacon,
                rssi: properties.rssi,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl UwbManager for BleManager {
    async fn init(&self, _session: &SessionContext) -> anyhow::Result<()> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                // get the first bluetooth adapter
                let adapters = manager.adapters().await?;
                let adapter = adapters
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("no bluetooth adapter found"))?;
                info!(
                    "Using bluetooth adapter {}",
                    adapter.adapter_info().await.unwrap_or_default()
                );
                Ok::<_, anyhow::Error>(adapter)
            })
            .await?;
        Ok(())
    }

    async fn start_device_scanning(&self, session: &SessionContext) -> anyhow::Result<()> {
        let Some(adapter) = self.adapter.get().cloned() else {
            let _ = self.scan_tx.send(ScanEvent::ScanNotStarted);
            return Ok(());
        };

        let mut events = adapter.events().await?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .context("starting BLE scan")?;

        let filter = self.filter.clone();
        let known = Arc::clone(&self.known);
        let connected = Arc::clone(&self.connected);
        let scan_tx = self.scan_tx.clone();
        let ranging_tx = self.ranging_tx.clone();
        let session = session.clone();
        let mut ticker = tokio::time::interval(self.scan_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = scan_tx.send(ScanEvent::DeviceList(snapshot(&known)));
                    }
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDiscovered(id))
                        | Some(CentralEvent::DeviceUpdated(id)) => {
                            if let Err(err) = remember(&adapter, &filter, &known, id).await {
                                debug!("Error reading peripheral properties: {:?}", err);
                            }
                        }
                        Some(CentralEvent::DeviceConnected(_)) => {
                            let _ = ranging_tx.send(RangingEvent::Other);
                        }
                        Some(CentralEvent::DeviceDisconnected(id)) => {
                            let was_connected = connected
                                .lock()
                                .map(|c| c.as_ref() == Some(&id))
                                .unwrap_or(false);
                            if was_connected {
                                let message = format!("beacon {} disconnected", format_peripheral_id(&id));
                                let _ = ranging_tx.send(RangingEvent::Error(message));
                            }
                        }
                        Some(_) => {}
                        None => {
                            warn!("No more BLE events");
                            let _ = scan_tx.send(ScanEvent::Error(SCAN_ERROR_EVENTS_CLOSED));
                            break;
                        }
                    }
                }
            }

            if let Err(err) = adapter.stop_scan().await {
                error!("Error stopping BLE scan: {:?}", err);
            }
            debug!("BLE scan stopped");
        });
        Ok(())
    }

    async fn connect(&self, beacon: &Beacon, session: &SessionContext) -> anyhow::Result<()> {
        let adapter = self
            .adapter
            .get()
            .ok_or_else(|| anyhow!("bluetooth adapter not initialised"))?;
        let id = self
            .lookup(beacon)
            .ok_or_else(|| anyhow!("beacon {} was never discovered", beacon))?;
        let peripheral = adapter.peripheral(&id).await?;

        tokio::select! {
            result = peripheral.connect() => result.with_context(|| format!("connecting to {}", beacon))?,
            _ = session.cancelled() => return Err(anyhow!("session ended while connecting to {}", beacon)),
        }

        if let Ok(mut connected) = self.connected.lock() {
            *connected = Some(id);
        }
        Ok(())
    }

    fn uwb_devices(&self) -> ScanStream {
        broadcast_stream(self.scan_tx.subscribe())
    }

    fn ranging_result(&self) -> RangingStream {
        broadcast_stream(self.ranging_tx.subscribe())
    }
}
