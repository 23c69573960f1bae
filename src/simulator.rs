//! A deterministic stand-in for real UWB hardware.
//!
//! Reports every configured beacon on each scan tick and, once connected,
//! emits that beacon's configured distance at the ranging interval.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::broadcast;

use crate::config::{ScanConfig, SimulationConfig};
use crate::messages::{Beacon, DiscoveredBeacon, RangingEvent, RangingPosition, ScanEvent};
use crate::uwb::{RangingStream, ScanStream, SessionContext, UwbManager, broadcast_stream};

#[derive(Clone, Debug)]
struct SimulatedBeacon {
    beacon: Beacon,
    distance: Option<f64>,
}

pub struct SimulatedManager {
    beacons: Vec<SimulatedBeacon>,
    scan_interval: Duration,
    ranging_interval: Duration,
    scan_tx: broadcast::Sender<ScanEvent>,
    ranging_tx: broadcast::Sender<RangingEvent>,
    initialized: AtomicBool,
    remaining_failures: AtomicU32,
    connected: Mutex<Option<Beacon>>,
}

impl SimulatedManager {
    pub fn new(scan: &ScanConfig, simulation: &SimulationConfig) -> Self {
        let beacons = simulation
            .beacons
            .iter()
            .map(|b| {
                let mut beacon = Beacon::new(b.address.to_string()).with_address(b.address);
                if let Some(name) = &b.name {
                    beacon = beacon.with_name(name.clone());
                }
                SimulatedBeacon {
                    beacon,
                    distance: b.distance_meters,
                }
            })
            .collect();

        let (scan_tx, _) = broadcast::channel(16);
        let (ranging_tx, _) = broadcast::channel(64);

        SimulatedManager {
            beacons,
            scan_interval: Duration::from_secs(scan.interval_seconds().max(1)),
            ranging_interval: Duration::from_millis(simulation.ranging_interval_ms.unwrap_or(500).max(1)),
            scan_tx,
            ranging_tx,
            initialized: AtomicBool::new(false),
            remaining_failures: AtomicU32::new(simulation.fail_connects.unwrap_or(0)),
            connected: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn connected(&self) -> Option<Beacon> {
        self.connected.lock().ok().and_then(|c| c.clone())
    }

    fn device_list(&self) -> ScanEvent {
        ScanEvent::DeviceList(
            self.beacons
                .iter()
                .map(|b| DiscoveredBeacon::from(b.beacon.clone()))
                .collect(),
        )
    }
}

#[async_trait]
impl UwbManager for SimulatedManager {
    async fn init(&self, session: &SessionContext) -> anyhow::Result<()> {
        debug!("Simulated UWB manager initialised for {}", session.name());
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_device_scanning(&self, session: &SessionContext) -> anyhow::Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            let _ = self.scan_tx.send(ScanEvent::ScanNotStarted);
            return Ok(());
        }

        info!("Simulating {} UWB beacons", self.beacons.len());
        let tx = self.scan_tx.clone();
        let devices = self.device_list();
        let session = session.clone();
        let mut interval = tokio::time::interval(self.scan_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancelled() => break,
                    _ = interval.tick() => {
                        // No subscribers is not an error, the session may just be starting.
                        let _ = tx.send(devices.clone());
                    }
                }
            }
            debug!("Simulated scan stopped");
        });
        Ok(())
    }

    async fn connect(&self, beacon: &Beacon, session: &SessionContext) -> anyhow::Result<()> {
        if session.is_cancelled() {
            return Err(anyhow!("session {} already ended", session.name()));
        }
        let target = self
            .beacons
            .iter()
            .find(|b| b.beacon.id == beacon.id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown beacon {}", beacon))?;

        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            let _ = self
                .ranging_tx
                .send(RangingEvent::Error(format!("connection to {} refused", beacon)));
            return Err(anyhow!("simulated connect failure for {}", beacon));
        }

        if let Ok(mut connected) = self.connected.lock() {
            *connected = Some(target.beacon.clone());
        }

        let tx = self.ranging_tx.clone();
        let session = session.clone();
        let mut interval = tokio::time::interval(self.ranging_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancelled() => break,
                    _ = interval.tick() => {
                        let position = RangingPosition::distance_only(target.beacon.clone(), target.distance);
                        let _ = tx.send(RangingEvent::Position(position));
                    }
                }
            }
            debug!("Simulated ranging with {} stopped", target.beacon);
        });
        Ok(())
    }

    fn uwb_devices(&self) -> ScanStream {
        broadcast_stream(self.scan_tx.subscribe())
    }

    fn ranging_result(&self) -> RangingStream {
        broadcast_stream(self.ranging_tx.subscribe())
    }
}
