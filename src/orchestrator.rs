use std::sync::Arc;

use futures::StreamExt as _;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;

use crate::connection::{ConnectionGuard, ConnectionState};
use crate::messages::{Beacon, RangingEvent, RangingPosition, ScanEvent};
use crate::uwb::{SessionContext, UwbManager};

/// Somewhere ranging positions are forwarded to besides the log.
pub trait RangingSink: Send + Sync {
    fn publish(&self, position: &RangingPosition) -> anyhow::Result<()>;
}

/// Reacts to the scan and ranging feeds of a [`UwbManager`]: logs them and
/// connects to the first beacon it sees.
pub struct Orchestrator<M: UwbManager> {
    manager: Arc<M>,
    guard: Arc<ConnectionGuard>,
    sink: Option<Arc<dyn RangingSink>>,
    connects: JoinSet<()>,
}

fn found_message(count: usize) -> String {
    format!("Found {} UWB Beacons", count)
}

impl<M: UwbManager> Orchestrator<M> {
    pub fn new(manager: Arc<M>, max_attempts: u32) -> Self {
        Orchestrator {
            manager,
            guard: Arc::new(ConnectionGuard::new(max_attempts)),
            sink: None,
            connects: JoinSet::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RangingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.guard.state()
    }

    /// Handle one scan result. Returns the beacon a connect was dispatched to, if any.
    pub fn on_scan_event(&mut self, event: ScanEvent, session: &SessionContext) -> Option<Beacon> {
        match event {
            ScanEvent::DeviceList(devices) => {
                info!("{}", found_message(devices.len()));

                let first = devices.into_iter().next()?;
                let beacon = first.device?;
                let attempt = self.guard.try_begin()?;
                info!(
                    "Connecting to {} (rssi {:?}, attempt {}/{})",
                    beacon,
                    first.rssi,
                    attempt,
                    self.guard.max_attempts()
                );
                self.dispatch_connect(beacon.clone(), session.clone());
                Some(beacon)
            }
            ScanEvent::Error(code) => {
                error!("Error: {}", code);
                None
            }
            ScanEvent::ScanNotStarted => {
                warn!("Error: scan not started");
                None
            }
        }
    }

    pub fn on_ranging_event(&self, event: RangingEvent) {
        match event {
            RangingEvent::Position(position) => {
                info!("{}", position.distance_string());
                if let Some(sink) = &self.sink {
                    if let Err(err) = sink.publish(&position) {
                        error!("Error publishing ranging result: {:?}", err);
                    }
                }
            }
            RangingEvent::Error(message) => {
                error!("Error: {}", message);
            }
            RangingEvent::Other => {}
        }
    }

    fn dispatch_connect(&mut self, beacon: Beacon, session: SessionContext) {
        let manager = Arc::clone(&self.manager);
        let guard = Arc::clone(&self.guard);

        self.connects.spawn(async move {
            match manager.connect(&beacon, &session).await {
                Ok(()) => {
                    guard.finish(true);
                    info!("Connected to {}", beacon);
                }
                Err(err) => {
                    guard.finish(false);
                    error!("Error connecting to {}: {:?}", beacon, err);
                }
            }
        });
    }

    /// Subscribe to both feeds, start scanning and handle events until the
    /// session is cancelled. In-flight connects are aborted on the way out.
    pub async fn run(mut self, session: SessionContext) -> anyhow::Result<()> {
        self.manager.init(&session).await?;

        let mut scans = self.manager.uwb_devices().fuse();
        let mut ranging = self.manager.ranging_result().fuse();

        self.manager.start_device_scanning(&session).await?;
        info!("Scanning for UWB beacons in session {}", session.name());

        loop {
            tokio::select! {
                _ = session.cancelled() => {
                    debug!("Session {} ended", session.name());
                    break;
                }
                Some(event) = scans.next() => {
                    self.on_scan_event(event, &session);
                }
                Some(event) = ranging.next() => {
                    self.on_ranging_event(event);
                }
                Some(joined) = self.connects.join_next() => {
                    if let Err(err) = joined {
                        if !err.is_cancelled() {
                            error!("Connect task failed: {:?}", err);
                        }
                    }
                }
            }
        }

        self.connects.shutdown().await;
        info!("Exiting orchestrator event loop ({:?})", self.state());
        Ok(())
    }

    #[cfg(test)]
    async fn wait_for_connects(&mut self) {
        while self.connects.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::messages::DiscoveredBeacon;
    use crate::uwb::{RangingStream, ScanStream, broadcast_stream};

    struct RecordingManager {
        connects: Mutex<Vec<Beacon>>,
        failures: AtomicU32,
        connect_delay: Option<Duration>,
        scan_tx: broadcast::Sender<ScanEvent>,
        ranging_tx: broadcast::Sender<RangingEvent>,
    }

    impl RecordingManager {
        fn new() -> Self {
            RecordingManager {
                connects: Mutex::new(Vec::new()),
                failures: AtomicU32::new(0),
                connect_delay: None,
                scan_tx: broadcast::channel(16).0,
                ranging_tx: broadcast::channel(16).0,
            }
        }

        fn failing(failures: u32) -> Self {
            let manager = Self::new();
            manager.failures.store(failures, Ordering::SeqCst);
            manager
        }

        fn connected_to(&self) -> Vec<Beacon> {
            self.connects.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UwbManager for RecordingManager {
        async fn init(&self, _session: &SessionContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn start_device_scanning(&self, _session: &SessionContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn connect(&self, beacon: &Beacon, _session: &SessionContext) -> anyhow::Result<()> {
            self.connects.lock().unwrap().push(beacon.clone());
            if let Some(delay) = self.connect_delay {
                tokio::time::sleep(delay).await;
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("radio busy");
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

    struct RecordingSink {
        published: Mutex<Vec<RangingPosition>>,
    }

    impl RangingSink for RecordingSink {
        fn publish(&self, position: &RangingPosition) -> anyhow::Result<()> {
            self.published.lock().unwrap().push(position.clone());
            Ok(())
        }
    }

    fn device_list(ids: &[&str]) -> ScanEvent {
        ScanEvent::DeviceList(
            ids.iter()
                .map(|id| DiscoveredBeacon::from(Beacon::new(*id)))
                .collect(),
        )
    }

    #[test]
    fn test_found_message() {
        assert_eq!(found_message(0), "Found 0 UWB Beacons");
        assert_eq!(found_message(2), "Found 2 UWB Beacons");
    }

    #[tokio::test]
    async fn test_empty_list_does_not_connect() {
        let manager = Arc::new(RecordingManager::new());
        let mut orchestrator = Orchestrator::new(Arc::clone(&manager), 1);
        let session = SessionContext::new("test");

        assert_eq!(orchestrator.on_scan_event(device_list(&[]), &session), None);
        orchestrator.wait_for_connects().await;

        assert!(manager.connected_to().is_empty());
        assert_eq!(orchestrator.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_connects_to_first_beacon() {
        let manager = Arc::new(RecordingManager::new());
        let mut orchestrator = Orchestrator::new(Arc::clone(&manager), 1);
        let session = SessionContext::new("test");

        let dispatched = orchestrator.on_scan_event(device_list(&["beacon-a", "beacon-b"]), &session);
        assert_eq!(dispatched, Some(Beacon::new("beacon-a")));
        assert_eq!(orchestrator.state(), ConnectionState::Connecting);

        orchestrator.wait_for_connects().await;
        assert_eq!(manager.connected_to(), vec![Beacon::new("beacon-a")]);
        assert_eq!(orchestrator.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_second_list_does_not_reconnect() {
        let manager = Arc::new(RecordingManager::new());
        let mut orchestrator = Orchestrator::new(Arc::clone(&manager), 1);
        let session = SessionContext::new("test");

        orchestrator.on_scan_event(device_list(&["beacon-a"]), &session);
        // Still in flight: the guard is already Connecting.
        assert_eq!(orchestrator.on_scan_event(device_list(&["beacon-c"]), &session), None);
        orchestrator.wait_for_connects().await;
        assert_eq!(orchestrator.on_scan_event(device_list(&["beacon-c"]), &session), None);
        orchestrator.wait_for_connects().await;

        assert_eq!(manager.connected_to(), vec![Beacon::new("beacon-a")]);
    }

    #[tokio::test]
    async fn test_missing_handle_does_not_connect() {
        let manager = Arc::new(RecordingManager::new());
        let mut orchestrator = Orchestrator::new(Arc::clone(&manager), 1);
        let session = SessionContext::new("test");

        let event = ScanEvent::DeviceList(vec![
            DiscoveredBeacon {
                device: None,
                rssi: Some(-60),
            },
            Beacon::new("beacon-b").into(),
        ]);
        assert_eq!(orchestrator.on_scan_event(event, &session), None);
        assert_eq!(orchestrator.state(), ConnectionState::NotConnected);

        // The session can still connect once a usable handle shows up.
        assert!(orchestrator.on_scan_event(device_list(&["beacon-b"]), &session).is_some());
        orchestrator.wait_for_connects().await;
        assert_eq!(manager.connected_to(), vec![Beacon::new("beacon-b")]);
    }

    #[tokio::test]
    async fn test_failed_connect_is_terminal_by_default() {
        let manager = Arc::new(RecordingManager::failing(1));
        let mut orchestrator = Orchestrator::new(Arc::clone(&manager), 1);
        let session = SessionContext::new("test");

        orchestrator.on_scan_event(device_list(&["beacon-a"]), &session);
        orchestrator.wait_for_connects().await;
        assert_eq!(orchestrator.state(), ConnectionState::Failed);

        assert_eq!(orchestrator.on_scan_event(device_list(&["beacon-a"]), &session), None);
        assert_eq!(manager.connected_to().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_retries_within_budget() {
        let manager = Arc::new(RecordingManager::failing(5));
        let mut orchestrator = Orchestrator::new(Arc::clone(&manager), 2);
        let session = SessionContext::new("test");

        for _ in 0..4 {
            orchestrator.on_scan_event(device_list(&["beacon-a"]), &session);
            orchestrator.wait_for_connects().await;
        }

        assert_eq!(manager.connected_to().len(), 2);
        assert_eq!(orchestrator.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_scan_errors_leave_state_untouched() {
        let manager = Arc::new(RecordingManager::new());
        let mut orchestrator = Orchestrator::new(Arc::clone(&manager), 1);
        let session = SessionContext::new("test");

        assert_eq!(orchestrator.on_scan_event(ScanEvent::Error(3), &session), None);
        assert_eq!(orchestrator.on_scan_event(ScanEvent::ScanNotStarted, &session), None);
        assert_eq!(orchestrator.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_positions_forwarded_to_sink() {
        let manager = Arc::new(RecordingManager::new());
        let sink = Arc::new(RecordingSink {
            published: Mutex::new(Vec::new()),
        });
        let orchestrator = Orchestrator::new(manager, 1).with_sink(sink.clone());

        let beacon = Beacon::new("beacon-a");
        orchestrator.on_ranging_event(RangingEvent::Position(RangingPosition::distance_only(
            beacon.clone(),
            Some(2.5),
        )));
        orchestrator.on_ranging_event(RangingEvent::Error("timeout".to_string()));
        orchestrator.on_ranging_event(RangingEvent::Other);
        orchestrator.on_ranging_event(RangingEvent::Position(RangingPosition::distance_only(
            beacon, None,
        )));

        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].distance_string(), "2.5");
        assert_eq!(published[1].distance_string(), "null");
    }

    #[tokio::test]
    async fn test_run_handles_both_feeds_until_cancelled() {
        let manager = Arc::new(RecordingManager::new());
        let sink = Arc::new(RecordingSink {
            published: Mutex::new(Vec::new()),
        });
        let orchestrator = Orchestrator::new(Arc::clone(&manager), 1).with_sink(sink.clone());
        let session = SessionContext::new("test");

        let handle = tokio::spawn(orchestrator.run(session.clone()));
        // Wait for both subscriptions to exist before emitting.
        while manager.scan_tx.receiver_count() == 0 || manager.ranging_tx.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }

        manager.scan_tx.send(device_list(&["beacon-a"])).unwrap();
        manager
            .ranging_tx
            .send(RangingEvent::Error("timeout".to_string()))
            .unwrap();
        manager
            .ranging_tx
            .send(RangingEvent::Position(RangingPosition::distance_only(
                Beacon::new("beacon-a"),
                Some(1.0),
            )))
            .unwrap();
        manager.scan_tx.send(device_list(&["beacon-c"])).unwrap();

        while sink.published.lock().unwrap().is_empty() || manager.connected_to().is_empty() {
            tokio::task::yield_now().await;
        }
        session.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(manager.connected_to(), vec![Beacon::new("beacon-a")]);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_aborts_inflight_connect_on_cancel() {
        let mut manager = RecordingManager::new();
        manager.connect_delay = Some(Duration::from_secs(3600));
        let manager = Arc::new(manager);
        let orchestrator = Orchestrator::new(Arc::clone(&manager), 1);
        let guard = Arc::clone(&orchestrator.guard);
        let session = SessionContext::new("test");

        let handle = tokio::spawn(orchestrator.run(session.clone()));
        while manager.scan_tx.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        manager.scan_tx.send(device_list(&["beacon-a"])).unwrap();
        while manager.connected_to().is_empty() {
            tokio::task::yield_now().await;
        }

        session.cancel();
        handle.await.unwrap().unwrap();

        // The connect never completed, so the guard never left Connecting.
        assert_eq!(guard.state(), ConnectionState::Connecting);
    }
}
