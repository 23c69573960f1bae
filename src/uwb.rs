//! The contract a UWB backend has to fulfil for the orchestrator, and the
//! session scope every subscription and connect attempt is bound to.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt as _};
use log::warn;
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::messages::{Beacon, RangingEvent, ScanEvent};

pub type ScanStream = BoxStream<'static, ScanEvent>;
pub type RangingStream = BoxStream<'static, RangingEvent>;

/// Lifetime of one monitoring session. Cancelling it ends the event streams'
/// consumers, background backend tasks and any in-flight connect.
#[derive(Clone, Debug)]
pub struct SessionContext {
    name: String,
    cancel: CancellationToken,
}

impl SessionContext {
    pub fn new(name: impl Into<String>) -> Self {
        SessionContext {
            name: name.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

#[async_trait]
pub trait UwbManager: Send + Sync + 'static {
    /// One-time setup, must precede every other call.
    async fn init(&self, session: &SessionContext) -> anyhow::Result<()>;

    /// Begin emitting [`ScanEvent`]s on [`UwbManager::uwb_devices`].
    async fn start_device_scanning(&self, session: &SessionContext) -> anyhow::Result<()>;

    /// Connect to a beacon. Resolves once the connection is established or has failed.
    async fn connect(&self, beacon: &Beacon, session: &SessionContext) -> anyhow::Result<()>;

    fn uwb_devices(&self) -> ScanStream;

    fn ranging_result(&self) -> RangingStream;
}

/// Turn a broadcast subscription into a stream, skipping over lagged messages.
pub fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
