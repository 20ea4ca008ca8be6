//! Background keepalive for an open transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use outpost_core::Packet;

use crate::observe::ErrorReporter;
use crate::transport::{send_packet, Writer};

/// Interval between keepalive packets.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Shorter intervals are raised to this.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running keepalive task.
pub(crate) struct KeepAlive {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    /// Send a keepalive packet right away and then every `interval` (at least
    /// [`MIN_KEEPALIVE_INTERVAL`]), until told to stop or a send fails.
    pub(crate) fn spawn(
        writer: Arc<Mutex<Writer>>,
        reporter: Arc<dyn ErrorReporter>,
        gateway: String,
        interval: Duration,
    ) -> Self {
        let interval = interval.max(MIN_KEEPALIVE_INTERVAL);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let packet = Packet::keepalive();
                        if let Err(e) =
                            send_packet(&writer, reporter.as_ref(), &gateway, &packet).await
                        {
                            debug!(gateway = %gateway, "keepalive stopped: {e}");
                            break;
                        }
                    }
                }
            }
        });
        Self {
            stop: Some(stop_tx),
            handle,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and wait for it to exit.
    pub(crate) async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }

    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}
