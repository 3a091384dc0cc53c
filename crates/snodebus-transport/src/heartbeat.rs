use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::traits::ByteSink;

/// Keep-alive payload understood (and ignored) by the bus master.
pub const HEARTBEAT_PAYLOAD: [u8; 3] = [0x01, 0x02, 0x03];

/// Default keep-alive period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Configuration for the keep-alive driver.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Period between keep-alives while connected.
    pub interval: Duration,
    /// Payload handed to the sink on every tick.
    pub payload: Bytes,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            payload: Bytes::from_static(&HEARTBEAT_PAYLOAD),
        }
    }
}

/// Spawn a task that sends `config.payload` into `sink` every
/// `config.interval` while `connected` reads `true`.
///
/// The period restarts on every reconnect. Send failures are logged and
/// otherwise ignored. The task ends when `shutdown` is cancelled or the
/// state channel closes.
pub fn spawn_heartbeat<S>(
    sink: Arc<S>,
    connected: watch::Receiver<bool>,
    config: HeartbeatConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    S: ByteSink + 'static,
{
    tokio::spawn(run(sink, connected, config, shutdown))
}

async fn run<S: ByteSink>(
    sink: Arc<S>,
    mut connected: watch::Receiver<bool>,
    config: HeartbeatConfig,
    shutdown: CancellationToken,
) {
    loop {
        loop {
            let up = *connected.borrow_and_update();
            if up {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = connected.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        debug!(interval = ?config.interval, "heartbeat started");
        let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = connected.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let up = *connected.borrow_and_update();
                    if !up {
                        debug!("heartbeat paused");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match sink.send(&config.payload).await {
                        Ok(()) => trace!("heartbeat sent"),
                        Err(err) => warn!(error = %err, "could not send heartbeat"),
                    }
                }
            }
        }
    }
}
