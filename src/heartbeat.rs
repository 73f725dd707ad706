// src/heartbeat.rs
//! Upstream liveness watchdog.

use crate::types::RoomId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a watchdog task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// No heartbeat within the timeout; the listener was cancelled.
    Stalled,
    /// The listener stopped first.
    Cancelled,
}

/// Cancels a listener that stops receiving heartbeat replies.
///
/// Each [`feed`](Self::feed) restarts the countdown. The watchdog runs on its
/// own task so a blocked read loop cannot keep it from firing.
pub struct HeartbeatWatchdog {
    fed: Arc<Notify>,
    task: JoinHandle<WatchdogOutcome>,
}

impl HeartbeatWatchdog {
    pub fn spawn(room: RoomId, timeout: Duration, listener: CancellationToken) -> Self {
        let fed = Arc::new(Notify::new());
        let task = tokio::spawn(watch(room, timeout, listener, fed.clone()));
        Self { fed, task }
    }

    pub fn feed(&self) {
        self.fed.notify_one();
    }

    pub async fn outcome(self) -> WatchdogOutcome {
        self.task.await.unwrap_or(WatchdogOutcome::Cancelled)
    }
}

async fn watch(
    room: RoomId,
    timeout: Duration,
    listener: CancellationToken,
    fed: Arc<Notify>,
) -> WatchdogOutcome {
    loop {
        tokio::select! {
            _ = listener.cancelled() => return WatchdogOutcome::Cancelled,
            _ = fed.notified() => {
                debug!("[HEARTBEAT] Room {} rearmed", room);
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    "💔 [HEARTBEAT] Room {} got no heartbeat for {:?}, forcing the listener down",
                    room, timeout
                );
                listener.cancel();
                return WatchdogOutcome::Stalled;
            }
        }
    }
}
