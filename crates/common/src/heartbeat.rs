//! Ping and liveness timers for one connection.

use std::sync::Weak;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::settings::HeartbeatSettings;

/// Receiver of heartbeat timer events.
pub trait HeartbeatTarget: Send + Sync + 'static {
    /// The connection has been quiet for one interval.
    fn send_ping(&self);

    /// Nothing arrived within interval + timeout of the last re-arm.
    fn heartbeat_timed_out(&self);
}

/// Armed ping and timeout timers. Dropping the value cancels both.
///
/// Re-arming is done by replacing the timer with a freshly armed one.
#[derive(Debug)]
pub struct HeartbeatTimer {
    task: JoinHandle<()>,
}

impl HeartbeatTimer {
    /// Must be called from within a tokio runtime.
    pub fn arm<T: HeartbeatTarget>(settings: HeartbeatSettings, target: Weak<T>) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(settings.interval()).await;
            let Some(strong) = target.upgrade() else {
                return;
            };
            strong.send_ping();
            drop(strong);

            tokio::time::sleep(settings.timeout()).await;
            if let Some(strong) = target.upgrade() {
                debug!(timeout_ms = settings.timeout_ms, "heartbeat window elapsed");
                strong.heartbeat_timed_out();
            }
        });
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
