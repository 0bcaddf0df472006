//! Heartbeat-driven liveness watchdog
//!
//! The controller runs as a helper process for a GUI shell. When the shell
//! stops pinging, the controller reaps its managed instances and shuts
//! down; orphaned model servers must not accumulate across sessions. A
//! controller crash takes the watchdog down with it, so detached servers
//! survive that case.

use crate::lifecycle::LifecycleManager;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::interval;

/// Timestamp of the most recent consumer ping.
pub struct Heartbeat {
    last_ping: Mutex<Instant>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last_ping: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.last_ping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Periodically checks the heartbeat; on timeout stops all managed
/// instances and requests controller shutdown.
pub struct Watchdog {
    manager: Arc<LifecycleManager>,
    heartbeat: Arc<Heartbeat>,
    timeout: Duration,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl Watchdog {
    pub fn new(
        manager: Arc<LifecycleManager>,
        heartbeat: Arc<Heartbeat>,
        timeout: Duration,
        poll_interval: Duration,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            manager,
            heartbeat,
            timeout,
            poll_interval,
            shutdown,
        }
    }

    /// Watch until the heartbeat times out, then reap and request
    /// shutdown. Uses the same stop-all path as the API.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.poll_interval);

        tracing::info!(
            timeout_secs = self.timeout.as_secs_f64(),
            poll_secs = self.poll_interval.as_secs_f64(),
            "Heartbeat watchdog started"
        );

        loop {
            ticker.tick().await;

            let silence = self.heartbeat.elapsed();
            if silence <= self.timeout {
                continue;
            }

            tracing::warn!(
                silence_secs = silence.as_secs_f64(),
                "Heartbeat lost; stopping all managed instances"
            );

            let stopped = self.manager.stop_all(false).await;
            tracing::info!(stopped = stopped, "Watchdog reap complete, shutting down");
            self.shutdown.notify_one();
            return;
        }
    }
}
