use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{Delivery, PeripheralRegistry};
use rover_relay_core::Command;

/// Per-connection idle tracker.
///
/// Every polling timeout that finds the connection idle past `idle_timeout`
/// tries to stop the peripheral. Repeats are cheap: the peripheral link drops
/// a stop that matches the last forwarded command, so only the first attempt
/// after a motion command reaches the wire.
#[derive(Debug)]
pub struct IdleWatchdog {
    idle_timeout: Option<Duration>,
    stop: Command,
    last_activity: Instant,
}

impl IdleWatchdog {
    pub fn new(idle_timeout: Option<Duration>, stop: Command, now: Instant) -> Self {
        Self {
            idle_timeout,
            stop,
            last_activity: now,
        }
    }

    /// Notes a line read from the connection.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// True when a stop should be attempted at `now`.
    pub fn should_stop(&self, now: Instant) -> bool {
        match self.idle_timeout {
            Some(limit) => self.idle_for(now) >= limit,
            None => false,
        }
    }

    /// Runs on every polling timeout of the connection `origin`.
    ///
    /// Returns the delivery of the injected stop, or `None` when the
    /// connection has not been idle long enough.
    pub async fn on_poll_timeout(
        &self,
        registry: &PeripheralRegistry,
        origin: Uuid,
        write_timeout: Duration,
        now: Instant,
    ) -> Option<Delivery> {
        if !self.should_stop(now) {
            return None;
        }

        let delivery = registry.forward(&self.stop, origin, write_timeout).await;
        match &delivery {
            Delivery::Forwarded { peripheral } => {
                counter!("rover_relay_watchdog_stops_total", 1);
                info!(
                    peripheral = %peripheral,
                    idle_ms = self.idle_for(now).as_millis() as u64,
                    "idle watchdog stopped peripheral"
                );
            }
            Delivery::Suppressed | Delivery::NoPeripheral | Delivery::OwnConnection => {
                debug!(outcome = delivery.metric_label(), "idle watchdog had nothing to stop");
            }
            Delivery::Failed(err) => {
                counter!(
                    "rover_relay_forward_failures_total",
                    1,
                    "reason" => err.metric_label()
                );
                warn!(error = %err, "idle watchdog could not reach peripheral");
            }
        }
        Some(delivery)
    }
}
