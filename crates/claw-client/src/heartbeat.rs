//! Heartbeat and tick watchdog.
//!
//! The gateway advertises a tick interval in its hello policy. The client
//! sends a `heartbeat` event at that interval and treats the connection as
//! lost when nothing at all arrives for two intervals.

use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

/// What the connection loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Time to send a heartbeat.
    Heartbeat,
    /// The gateway has been silent too long.
    Expired {
        /// Time since the last inbound frame.
        silent_for: Duration,
    },
}

/// Heartbeat timer plus inbound-silence watchdog for one connection.
#[derive(Debug)]
pub struct Keepalive {
    heartbeat: Interval,
    tick_interval: Duration,
    last_inbound: Instant,
}

impl Keepalive {
    /// Number of tick intervals of silence tolerated.
    pub const MISSED_TICKS: u32 = 2;

    /// Create a keepalive for the given tick interval.
    ///
    /// Returns `None` for a zero interval, which disables both heartbeats and
    /// the watchdog.
    #[must_use]
    pub fn new(tick_interval: Duration) -> Option<Self> {
        if tick_interval.is_zero() {
            return None;
        }
        let now = Instant::now();
        let mut heartbeat = interval_at(now + tick_interval, tick_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(Self {
            heartbeat,
            tick_interval,
            last_inbound: now,
        })
    }

    /// Note that a frame arrived.
    pub fn record_inbound(&mut self) {
        self.last_inbound = Instant::now();
    }

    /// When the watchdog fires if nothing else arrives.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_inbound + self.tick_interval * Self::MISSED_TICKS
    }

    /// Wait for the next heartbeat or for the watchdog. Cancel-safe.
    pub async fn next(&mut self) -> KeepaliveEvent {
        let deadline = self.deadline();
        tokio::select! {
            biased;
            () = sleep_until(deadline) => KeepaliveEvent::Expired {
                silent_for: self.last_inbound.elapsed(),
            },
            _ = self.heartbeat.tick() => KeepaliveEvent::Heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_disables_keepalive() {
        assert!(Keepalive::new(Duration::ZERO).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_at_interval() {
        let mut keepalive = Keepalive::new(Duration::from_millis(100))
            .unwrap_or_else(|| panic!("non-zero interval"));
        let start = Instant::now();

        assert_eq!(keepalive.next().await, KeepaliveEvent::Heartbeat);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_after_two_silent_ticks() {
        let mut keepalive = Keepalive::new(Duration::from_millis(100))
            .unwrap_or_else(|| panic!("non-zero interval"));

        assert_eq!(keepalive.next().await, KeepaliveEvent::Heartbeat);
        assert_eq!(
            keepalive.next().await,
            KeepaliveEvent::Expired {
                silent_for: Duration::from_millis(200)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_keep_connection_alive() {
        let mut keepalive = Keepalive::new(Duration::from_millis(100))
            .unwrap_or_else(|| panic!("non-zero interval"));

        for _ in 0..5 {
            assert_eq!(keepalive.next().await, KeepaliveEvent::Heartbeat);
            keepalive.record_inbound();
        }
        assert_eq!(
            keepalive.deadline(),
            Instant::now() + Duration::from_millis(200)
        );
    }
}
