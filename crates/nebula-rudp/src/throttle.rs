//! Rate control for outgoing traffic.
//!
//! Two independent mechanisms:
//! - [`PacketThrottle`] tracks round-trip times and decides what fraction of
//!   unreliable packets is sent (`value / PACKET_THROTTLE_SCALE`).
//! - [`BandwidthWindow`] caps the bytes sent to one peer per one-second
//!   window.

use std::time::Duration;

/// Denominator of the packet throttle. A throttle equal to the scale sends
/// every unreliable packet.
pub const PACKET_THROTTLE_SCALE: u32 = 32;

/// Length of one bandwidth window in milliseconds.
pub(crate) const BANDWIDTH_WINDOW_MS: u32 = 1000;

/// Packet throttle tuning, exchanged with the remote when configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// How often the RTT baseline the throttle compares against is refreshed.
    pub interval: Duration,
    /// Throttle increase when a sample is at or below the baseline.
    pub acceleration: u32,
    /// Throttle decrease when a sample exceeds the baseline by more than
    /// twice its variance.
    pub deceleration: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            acceleration: 2,
            deceleration: 2,
        }
    }
}

impl ThrottleConfig {
    pub(crate) fn interval_ms(&self) -> u32 {
        u32::try_from(self.interval.as_millis()).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PacketThrottle {
    config: ThrottleConfig,
    value: u32,
    epoch: u32,
    last_rtt: u32,
    last_variance: u32,
}

impl PacketThrottle {
    pub(crate) fn new(config: ThrottleConfig, initial_rtt: u32) -> Self {
        Self {
            config,
            value: PACKET_THROTTLE_SCALE,
            epoch: 0,
            last_rtt: initial_rtt,
            last_variance: 0,
        }
    }

    pub(crate) fn config(&self) -> ThrottleConfig {
        self.config
    }

    pub(crate) fn configure(&mut self, config: ThrottleConfig) {
        self.config = config;
    }

    pub(crate) fn value(&self) -> u32 {
        self.value
    }

    /// Adjust the throttle for one RTT sample.
    pub(crate) fn observe(&mut self, sample: u32) {
        if self.last_rtt <= self.last_variance {
            self.value = PACKET_THROTTLE_SCALE;
        } else if sample <= self.last_rtt {
            self.value = (self.value + self.config.acceleration).min(PACKET_THROTTLE_SCALE);
        } else if sample > self.last_rtt.saturating_add(self.last_variance.saturating_mul(2)) {
            self.value = self.value.saturating_sub(self.config.deceleration);
        }
    }

    /// Refresh the baseline once per interval.
    pub(crate) fn advance(&mut self, now: u32, rtt: u32, variance: u32) {
        if now.wrapping_sub(self.epoch) >= self.config.interval_ms() {
            self.epoch = now;
            self.last_rtt = rtt;
            self.last_variance = variance;
        }
    }

    /// Whether an unreliable packet passes, given a roll in
    /// `0..PACKET_THROTTLE_SCALE`.
    pub(crate) fn admits(&self, roll: u32) -> bool {
        roll < self.value
    }
}

/// Byte budget over a one-second window. A limit of 0 means unlimited.
#[derive(Debug, Clone, Default)]
pub(crate) struct BandwidthWindow {
    limit: u32,
    used: u32,
    start: u32,
}

impl BandwidthWindow {
    pub(crate) fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    /// Charge `bytes` against the current window. The first send of a window
    /// always passes, so a command larger than the limit cannot stall.
    pub(crate) fn try_consume(&mut self, now: u32, bytes: usize) -> bool {
        if now.wrapping_sub(self.start) >= BANDWIDTH_WINDOW_MS {
            self.start = now;
            self.used = 0;
        }
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);
        if self.limit != 0 && self.used != 0 && self.used.saturating_add(bytes) > self.limit {
            return false;
        }
        self.used = self.used.saturating_add(bytes);
        true
    }
}
