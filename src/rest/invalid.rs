//! Breaker for the host's aggregate invalid-request ceiling.
//!
//! The host suspends a credential that produces too many 401, 403 or 429
//! responses in a rolling window, whatever the per-route limits say. Once the
//! count reaches the ceiling minus the safety margin, all admission stops
//! until the window rolls over.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

const INVALID_STATUSES: &[u16] = &[401, 403, 429];

#[derive(Debug)]
pub struct InvalidRequestBreaker {
    max: u32,
    interval: Duration,
    safety_margin: u32,
    count: u32,
    window_start: Option<Instant>,
}

impl InvalidRequestBreaker {
    pub fn new(max: u32, interval: Duration, safety_margin: u32) -> Self {
        Self {
            max,
            interval,
            safety_margin,
            count: 0,
            window_start: None,
        }
    }

    /// Whether a response counts against the invalid-request ceiling.
    /// 429s on shared resources are the host's doing and are not counted.
    pub fn counts(status: u16, shared_scope: bool) -> bool {
        INVALID_STATUSES.contains(&status) && !(status == 429 && shared_scope)
    }

    fn roll(&mut self, now: Instant) {
        if let Some(start) = self.window_start {
            if now >= start + self.interval {
                self.window_start = None;
                self.count = 0;
            }
        }
    }

    fn threshold(&self) -> u32 {
        self.max.saturating_sub(self.safety_margin)
    }

    /// Record a response. Returns true if it was counted.
    pub fn record(&mut self, status: u16, shared_scope: bool, now: Instant) -> bool {
        if !Self::counts(status, shared_scope) {
            return false;
        }
        self.roll(now);
        let start = *self.window_start.get_or_insert(now);
        self.count = self.count.saturating_add(1);
        if self.count == self.threshold() {
            warn!(
                count = self.count,
                max = self.max,
                resume_in_ms = (start + self.interval).saturating_duration_since(now).as_millis() as u64,
                "invalid request ceiling reached, halting admission"
            );
        }
        true
    }

    /// Time until admission may resume, or `None` if it is open.
    pub fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        self.roll(now);
        if self.count < self.threshold() {
            return None;
        }
        self.window_start
            .map(|start| (start + self.interval).saturating_duration_since(now))
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
