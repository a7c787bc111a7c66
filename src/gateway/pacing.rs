//! Single-slot leaky bucket used to space identifies within one bucket.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Permits one admission per `interval`.
///
/// The first caller passes immediately. Waiters are served in arrival order
/// because the tokio mutex is fair, so a bucket's shards keep their queue order.
#[derive(Debug)]
pub struct PacingGate {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl PacingGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the gate allows another admission and claim it.
    pub async fn acquire(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(at) = *next_slot {
            sleep_until(at).await;
        }
        *next_slot = Some(Instant::now() + self.interval);
    }

    /// Time until the next admission would be allowed, zero if open.
    pub fn remaining(&self) -> Duration {
        match self.next_slot.try_lock() {
            Ok(slot) => slot
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or_default(),
            // Someone is waiting on the gate right now.
            Err(_) => self.interval,
        }
    }
}
