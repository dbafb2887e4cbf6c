//! Per-platform request spacing
//!
//! Keeps successive page fetches for one platform at least one interval
//! apart. Platforms are throttled independently. Each caller reserves the
//! next free slot under a short lock and sleeps outside it, so waiters are
//! served in arrival order and one platform's wait never holds up another.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use crate::types::Platform;

#[derive(Debug, Default)]
struct Slot {
    last_call: Option<Instant>,
    waits: u64,
}

/// Rate limiter for platform connector calls
#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Platform-specific minimum spacing
    intervals: Mutex<HashMap<Platform, Duration>>,
    slots: Mutex<HashMap<Platform, Slot>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given intervals
    pub fn new(intervals: HashMap<Platform, Duration>) -> Self {
        Self {
            intervals: Mutex::new(intervals),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Set the interval for `platform` unless one is already configured
    ///
    /// Used to apply a connector's declared default underneath any
    /// configured override.
    pub fn set_default(&self, platform: Platform, interval: Duration) {
        let mut intervals = self.intervals.lock().unwrap_or_else(|e| e.into_inner());
        intervals.entry(platform).or_insert(interval);
    }

    /// Override the interval for `platform`
    pub fn set_interval(&self, platform: Platform, interval: Duration) {
        let mut intervals = self.intervals.lock().unwrap_or_else(|e| e.into_inner());
        intervals.insert(platform, interval);
    }

    /// The interval in force for `platform` (zero when none is set)
    pub fn interval(&self, platform: Platform) -> Duration {
        let intervals = self.intervals.lock().unwrap_or_else(|e| e.into_inner());
        intervals.get(&platform).copied().unwrap_or(Duration::ZERO)
    }

    /// Wait until `platform` may make its next call, then record the call
    pub async fn wait_turn(&self, platform: Platform) {
        let interval = self.interval(platform);
        let now = Instant::now();

        let slot_at = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots.entry(platform).or_default();
            let slot_at = match slot.last_call {
                Some(last) => (last + interval).max(now),
                None => now,
            };
            slot.last_call = Some(slot_at);
            slot.waits += 1;
            slot_at
        };

        if slot_at > now {
            tracing::trace!(
                platform = %platform,
                wait_ms = (slot_at - now).as_millis() as u64,
                "waiting for rate limit slot"
            );
            sleep_until(slot_at).await;
        }
    }

    /// Record a call made without waiting, such as the first fetch of a run
    ///
    /// Later `wait_turn` calls are spaced from this one. Not counted as a
    /// wait.
    pub fn record_call(&self, platform: Platform) {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(platform).or_default();
        if slot.last_call.map_or(true, |last| last < now) {
            slot.last_call = Some(now);
        }
    }

    /// Number of `wait_turn` calls made for `platform`
    pub fn wait_count(&self, platform: Platform) -> u64 {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&platform).map_or(0, |slot| slot.waits)
    }
}
