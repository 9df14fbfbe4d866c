//! Liveness tracker (C4).
//!
//! Producers announce themselves via periodic heartbeat pings; this tracks
//! the last ping per producer and reports which ones have gone silent past
//! the configured timeout so the controller can cascade the cleanup.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

pub struct LivenessTracker {
    timeout: Duration,
    last_ping: DashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct PingResult {
    pub valid: bool,
    pub timestamp: DateTime<Utc>,
}

impl LivenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_ping: DashMap::new(),
        }
    }

    pub fn record_ping(&self, producer_id: &str) -> PingResult {
        let now = Utc::now();
        self.last_ping.insert(producer_id.to_string(), now);
        PingResult {
            valid: true,
            timestamp: now,
        }
    }

    pub fn remove(&self, producer_id: &str) {
        self.last_ping.remove(producer_id);
    }

    /// Returns the ids of every producer whose last ping is older than the
    /// configured timeout, removing their entries so a subsequent scan
    /// does not re-report them until they register (and ping) again.
    pub fn scan(&self) -> Vec<String> {
        let now = Utc::now();
        let timed_out: Vec<String> = self
            .last_ping
            .iter()
            .filter(|e| now - *e.value() > self.timeout)
            .map(|e| e.key().clone())
            .collect();

        for id in &timed_out {
            self.last_ping.remove(id);
        }
        timed_out
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(Duration::seconds(90))
    }
}
