//! Rate limiter (C3).
//!
//! An exact sliding-window counter per `(client_id, event kind)`, unlike the
//! approximate count-min-sketch approach used elsewhere in this stack for
//! HTTP traffic: the broker needs an exact `reset_at` to hand back to
//! clients, which an approximate sketch cannot give.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EventKind {
    Offer,
    Answer,
    IceCandidate,
    CrewSignOn,
    CrewSignOff,
    Other,
}

impl EventKind {
    pub fn default_ceiling(&self) -> usize {
        match self {
            EventKind::Offer => 30,
            EventKind::Answer => 30,
            EventKind::IceCandidate => 60,
            EventKind::CrewSignOn => 10,
            EventKind::CrewSignOff => 10,
            EventKind::Other => 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub current: usize,
    pub limit: usize,
    pub reset_at: DateTime<Utc>,
}

/// One bucket per `(client_id, event kind)`. A plain `Mutex<VecDeque<_>>`
/// is fine here: the critical section is a handful of pointer-sized
/// comparisons and never spans an `.await`. Keyed on `ahash` rather than
/// the default `RandomState`: this map is touched on every inbound
/// signaling and crew-event frame, a hot, externally-keyed lookup path.
pub struct RateLimiter {
    window: Duration,
    buckets: DashMap<
        (String, EventKind),
        Mutex<VecDeque<DateTime<Utc>>>,
        ahash::RandomState,
    >,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: DashMap::with_hasher(ahash::RandomState::default()),
        }
    }

    pub fn check(&self, client_id: &str, kind: EventKind) -> RateLimitOutcome {
        let limit = kind.default_ceiling();
        let now = Utc::now();
        let key = (client_id.to_string(), kind);
        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut bucket = entry.lock().expect("rate limit bucket poisoned");

        while let Some(&oldest) = bucket.front() {
            if now - oldest > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        let current = bucket.len();
        let reset_at = bucket
            .front()
            .map(|&oldest| oldest + self.window)
            .unwrap_or(now + self.window);

        if current >= limit {
            return RateLimitOutcome {
                allowed: false,
                current,
                limit,
                reset_at,
            };
        }

        bucket.push_back(now);
        RateLimitOutcome {
            allowed: true,
            current: current + 1,
            limit,
            reset_at: bucket
                .front()
                .map(|&oldest| oldest + self.window)
                .unwrap_or(now + self.window),
        }
    }

    /// Drop every counter belonging to a client; called on disconnect.
    pub fn reset_all(&self, client_id: &str) {
        self.buckets.retain(|(id, _), _| id != client_id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::seconds(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_ceiling_then_blocks() {
        let limiter = RateLimiter::new(Duration::seconds(60));
        for _ in 0..10 {
            assert!(limiter.check("p1", EventKind::CrewSignOn).allowed);
        }
        let blocked = limiter.check("p1", EventKind::CrewSignOn);
        assert!(!blocked.allowed);
        assert_eq!(blocked.current, 10);
        assert_eq!(blocked.limit, 10);
    }

    #[test]
    fn counters_are_independent_per_client_and_kind() {
        let limiter = RateLimiter::new(Duration::seconds(60));
        for _ in 0..10 {
            limiter.check("p1", EventKind::CrewSignOn);
        }
        assert!(limiter.check("p2", EventKind::CrewSignOn).allowed);
        assert!(limiter.check("p1", EventKind::CrewSignOff).allowed);
    }

    #[test]
    fn reset_all_drops_every_kind_for_client() {
        let limiter = RateLimiter::new(Duration::seconds(60));
        for _ in 0..10 {
            limiter.check("p1", EventKind::CrewSignOn);
        }
        limiter.reset_all("p1");
        assert!(limiter.check("p1", EventKind::CrewSignOn).allowed);
    }
}
