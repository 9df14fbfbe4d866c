//! The connection-oriented signaling and presence broker core.
//!
//! [`BrokerState`] aggregates the five components (presence x2, sessions,
//! rate limiter, liveness tracker) plus the raw per-connection outbound
//! channels needed to deliver messages before/after role registration.
//! There is exactly one instance per process, reached through
//! [`BrokerState::global`], mirroring the global-singleton registries this
//! stack uses elsewhere.

pub mod connection;
pub mod messages;
pub mod scheduler;

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Duration;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::BrokerTuning;
use crate::liveness::LivenessTracker;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::ratelimit::RateLimiter;
use crate::session::SessionRegistry;

use messages::Outbound;

pub struct BrokerState {
    pub producers: PresenceRegistry,
    pub consumers: PresenceRegistry,
    pub sessions: SessionRegistry,
    pub rate_limiter: RateLimiter,
    pub liveness: LivenessTracker,
    pub session_timeout: Duration,
    pub scan_interval: std::time::Duration,
    connections: DashMap<ConnectionHandle, mpsc::UnboundedSender<Outbound>>,
    connection_id_counter: AtomicU64,
}

impl BrokerState {
    fn new(tuning: &BrokerTuning) -> Self {
        Self {
            producers: PresenceRegistry::new(),
            consumers: PresenceRegistry::new(),
            sessions: SessionRegistry::new(),
            rate_limiter: RateLimiter::new(Duration::milliseconds(
                tuning.rate_window_ms as i64,
            )),
            liveness: LivenessTracker::new(Duration::milliseconds(
                tuning.heartbeat_timeout_ms as i64,
            )),
            session_timeout: Duration::milliseconds(
                tuning.session_timeout_ms as i64,
            ),
            scan_interval: std::time::Duration::from_millis(
                tuning.scan_interval_ms,
            ),
            connections: DashMap::new(),
            connection_id_counter: AtomicU64::new(0),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: LazyLock<BrokerState> =
            LazyLock::new(|| BrokerState::new(&BrokerTuning::default_for_global()));
        &INSTANCE
    }

    /// Allocate a fresh connection handle and register its outbound
    /// channel. Every websocket upgrade gets exactly one of these before
    /// any message is dispatched, independent of the client's role.
    pub fn open_connection(
        &self,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> ConnectionHandle {
        let handle = self.connection_id_counter.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(handle, sender);
        handle
    }

    pub fn close_connection(&self, handle: ConnectionHandle) {
        self.connections.remove(&handle);
    }

    pub fn send_to(&self, handle: ConnectionHandle, message: Outbound) {
        if let Some(sender) = self.connections.get(&handle) {
            let _ = sender.send(message);
        }
    }

    /// Fan out to every currently-online consumer.
    pub fn broadcast_to_consumers(&self, message: Outbound) {
        for entry in self.consumers.list_online() {
            self.send_to(entry.connection, message.clone());
        }
    }
}

impl BrokerTuning {
    /// Used only by the process-wide singleton's first access before
    /// [`crate::config::init`] has necessarily run (e.g. in unit tests that
    /// exercise `BrokerState` directly without booting the service).
    fn default_for_global() -> Self {
        crate::config::CONFIG
            .get()
            .map(|c| c.broker.clone())
            .unwrap_or_default()
    }
}
