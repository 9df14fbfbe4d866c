//! Session registry (C2).
//!
//! Enforces the core exclusivity invariant: at most one active monitoring
//! session per producer. Keyed by producer id rather than by any live
//! connection handle, so cleanup after a disconnect is always a finite set
//! of map operations, never a graph walk.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as DashEntry;
use serde::Serialize;
use thiserror::Error;

use crate::presence::ConnectionHandle;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub producer_id: String,
    pub consumer_id: String,
    pub consumer_connection: ConnectionHandle,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("an active session already exists for this producer")]
    SessionExists { existing_consumer_id: String },
}

pub struct SessionRegistry {
    by_producer: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            by_producer: DashMap::new(),
        }
    }

    pub fn create(
        &self,
        producer_id: &str,
        consumer_id: &str,
        consumer_connection: ConnectionHandle,
    ) -> Result<Session, SessionError> {
        match self.by_producer.entry(producer_id.to_string()) {
            DashEntry::Occupied(existing) => {
                Err(SessionError::SessionExists {
                    existing_consumer_id: existing.get().consumer_id.clone(),
                })
            }
            DashEntry::Vacant(slot) => {
                let now = Utc::now();
                let session = Session {
                    producer_id: producer_id.to_string(),
                    consumer_id: consumer_id.to_string(),
                    consumer_connection,
                    started_at: now,
                    last_activity_at: now,
                };
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn end(&self, producer_id: &str) -> Option<Session> {
        self.by_producer.remove(producer_id).map(|(_, s)| s)
    }

    pub fn end_by_consumer_connection(
        &self,
        consumer_connection: ConnectionHandle,
    ) -> Vec<Session> {
        let producer_ids: Vec<String> = self
            .by_producer
            .iter()
            .filter(|e| e.consumer_connection == consumer_connection)
            .map(|e| e.producer_id.clone())
            .collect();

        producer_ids
            .into_iter()
            .filter_map(|pid| self.end(&pid))
            .collect()
    }

    pub fn get(&self, producer_id: &str) -> Option<Session> {
        self.by_producer.get(producer_id).map(|e| e.clone())
    }

    pub fn has_active(&self, producer_id: &str) -> bool {
        self.by_producer.contains_key(producer_id)
    }

    pub fn validate_ownership(
        &self,
        producer_id: &str,
        consumer_connection: ConnectionHandle,
    ) -> bool {
        self.by_producer
            .get(producer_id)
            .map(|s| s.consumer_connection == consumer_connection)
            .unwrap_or(false)
    }

    pub fn refresh_activity(&self, producer_id: &str) -> bool {
        if let Some(mut session) = self.by_producer.get_mut(producer_id) {
            session.last_activity_at = Utc::now();
            true
        } else {
            false
        }
    }

    pub fn scan_timed_out(
        &self,
        threshold: chrono::Duration,
    ) -> Vec<Session> {
        let now = Utc::now();
        self.by_producer
            .iter()
            .filter(|e| now - e.last_activity_at > threshold)
            .map(|e| e.clone())
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
