//! Presence registry (C1).
//!
//! Tracks which clients of a single role are currently online, indexed both
//! by client id and by the transport connection handle that carries them.
//! Producers and consumers get one instance each; the registry itself is
//! role-agnostic.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

pub type ConnectionHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    pub client_id: String,
    pub connection: ConnectionHandle,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: PresenceStatus,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PresenceError {
    #[error("client id must not be empty")]
    EmptyClientId,
}

/// Concurrent, role-agnostic registry of online clients.
///
/// Both indices are kept consistent under concurrent access: a `register`
/// for a `client_id` that already has an entry replaces it and drops the
/// stale `by_connection` mapping for the old connection, last-writer-wins.
pub struct PresenceRegistry {
    by_id: DashMap<String, PresenceEntry>,
    by_connection: DashMap<ConnectionHandle, String>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        client_id: &str,
        connection: ConnectionHandle,
    ) -> Result<PresenceEntry, PresenceError> {
        if client_id.is_empty() {
            return Err(PresenceError::EmptyClientId);
        }
        let now = Utc::now();
        let entry = PresenceEntry {
            client_id: client_id.to_string(),
            connection,
            registered_at: now,
            last_seen_at: now,
            status: PresenceStatus::Online,
        };

        if let Some(old) = self.by_id.insert(client_id.to_string(), entry.clone())
        {
            self.by_connection.remove_if(&old.connection, |_, id| {
                id == client_id
            });
        }
        self.by_connection.insert(connection, client_id.to_string());
        Ok(entry)
    }

    /// Removes the entry for `client_id` only if it is still bound to
    /// `connection`. A disconnect that arrives after the client has already
    /// reconnected under a new connection handle must not be able to wipe
    /// out the new, live entry — the caller is expected to pass the
    /// connection handle it actually owns, not just the client id.
    pub fn remove(&self, client_id: &str, connection: ConnectionHandle) -> bool {
        let removed = self
            .by_id
            .remove_if(client_id, |_, entry| entry.connection == connection);
        if let Some((_, entry)) = removed {
            self.by_connection
                .remove_if(&entry.connection, |_, id| id == client_id);
            true
        } else {
            false
        }
    }

    pub fn remove_by_connection(
        &self,
        connection: ConnectionHandle,
    ) -> Option<PresenceEntry> {
        let client_id = self.by_connection.remove(&connection)?.1;
        self.by_id.remove(&client_id).map(|(_, entry)| entry)
    }

    pub fn lookup(&self, client_id: &str) -> Option<PresenceEntry> {
        self.by_id.get(client_id).map(|e| e.clone())
    }

    pub fn lookup_by_connection(
        &self,
        connection: ConnectionHandle,
    ) -> Option<PresenceEntry> {
        let client_id = self.by_connection.get(&connection)?;
        self.by_id.get(client_id.as_str()).map(|e| e.clone())
    }

    pub fn list_online(&self) -> Vec<PresenceEntry> {
        self.by_id
            .iter()
            .filter(|e| e.status == PresenceStatus::Online)
            .map(|e| e.clone())
            .collect()
    }

    /// Marks `client_id` offline only if `connection` still owns its entry;
    /// same staleness guard as [`Self::remove`].
    pub fn mark_offline(
        &self,
        client_id: &str,
        connection: ConnectionHandle,
    ) -> bool {
        if let Some(mut entry) = self.by_id.get_mut(client_id) {
            if entry.connection == connection {
                entry.status = PresenceStatus::Offline;
                return true;
            }
        }
        false
    }

    pub fn refresh(&self, client_id: &str) -> bool {
        if let Some(mut entry) = self.by_id.get_mut(client_id) {
            entry.last_seen_at = Utc::now();
            entry.status = PresenceStatus::Online;
            true
        } else {
            false
        }
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.by_id
            .get(client_id)
            .map(|e| e.status == PresenceStatus::Online)
            .unwrap_or(false)
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
