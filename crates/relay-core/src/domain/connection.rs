//! Connection registry: identity, role, and liveness bookkeeping for every
//! live transport session.
//!
//! The registry is the single owner of [`Connection`] records. A record is
//! created when the transport accepts a connection, its activity timestamp
//! is refreshed on every inbound message, its role is set once the client
//! identifies itself, and the record is removed when the transport closes.
//!
//! Every mutator is a no-op (not an error) when the id is absent:
//! disconnects race with in-flight messages by design, and "already gone"
//! is a normal outcome at this boundary.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::ConnectionId;

/// Role of a connection within the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Connected but not yet identified.
    #[default]
    Unclassified,
    /// Supplies frames (the screen-capture client).
    Producer,
    /// Consumes frames from one stream.
    Viewer,
}

/// Free-form client details captured from the identification message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMetadata {
    pub version: Option<String>,
    pub capabilities: Vec<String>,
}

/// One physical transport session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub connected_at: Instant,
    pub last_activity_at: Instant,
    pub client_metadata: Option<ClientMetadata>,
}

/// In-memory registry of all live connections.
///
/// Stored behind a lock in the server state and passed by reference to
/// every component; constructing one registry per relay process keeps
/// instances isolated in tests.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a record for a freshly accepted transport and returns its id.
    /// The connection starts out [`Role::Unclassified`].
    pub fn register(&mut self, now: Instant) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Connection {
                id,
                role: Role::Unclassified,
                connected_at: now,
                last_activity_at: now,
                client_metadata: None,
            },
        );
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Returns the connection's role, or `None` if it is already gone.
    pub fn role(&self, id: ConnectionId) -> Option<Role> {
        self.connections.get(&id).map(|c| c.role)
    }

    pub fn set_role(&mut self, id: ConnectionId, role: Role) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.role = role;
        }
    }

    pub fn set_metadata(&mut self, id: ConnectionId, metadata: ClientMetadata) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.client_metadata = Some(metadata);
        }
    }

    /// Refreshes the activity timestamp. Called for every inbound message,
    /// binary frames included, so an active producer never reads as idle.
    pub fn touch(&mut self, id: ConnectionId, now: Instant) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.last_activity_at = now;
        }
    }

    pub fn remove(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Ids of connections whose last activity is older than `timeout`.
    /// Consumed by the server's liveness sweep to force-close half-open
    /// transports.
    pub fn idle_connections(&self, timeout: Duration, now: Instant) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| now.duration_since(c.last_activity_at) > timeout)
            .map(|c| c.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn count_by_role(&self, role: Role) -> usize {
        self.connections.values().filter(|c| c.role == role).count()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
