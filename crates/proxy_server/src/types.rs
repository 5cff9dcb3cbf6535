//! Core type definitions shared across the proxy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a player session on the proxy.
///
/// A wrapper around UUID that provides type safety and ensures player ids
/// cannot be confused with other identifiers in the system. Assigned once
/// when the client connects and stable for the session lifetime, across any
/// number of backend transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random player id using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which way a batch is flowing through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the connected client toward a backend.
    ClientToBackend,
    /// From a backend toward the connected client.
    BackendToClient,
}

/// Logical phase of a session, selecting which hook chain applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Initial handshake with the first backend.
    Login,
    /// Steady-state bridged play.
    Connected,
    /// A backend transfer handshake is in progress.
    Transferring,
}

/// Returns the current time as milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
