//! Fire-and-forget proxy event bus.
//!
//! Plugins and metrics collectors register handlers against string-keyed
//! events; the core emits serialized payloads as notifications it never
//! waits on. A handler error is logged and swallowed - event consumers can
//! never stall or fail a session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::types::{current_timestamp, PlayerId};

/// Event name for [`TransferStartedEvent`].
pub const TRANSFER_STARTED: &str = "transfer_started";
/// Event name for [`TransferCompletedEvent`].
pub const TRANSFER_COMPLETED: &str = "transfer_completed";
/// Event name for [`TransferFailedEvent`].
pub const TRANSFER_FAILED: &str = "transfer_failed";
/// Event name for [`PlayerConnectedEvent`].
pub const PLAYER_CONNECTED: &str = "player_connected";
/// Event name for [`PlayerDisconnectedEvent`].
pub const PLAYER_DISCONNECTED: &str = "player_disconnected";

/// Errors surfaced to event handlers and emitters.
#[derive(Debug, Error)]
pub enum EventError {
    /// The payload could not be serialized or deserialized.
    #[error("event serialization failed: {0}")]
    Serialization(String),

    /// A registered handler returned an error.
    #[error("event handler failed: {0}")]
    HandlerExecution(String),
}

/// A backend transfer has been initiated for a player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStartedEvent {
    /// The player being transferred.
    pub player_id: PlayerId,
    /// Backend the player is leaving.
    pub from_backend: String,
    /// Backend the player is moving to.
    pub to_backend: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A backend transfer completed and the session now bridges the new backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCompletedEvent {
    /// The transferred player.
    pub player_id: PlayerId,
    /// The backend now authoritative for the player.
    pub backend: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A backend transfer failed; the player fell back or was disconnected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferFailedEvent {
    /// The player whose transfer failed.
    pub player_id: PlayerId,
    /// The backend the transfer targeted.
    pub backend: String,
    /// Human-readable failure reason.
    pub reason: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A client connected and a session was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConnectedEvent {
    /// The new session's player id.
    pub player_id: PlayerId,
    /// The client's remote address.
    pub remote_addr: SocketAddr,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A session ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDisconnectedEvent {
    /// The closed session's player id.
    pub player_id: PlayerId,
    /// Reason the session ended, if known.
    pub reason: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl TransferFailedEvent {
    /// Convenience constructor stamping the current time.
    pub fn now(player_id: PlayerId, backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            player_id,
            backend: backend.into(),
            reason: reason.into(),
            timestamp: current_timestamp(),
        }
    }
}

type Handler = Box<dyn Fn(&serde_json::Value) -> Result<(), EventError> + Send + Sync>;

/// Statistics snapshot for the event bus.
#[derive(Debug, Clone, Copy)]
pub struct EventStats {
    /// Handlers currently registered across all event names.
    pub total_handlers: usize,
    /// Events emitted since startup.
    pub events_emitted: u64,
}

/// String-keyed registry of fire-and-forget event handlers.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    events_emitted: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            events_emitted: AtomicU64::new(0),
        }
    }

    /// Registers a typed handler for an event name.
    ///
    /// The payload is deserialized into `T` before the handler runs; a
    /// payload that does not match `T` is reported as a handler error.
    pub async fn on<T, F>(&self, event: &str, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let wrapped: Handler = Box::new(move |value| {
            let typed: T = serde_json::from_value(value.clone())
                .map_err(|e| EventError::Serialization(e.to_string()))?;
            handler(typed)
        });
        self.handlers
            .write()
            .await
            .entry(event.to_string())
            .or_default()
            .push(wrapped);
    }

    /// Emits an event to every registered handler.
    ///
    /// Handler failures are logged and do not propagate; emission only
    /// fails if the payload itself cannot be serialized.
    pub async fn emit<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), EventError> {
        let value =
            serde_json::to_value(payload).map_err(|e| EventError::Serialization(e.to_string()))?;
        self.events_emitted.fetch_add(1, Ordering::Relaxed);

        let handlers = self.handlers.read().await;
        if let Some(list) = handlers.get(event) {
            for handler in list {
                if let Err(e) = handler(&value) {
                    warn!("handler for event '{}' failed: {}", event, e);
                }
            }
        }
        Ok(())
    }

    /// Returns a snapshot of bus statistics.
    pub async fn stats(&self) -> EventStats {
        let handlers = self.handlers.read().await;
        EventStats {
            total_handlers: handlers.values().map(Vec::len).sum(),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn typed_handler_receives_emitted_event() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        bus.on(TRANSFER_FAILED, move |event: TransferFailedEvent| {
            assert_eq!(event.backend, "arena");
            seen_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        bus.emit(
            TRANSFER_FAILED,
            &TransferFailedEvent::now(PlayerId::new(), "arena", "queue overflow"),
        )
        .await
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_does_not_fail_emission() {
        let bus = EventBus::new();
        bus.on(PLAYER_DISCONNECTED, |_: PlayerDisconnectedEvent| {
            Err(EventError::HandlerExecution("boom".to_string()))
        })
        .await;

        let result = bus
            .emit(
                PLAYER_DISCONNECTED,
                &PlayerDisconnectedEvent {
                    player_id: PlayerId::new(),
                    reason: None,
                    timestamp: current_timestamp(),
                },
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stats_count_handlers_and_emissions() {
        let bus = EventBus::new();
        bus.on(TRANSFER_STARTED, |_: TransferStartedEvent| Ok(()))
            .await;
        bus.on(TRANSFER_STARTED, |_: TransferStartedEvent| Ok(()))
            .await;

        bus.emit(
            TRANSFER_STARTED,
            &TransferStartedEvent {
                player_id: PlayerId::new(),
                from_backend: "lobby".to_string(),
                to_backend: "arena".to_string(),
                timestamp: current_timestamp(),
            },
        )
        .await
        .unwrap();

        let stats = bus.stats().await;
        assert_eq!(stats.total_handlers, 2);
        assert_eq!(stats.events_emitted, 1);
    }
}
