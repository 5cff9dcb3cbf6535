//! Backend connectivity: link abstraction, dialing, and name resolution.
//!
//! Sessions never hold raw sockets. They hold [`Link`]s, so the transfer
//! machinery and the tests can swap the transport without touching session
//! logic.

pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use proxy_protocol::Compression;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, TransferError};
use crate::types::PlayerId;

/// One framed, bidirectional connection to a peer.
///
/// A link owns its negotiated compression and encryption settings for the
/// connection's lifetime; the bridge consults both to decide whether a
/// batch can pass through without re-framing.
#[async_trait]
pub trait Link: Send + Sync {
    /// Sends one already-framed batch.
    async fn send_batch(&self, frame: Vec<u8>) -> Result<(), ProxyError>;

    /// Receives the next framed batch. `Ok(None)` means the peer closed
    /// the connection cleanly.
    async fn recv_batch(&self) -> Result<Option<Vec<u8>>, ProxyError>;

    /// Compression negotiated for this connection.
    fn compression(&self) -> Compression;

    /// Whether frames on this connection are encrypted.
    fn encryption_enabled(&self) -> bool;

    /// False once the connection has been closed or has failed.
    fn is_open(&self) -> bool;

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

/// Dials new backend connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a link to `addr`, bounded by the configured connect timeout.
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn Link>, TransferError>;
}

/// Resolves backend names to addresses and fallback targets.
pub trait BackendRegistry: Send + Sync {
    /// The address a backend name dials to, if the name is known.
    fn resolve(&self, name: &str) -> Option<SocketAddr>;

    /// The backend a player should land on when `failed` is unreachable.
    fn fallback_for(&self, player: PlayerId, failed: &str) -> Option<String>;
}

/// Registry built once from configuration.
pub struct StaticRegistry {
    backends: Vec<(String, SocketAddr, Option<String>)>,
}

impl StaticRegistry {
    /// Builds the registry from the validated proxy configuration.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            backends: config
                .backends
                .iter()
                .map(|b| (b.name.clone(), b.address, b.fallback.clone()))
                .collect(),
        }
    }
}

impl BackendRegistry for StaticRegistry {
    fn resolve(&self, name: &str) -> Option<SocketAddr> {
        self.backends
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, addr, _)| *addr)
    }

    fn fallback_for(&self, _player: PlayerId, failed: &str) -> Option<String> {
        self.backends
            .iter()
            .find(|(n, _, _)| n == failed)
            .and_then(|(_, _, fallback)| fallback.clone())
    }
}
