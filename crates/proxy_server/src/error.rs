//! Error types for the proxy core.
//!
//! The taxonomy distinguishes failures by blast radius: a [`HookError`]
//! costs one message, a [`TransferError`] costs one transfer attempt (with
//! a fallback-or-disconnect recovery), and a [`ProxyError`] outside an
//! active transfer is an ordinary session disconnect. A spurious
//! acknowledgement for a phase the transfer state machine is not in is not
//! an error at all; it is forwarded as gameplay.

use thiserror::Error;

/// A single message failed hook processing.
///
/// Recovered by dropping that one message and logging; the batch and the
/// session continue.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// A backend transfer could not be completed.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The quarantine queue hit its configured capacity before release.
    #[error("transfer queue overflow: {queued} queued messages reached capacity {capacity}")]
    QueueOverflow {
        /// Messages retained when the bound was hit.
        queued: usize,
        /// The configured capacity.
        capacity: usize,
    },

    /// The new backend's link was already closed at swap time.
    #[error("backend '{0}' closed its link before the transfer completed")]
    BackendClosed(String),

    /// The new backend sent a disconnect while the transfer was pending.
    #[error("backend '{backend}' disconnected during transfer: {reason}")]
    BackendDisconnect {
        /// Name of the backend that disconnected.
        backend: String,
        /// Reason it supplied.
        reason: String,
    },

    /// Connecting to the new backend did not complete within the bound.
    #[error("connecting to backend '{0}' timed out")]
    ConnectTimeout(String),

    /// The requested backend is not in the registry.
    #[error("no backend named '{0}' is registered")]
    UnknownBackend(String),

    /// A transfer was requested while another is still pending.
    #[error("a transfer is already pending for this session")]
    AlreadyPending,
}

/// Top-level proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transport-level failure (bind, accept, read, write).
    #[error("network error: {0}")]
    Network(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] proxy_protocol::CodecError),

    /// A backend transfer failed.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Internal invariant violation or subsystem failure.
    #[error("internal error: {0}")]
    Internal(String),
}
