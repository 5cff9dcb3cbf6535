//! Core of the Meridian game proxy.
//!
//! The proxy sits between game clients and a fleet of backend servers and
//! keeps a client's session alive while moving it between backends. The
//! pieces:
//!
//! - [`rewrite`] maps entity and palette ids between each backend's local
//!   namespace and the proxy-stable namespace the client sees.
//! - [`bridge`] moves batches between the peers, passing untouched batches
//!   through byte-identically and re-encoding only when something changed.
//! - [`transfer`] drives the backend handshake: quarantine, dimension
//!   swap, quarantine release, link swap.
//! - [`session`] ties one client, one backend, and their rewrite state
//!   together behind a single lock.
//! - [`server`] accepts clients and runs the pump tasks.
//!
//! Everything is wired through an explicit [`context::ProxyContext`];
//! there is no global state.

pub mod backend;
pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod hooks;
pub mod rewrite;
pub mod server;
pub mod session;
pub mod transfer;
pub mod types;

pub use backend::{BackendRegistry, Connector, Link, StaticRegistry};
pub use bridge::{BatchBridge, BridgeAction, BridgeContext};
pub use config::{BackendSettings, ProxyConfig, TransferSettings};
pub use context::ProxyContext;
pub use error::{HookError, ProxyError, TransferError};
pub use events::EventBus;
pub use hooks::{HookChain, HookContext, HookOutcome, ProtocolHook};
pub use rewrite::{EntityRewriter, IdAllocator, IdTable, PaletteCatalog, RewriteTables};
pub use server::ProxyServer;
pub use session::Session;
pub use transfer::{TransferPhase, TransferStateMachine};
pub use types::{Direction, PlayerId, SessionPhase};
