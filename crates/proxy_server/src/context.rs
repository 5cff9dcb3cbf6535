//! Shared proxy services, passed explicitly to everything that needs them.
//!
//! There is no process-global state; tests build a context with in-memory
//! registries and connectors and exercise the full transfer machinery
//! without a network.

use std::sync::Arc;

use crate::backend::{BackendRegistry, Connector};
use crate::config::ProxyConfig;
use crate::events::EventBus;
use crate::hooks::HookChain;
use crate::rewrite::{IdAllocator, PaletteCatalog};

/// Aggregated services shared by every session.
pub struct ProxyContext {
    /// Validated startup configuration.
    pub config: ProxyConfig,
    /// Backend name resolution and fallback policy.
    pub registry: Arc<dyn BackendRegistry>,
    /// Dials new backend links.
    pub connector: Arc<dyn Connector>,
    /// Fire-and-forget proxy events.
    pub events: Arc<EventBus>,
    /// Registered protocol hooks.
    pub hooks: Arc<HookChain>,
    /// Proxy-stable entity id allocator.
    pub entity_ids: IdAllocator,
    /// Palette tables per protocol revision.
    pub palettes: PaletteCatalog,
}

impl ProxyContext {
    /// Assembles a context from its parts.
    pub fn new(
        config: ProxyConfig,
        registry: Arc<dyn BackendRegistry>,
        connector: Arc<dyn Connector>,
        hooks: HookChain,
        palettes: PaletteCatalog,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            events: Arc::new(EventBus::new()),
            hooks: Arc::new(hooks),
            entity_ids: IdAllocator::new(),
            palettes,
        }
    }
}
