//! Identifier rewriting between backend-local and proxy-stable namespaces.
//!
//! Every backend assigns its own entity id to the player and speaks its own
//! protocol revision's block/item palette. The client, meanwhile, must see
//! one stable id namespace for the whole session, or entities and world
//! state would glitch on every transfer. This module is the only bridge
//! between the two namespaces: [`EntityRewriter`] swaps the player's entity
//! id, [`IdTable`] remaps palette ids, and [`RewriteTables`] aggregates both
//! for one backend connection.
//!
//! All lookups are pure table functions with a pass-through miss policy:
//! an id the tables do not know (world-global ids, ids owned by other
//! systems) must never be corrupted, so it is forwarded unchanged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use proxy_protocol::{Field, Message, MessageKind};

/// First entity id in the proxy-reserved range.
///
/// Proxy-stable entity ids are drawn from here upward so they can never
/// collide with a real backend-assigned id; backends allocate small
/// sequential ids from zero.
pub const RESERVED_ENTITY_ID_BASE: i32 = 1 << 24;

/// Allocates proxy-stable entity ids from the reserved range.
///
/// One allocator exists per proxy context; it is never a process-wide
/// static.
pub struct IdAllocator {
    next: AtomicI32,
}

impl IdAllocator {
    /// Creates an allocator starting at [`RESERVED_ENTITY_ID_BASE`].
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(RESERVED_ENTITY_ID_BASE),
        }
    }

    /// Returns the next unused proxy-stable entity id.
    pub fn allocate(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Swaps the player's entity id between namespaces.
///
/// `to_client_space` and `to_backend_space` are mutual inverses for the
/// lifetime of one backend connection: the reserved proxy range guarantees
/// the backend id and the proxy id can never be equal, so each direction
/// needs to map exactly one id and pass everything else through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRewriter {
    proxy_id: i32,
    backend_id: i32,
}

impl EntityRewriter {
    /// Creates a rewriter for one proxy-id/backend-id pair.
    pub fn new(proxy_id: i32, backend_id: i32) -> Self {
        debug_assert!(proxy_id >= RESERVED_ENTITY_ID_BASE);
        Self {
            proxy_id,
            backend_id,
        }
    }

    /// The proxy-stable id the client sees.
    pub fn proxy_id(&self) -> i32 {
        self.proxy_id
    }

    /// The id the current backend assigned.
    pub fn backend_id(&self) -> i32 {
        self.backend_id
    }

    /// Maps a backend-space id into client space.
    pub fn to_client_space(&self, id: i32) -> i32 {
        if id == self.backend_id {
            self.proxy_id
        } else {
            id
        }
    }

    /// Maps a client-space id into backend space.
    pub fn to_backend_space(&self, id: i32) -> i32 {
        if id == self.proxy_id {
            self.backend_id
        } else {
            id
        }
    }
}

/// Table-driven remap for palette (block/item) ids.
///
/// Same shape as [`EntityRewriter`], parameterized by table instead of
/// formula. Ids absent from the table pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct IdTable {
    to_client: HashMap<u32, u32>,
    to_backend: HashMap<u32, u32>,
}

impl IdTable {
    /// An empty table; every lookup passes through.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Builds a table from `(backend_id, client_id)` pairs.
    pub fn from_pairs<I: IntoIterator<Item = (u32, u32)>>(pairs: I) -> Self {
        let mut to_client = HashMap::new();
        let mut to_backend = HashMap::new();
        for (backend, client) in pairs {
            to_client.insert(backend, client);
            to_backend.insert(client, backend);
        }
        debug_assert_eq!(to_client.len(), to_backend.len(), "palette table not bijective");
        Self {
            to_client,
            to_backend,
        }
    }

    /// Maps a backend-space palette id into client space.
    pub fn to_client_space(&self, id: u32) -> u32 {
        self.to_client.get(&id).copied().unwrap_or(id)
    }

    /// Maps a client-space palette id into backend space.
    pub fn to_backend_space(&self, id: u32) -> u32 {
        self.to_backend.get(&id).copied().unwrap_or(id)
    }

    /// True if the table remaps nothing.
    pub fn is_identity(&self) -> bool {
        self.to_client.is_empty()
    }
}

/// Per-revision palette tables, supplied externally.
///
/// Backends running different protocol revisions disagree on numeric
/// block/item ids; the catalog holds the remap for each revision the proxy
/// understands. Revisions without an entry use identity tables.
#[derive(Default)]
pub struct PaletteCatalog {
    revisions: HashMap<u32, (IdTable, IdTable)>,
}

impl PaletteCatalog {
    /// A catalog with no revision-specific tables.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Registers block and item tables for one protocol revision.
    pub fn register(&mut self, revision: u32, blocks: IdTable, items: IdTable) {
        self.revisions.insert(revision, (blocks, items));
    }

    /// Returns the block/item tables for a revision, identity if unknown.
    pub fn tables_for(&self, revision: u32) -> (IdTable, IdTable) {
        self.revisions
            .get(&revision)
            .cloned()
            .unwrap_or_else(|| (IdTable::identity(), IdTable::identity()))
    }
}

/// Per-session rewrite state for one backend connection.
///
/// Rebuilt on every transfer from the new backend's world-initialization
/// message; discarded with the connection it belongs to.
#[derive(Debug, Clone)]
pub struct RewriteTables {
    entity: EntityRewriter,
    blocks: IdTable,
    items: IdTable,
}

impl RewriteTables {
    /// Assembles rewrite tables from their parts.
    pub fn new(entity: EntityRewriter, blocks: IdTable, items: IdTable) -> Self {
        Self {
            entity,
            blocks,
            items,
        }
    }

    /// Builds tables from a backend's world-initialization message.
    ///
    /// Returns `None` if the message does not carry the backend-assigned
    /// entity id. The protocol revision rides in the message's first
    /// unsigned field and selects the palette tables.
    pub fn from_world_init(
        proxy_entity_id: i32,
        world_init: &Message,
        palettes: &PaletteCatalog,
    ) -> Option<Self> {
        debug_assert_eq!(world_init.kind, MessageKind::WorldInit);
        let backend_entity_id = world_init.entity_id()?;
        let revision = world_init.uint().unwrap_or(0) as u32;
        let (blocks, items) = palettes.tables_for(revision);
        Some(Self::new(
            EntityRewriter::new(proxy_entity_id, backend_entity_id),
            blocks,
            items,
        ))
    }

    /// The entity id rewriter.
    pub fn entity(&self) -> &EntityRewriter {
        &self.entity
    }

    /// Rewrites a backend-bound message's id fields in place.
    ///
    /// Returns true if any field changed.
    pub fn apply_backend_bound(&self, message: &mut Message) -> bool {
        self.apply(message, RewriteDirection::ToBackend)
    }

    /// Rewrites a client-bound message's id fields in place.
    ///
    /// Returns true if any field changed.
    pub fn apply_client_bound(&self, message: &mut Message) -> bool {
        self.apply(message, RewriteDirection::ToClient)
    }

    fn apply(&self, message: &mut Message, direction: RewriteDirection) -> bool {
        let mut mutated = false;
        for field in &mut message.fields {
            match field {
                Field::EntityId(id) => {
                    let mapped = match direction {
                        RewriteDirection::ToClient => self.entity.to_client_space(*id),
                        RewriteDirection::ToBackend => self.entity.to_backend_space(*id),
                    };
                    if mapped != *id {
                        *id = mapped;
                        mutated = true;
                    }
                }
                Field::BlockId(id) => {
                    let mapped = match direction {
                        RewriteDirection::ToClient => self.blocks.to_client_space(*id),
                        RewriteDirection::ToBackend => self.blocks.to_backend_space(*id),
                    };
                    if mapped != *id {
                        *id = mapped;
                        mutated = true;
                    }
                }
                Field::ItemId(id) => {
                    let mapped = match direction {
                        RewriteDirection::ToClient => self.items.to_client_space(*id),
                        RewriteDirection::ToBackend => self.items.to_backend_space(*id),
                    };
                    if mapped != *id {
                        *id = mapped;
                        mutated = true;
                    }
                }
                _ => {}
            }
        }
        mutated
    }
}

#[derive(Clone, Copy)]
enum RewriteDirection {
    ToClient,
    ToBackend,
}
