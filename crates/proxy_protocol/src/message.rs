//! Message type definitions for client-backend communication.
//!
//! A message is an opaque tagged value: a kind identifying what the message
//! is, plus an ordered list of typed fields. Only the message kinds the
//! proxy's core algorithms care about are named; every other packet travels
//! as [`MessageKind::Other`] with its payload in a single raw field.

use serde::{Deserialize, Serialize};

/// Client-action id confirming a dimension swap completed client-side.
///
/// The transfer handshake waits for a [`MessageKind::ClientAction`] carrying
/// this action id before advancing a phase. Any other action id is ordinary
/// gameplay traffic.
pub const ACTION_DIMENSION_ACK: u64 = 0;

/// The kind of a protocol message.
///
/// Kinds are stable across backend protocol revisions; the per-revision
/// byte layout of each packet is resolved by the versioned codec before a
/// `Message` is constructed, so the core only ever sees tagged fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Backend's world-initialization message; carries the backend-assigned
    /// player entity id and the protocol revision. Triggers a rewrite-table
    /// rebuild exactly once per backend connection.
    WorldInit,
    /// Instructs the client to change to another dimension and reload
    /// world state.
    DimensionChange,
    /// A player action sent by the client; see [`ACTION_DIMENSION_ACK`].
    ClientAction,
    /// Tells a backend the player is fully initialized and normal flow can
    /// resume.
    PlayerInitialized,
    /// An entity entered the client's view.
    EntitySpawn,
    /// An entity left the client's view.
    EntityDespawn,
    /// An entity-scoped event (animation, status, metadata).
    EntityEvent,
    /// An entity position update.
    EntityMove,
    /// A single block changed; carries a block id.
    BlockChange,
    /// An inventory slot update; carries an item id.
    SetSlot,
    /// Ambient particle burst. Transient; stale within a tick.
    Particle,
    /// Ambient sound event. Transient; stale within a tick.
    AmbientSound,
    /// A status effect applied to an entity.
    StatusEffect,
    /// A status effect removed from an entity.
    RemoveStatusEffect,
    /// A boss bar created or updated; identified by a raw 16-byte id.
    BossBarAdd,
    /// A boss bar removed.
    BossBarRemove,
    /// A scoreboard objective created or updated; identified by name.
    ScoreboardObjective,
    /// A scoreboard objective removed.
    ScoreboardRemove,
    /// Weather state change.
    WeatherChange,
    /// A game rule update.
    GameRule,
    /// A chat message.
    Chat,
    /// Transport keep-alive.
    KeepAlive,
    /// Connection termination with a reason.
    Disconnect,
    /// Any message the proxy does not interpret. Forwarded verbatim.
    Other(u16),
}

/// First wire id guaranteed never to be claimed by a named kind; ids below
/// this may gain names in later revisions, but an unknown id always decodes
/// to [`MessageKind::Other`] with its exact value preserved.
pub const OTHER_BASE: u16 = 0x100;

impl MessageKind {
    /// Returns the stable wire id for this kind.
    pub fn wire_id(self) -> u16 {
        match self {
            MessageKind::WorldInit => 0,
            MessageKind::DimensionChange => 1,
            MessageKind::ClientAction => 2,
            MessageKind::PlayerInitialized => 3,
            MessageKind::EntitySpawn => 4,
            MessageKind::EntityDespawn => 5,
            MessageKind::EntityEvent => 6,
            MessageKind::EntityMove => 7,
            MessageKind::BlockChange => 8,
            MessageKind::SetSlot => 9,
            MessageKind::Particle => 10,
            MessageKind::AmbientSound => 11,
            MessageKind::StatusEffect => 12,
            MessageKind::RemoveStatusEffect => 13,
            MessageKind::BossBarAdd => 14,
            MessageKind::BossBarRemove => 15,
            MessageKind::ScoreboardObjective => 16,
            MessageKind::ScoreboardRemove => 17,
            MessageKind::WeatherChange => 18,
            MessageKind::GameRule => 19,
            MessageKind::Chat => 20,
            MessageKind::KeepAlive => 21,
            MessageKind::Disconnect => 22,
            MessageKind::Other(id) => id,
        }
    }

    /// Resolves a wire id back to a kind. Unknown ids become
    /// [`MessageKind::Other`].
    pub fn from_wire_id(id: u16) -> Self {
        match id {
            0 => MessageKind::WorldInit,
            1 => MessageKind::DimensionChange,
            2 => MessageKind::ClientAction,
            3 => MessageKind::PlayerInitialized,
            4 => MessageKind::EntitySpawn,
            5 => MessageKind::EntityDespawn,
            6 => MessageKind::EntityEvent,
            7 => MessageKind::EntityMove,
            8 => MessageKind::BlockChange,
            9 => MessageKind::SetSlot,
            10 => MessageKind::Particle,
            11 => MessageKind::AmbientSound,
            12 => MessageKind::StatusEffect,
            13 => MessageKind::RemoveStatusEffect,
            14 => MessageKind::BossBarAdd,
            15 => MessageKind::BossBarRemove,
            16 => MessageKind::ScoreboardObjective,
            17 => MessageKind::ScoreboardRemove,
            18 => MessageKind::WeatherChange,
            19 => MessageKind::GameRule,
            20 => MessageKind::Chat,
            21 => MessageKind::KeepAlive,
            22 => MessageKind::Disconnect,
            other => MessageKind::Other(other),
        }
    }
}

/// A typed field within a message.
///
/// The field tag is the versioned codec's statement of what an encoded
/// value *means*. The rewrite layer only touches `EntityId`, `BlockId`,
/// and `ItemId` fields; everything else passes through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// An entity identifier subject to namespace rewriting.
    EntityId(i32),
    /// A block id subject to palette rewriting.
    BlockId(u32),
    /// An item id subject to palette rewriting.
    ItemId(u32),
    /// A logical world id.
    Dimension(i32),
    /// An unsigned scalar (action ids, effect ids, weather states).
    UInt(u64),
    /// UTF-8 text (chat, objective names, disconnect reasons).
    Text(String),
    /// Uninterpreted bytes.
    Raw(Vec<u8>),
}

/// One protocol message: a kind and its ordered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// What this message is.
    pub kind: MessageKind,
    /// The message payload as tagged fields.
    pub fields: Vec<Field>,
}

impl Message {
    /// Creates a message from a kind and field list.
    pub fn new(kind: MessageKind, fields: Vec<Field>) -> Self {
        Self { kind, fields }
    }

    /// Returns the first entity id field, if any.
    pub fn entity_id(&self) -> Option<i32> {
        self.fields.iter().find_map(|field| match field {
            Field::EntityId(id) => Some(*id),
            _ => None,
        })
    }

    /// Returns the first dimension field, if any.
    pub fn dimension(&self) -> Option<i32> {
        self.fields.iter().find_map(|field| match field {
            Field::Dimension(dim) => Some(*dim),
            _ => None,
        })
    }

    /// Returns the first unsigned scalar field, if any.
    pub fn uint(&self) -> Option<u64> {
        self.fields.iter().find_map(|field| match field {
            Field::UInt(value) => Some(*value),
            _ => None,
        })
    }

    /// Returns the first text field, if any.
    pub fn text(&self) -> Option<&str> {
        self.fields.iter().find_map(|field| match field {
            Field::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// True if this is a client action carrying [`ACTION_DIMENSION_ACK`].
    pub fn is_dimension_ack(&self) -> bool {
        self.kind == MessageKind::ClientAction && self.uint() == Some(ACTION_DIMENSION_ACK)
    }

    // Synthetic messages the proxy injects on its own behalf.

    /// A synthetic dimension-change instruction.
    pub fn dimension_change(dimension: i32) -> Self {
        Self::new(MessageKind::DimensionChange, vec![Field::Dimension(dimension)])
    }

    /// The player-action acknowledgement a client sends after a dimension
    /// swap. Used by tests and the login flow, never by the proxy itself.
    pub fn dimension_ack() -> Self {
        Self::new(
            MessageKind::ClientAction,
            vec![Field::UInt(ACTION_DIMENSION_ACK)],
        )
    }

    /// Tells a backend the player is fully initialized.
    pub fn player_initialized() -> Self {
        Self::new(MessageKind::PlayerInitialized, Vec::new())
    }

    /// Removes one status effect from an entity.
    pub fn remove_status_effect(entity_id: i32, effect: u64) -> Self {
        Self::new(
            MessageKind::RemoveStatusEffect,
            vec![Field::EntityId(entity_id), Field::UInt(effect)],
        )
    }

    /// Removes a boss bar by its raw id.
    pub fn boss_bar_remove(bar_id: [u8; 16]) -> Self {
        Self::new(MessageKind::BossBarRemove, vec![Field::Raw(bar_id.to_vec())])
    }

    /// Removes a scoreboard objective by name.
    pub fn scoreboard_remove(name: impl Into<String>) -> Self {
        Self::new(MessageKind::ScoreboardRemove, vec![Field::Text(name.into())])
    }

    /// Resets weather to clear.
    pub fn weather_clear() -> Self {
        Self::new(MessageKind::WeatherChange, vec![Field::UInt(0)])
    }

    /// Restores a game rule to its default value. A game-rule message with
    /// no value field is the restore-default form.
    pub fn game_rule_reset(name: impl Into<String>) -> Self {
        Self::new(MessageKind::GameRule, vec![Field::Text(name.into())])
    }

    /// A chat message shown to the player.
    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Chat, vec![Field::Text(text.into())])
    }

    /// A disconnect instruction with a reason string.
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self::new(MessageKind::Disconnect, vec![Field::Text(reason.into())])
    }
}
