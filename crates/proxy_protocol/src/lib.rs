//! # Proxy Protocol - Opaque Message Model and Batch Codec
//!
//! This crate defines the wire-facing types shared by every part of the
//! proxy: tagged messages with typed fields, framed batches, and the
//! compression-aware codec that turns one into the other.
//!
//! The proxy deliberately does **not** understand full per-version packet
//! layouts. A [`Message`] is an opaque tagged value: a [`MessageKind`] plus
//! an ordered list of [`Field`]s. Fields that carry entity, block, or item
//! identifiers are tagged as such at decode time, which is all the rewrite
//! layer needs to translate them between backend-local and proxy-stable
//! namespaces.
//!
//! A [`Batch`] is one framed, possibly compressed, ordered group of messages
//! exchanged in a single transport write. Decoded batches retain the exact
//! bytes they were parsed from so that untouched batches can be forwarded
//! without paying for recompression.

pub use batch::{Batch, Compression};
pub use error::CodecError;
pub use message::{Field, Message, MessageKind, ACTION_DIMENSION_ACK};

pub mod batch;
pub mod codec;
pub mod error;
pub mod message;
