//! Per-player session state and frame handling.
//!
//! A session owns exactly one client link and one backend link at a time,
//! plus the rewrite tables and world-state tracker bound to the current
//! backend connection. During a transfer it additionally owns the pending
//! machinery; completion swaps the backend link and tables atomically under
//! the session lock, so no frame ever observes a half-migrated session.

pub mod tracker;

use std::sync::Arc;

use proxy_protocol::{codec, Message, MessageKind};
use tracing::{debug, trace};

use crate::backend::Link;
use crate::bridge::{BatchBridge, BridgeAction, BridgeContext, run_pipeline};
use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::events::{PlayerDisconnectedEvent, PLAYER_DISCONNECTED};
use crate::rewrite::RewriteTables;
use crate::session::tracker::EntityTracker;
use crate::transfer::{self, TransferPhase, TransferStateMachine};
use crate::types::{current_timestamp, Direction, PlayerId, SessionPhase};

/// One connected player's proxy-side state.
pub struct Session {
    /// Stable identity for the whole proxy session.
    pub player_id: PlayerId,
    /// Proxy-stable entity id the client sees, drawn from the reserved range.
    pub proxy_entity_id: i32,
    /// Lifecycle phase, selecting the hook chain.
    pub phase: SessionPhase,
    /// Dimension the client currently inhabits, client-visible value.
    pub dimension: i32,
    /// Rewrite tables for the current backend, absent until its
    /// world-initialization arrives.
    pub rewrite: Option<RewriteTables>,
    /// Client-space world-state registry.
    pub tracker: EntityTracker,
    /// Link to the player's client.
    pub client: Arc<dyn Link>,
    /// Link to the current backend.
    pub backend: Arc<dyn Link>,
    /// Registry name of the current backend.
    pub backend_name: String,
    /// Bumped on every backend swap; stale pump frames are discarded by it.
    pub backend_generation: u64,
    /// In-flight transfer, if any.
    pub pending_transfer: Option<TransferStateMachine>,
    /// Set once; a closed session ignores all further frames.
    pub closed: bool,
    client_bound: BatchBridge,
    backend_bound: BatchBridge,
}

impl Session {
    /// Creates a session in the login phase.
    ///
    /// The tracker starts suspended: until the backend's world-init arrives
    /// there are no rewrite tables, so observed ids would be in the wrong
    /// namespace.
    pub fn new(
        player_id: PlayerId,
        proxy_entity_id: i32,
        client: Arc<dyn Link>,
        backend: Arc<dyn Link>,
        backend_name: String,
    ) -> Self {
        Self {
            player_id,
            proxy_entity_id,
            phase: SessionPhase::Login,
            dimension: 0,
            rewrite: None,
            tracker: EntityTracker::suspended(),
            client,
            backend,
            backend_name,
            backend_generation: 0,
            pending_transfer: None,
            closed: false,
            client_bound: BatchBridge::new(),
            backend_bound: BatchBridge::new(),
        }
    }

    /// Handles one frame read from the client link.
    ///
    /// Dimension acks are routed to the transfer handshake while one is
    /// awaiting them; everything else bridges to the current backend.
    pub async fn handle_client_frame(
        &mut self,
        ctx: &ProxyContext,
        frame: Vec<u8>,
    ) -> Result<(), ProxyError> {
        if self.closed {
            return Ok(());
        }
        let batch = codec::decode_batch(&frame)?;

        let awaiting_ack = self
            .pending_transfer
            .as_ref()
            .is_some_and(TransferStateMachine::awaiting_ack);
        if awaiting_ack && batch.messages().iter().any(Message::is_dimension_ack) {
            // Acks are consumed one at a time: once the handshake has run
            // out of phases, a further ack in the same batch is ordinary
            // gameplay and must be forwarded.
            let (messages, _, _) = batch.into_parts();
            let mut rest = Vec::with_capacity(messages.len());
            for message in messages {
                let consumed = message.is_dimension_ack()
                    && self
                        .pending_transfer
                        .as_ref()
                        .is_some_and(TransferStateMachine::awaiting_ack);
                if consumed {
                    transfer::handle_dimension_ack(self, ctx).await?;
                } else {
                    rest.push(message);
                }
            }
            if rest.is_empty() {
                return Ok(());
            }
            return self.forward_to_backend(ctx, rest).await;
        }

        let target_compression = self.backend.compression();
        let mut bridge_ctx = BridgeContext {
            player_id: self.player_id,
            phase: self.phase,
            direction: Direction::ClientToBackend,
            rewrite: self.rewrite.as_ref(),
            tracker: &mut self.tracker,
            target_compression,
            source_encrypted: self.client.encryption_enabled(),
            target_encrypted: self.backend.encryption_enabled(),
        };
        match self.backend_bound.process(batch, &ctx.hooks, &mut bridge_ctx) {
            BridgeAction::PassThrough(bytes) => self.backend.send_batch(bytes).await,
            BridgeAction::Reencode { messages, .. } => {
                let frame = codec::encode_batch(&messages, target_compression)?;
                self.backend.send_batch(frame).await
            }
            BridgeAction::Drop => Ok(()),
        }
    }

    /// Handles one frame read from the current backend link.
    ///
    /// `generation` is the backend generation the pump was spawned against;
    /// frames from a swapped-out backend are discarded.
    pub async fn handle_backend_frame(
        &mut self,
        ctx: &ProxyContext,
        generation: u64,
        frame: Vec<u8>,
    ) -> Result<(), ProxyError> {
        if self.closed {
            return Ok(());
        }
        if generation != self.backend_generation {
            trace!(player = %self.player_id, "discarding frame from stale backend");
            return Ok(());
        }
        let batch = codec::decode_batch(&frame)?;

        if self.rewrite.is_none() {
            if let Some(world_init) = batch
                .messages()
                .iter()
                .find(|m| m.kind == MessageKind::WorldInit)
            {
                self.install_world(ctx, world_init);
            }
        }

        // Once the client has left the old world, the old backend's view of
        // it is obsolete; nothing from it may reach the client.
        if self.old_backend_suppressed() {
            trace!(player = %self.player_id, "suppressing old backend traffic mid-transfer");
            return Ok(());
        }

        let target_compression = self.client.compression();
        let mut bridge_ctx = BridgeContext {
            player_id: self.player_id,
            phase: self.phase,
            direction: Direction::BackendToClient,
            rewrite: self.rewrite.as_ref(),
            tracker: &mut self.tracker,
            target_compression,
            source_encrypted: self.backend.encryption_enabled(),
            target_encrypted: self.client.encryption_enabled(),
        };
        match self.client_bound.process(batch, &ctx.hooks, &mut bridge_ctx) {
            BridgeAction::PassThrough(bytes) => self.client.send_batch(bytes).await,
            BridgeAction::Reencode { messages, .. } => {
                let frame = codec::encode_batch(&messages, target_compression)?;
                self.client.send_batch(frame).await
            }
            BridgeAction::Drop => Ok(()),
        }
    }

    /// Installs rewrite state from the current backend's world-init.
    fn install_world(&mut self, ctx: &ProxyContext, world_init: &Message) {
        match RewriteTables::from_world_init(self.proxy_entity_id, world_init, &ctx.palettes) {
            Some(tables) => {
                debug!(
                    player = %self.player_id,
                    backend = %self.backend_name,
                    backend_entity_id = tables.entity().backend_id(),
                    "world initialized"
                );
                self.rewrite = Some(tables);
                self.dimension = world_init.dimension().unwrap_or(0);
                self.tracker.resume();
                self.phase = SessionPhase::Connected;
            }
            None => {
                debug!(
                    player = %self.player_id,
                    "world init without entity id, rewrite deferred"
                );
            }
        }
    }

    /// The handshake phase of the pending transfer, or `Reset` when no
    /// transfer is in flight.
    pub fn transfer_phase(&self) -> TransferPhase {
        self.pending_transfer
            .as_ref()
            .map(|machine| machine.phase)
            .unwrap_or(TransferPhase::Reset)
    }

    /// True while a transfer has moved the client out of the old world.
    pub fn old_backend_suppressed(&self) -> bool {
        self.pending_transfer
            .as_ref()
            .is_some_and(TransferStateMachine::awaiting_ack)
    }

    /// Encodes synthesized messages at the client's settings and sends them.
    pub(crate) async fn send_to_client(&self, messages: &[Message]) -> Result<(), ProxyError> {
        let frame = codec::encode_batch(messages, self.client.compression())?;
        self.client.send_batch(frame).await
    }

    /// Runs client-origin messages through the backend-bound pipeline and
    /// forwards the survivors.
    async fn forward_to_backend(
        &mut self,
        ctx: &ProxyContext,
        messages: Vec<Message>,
    ) -> Result<(), ProxyError> {
        let target_compression = self.backend.compression();
        let mut bridge_ctx = BridgeContext {
            player_id: self.player_id,
            phase: self.phase,
            direction: Direction::ClientToBackend,
            rewrite: self.rewrite.as_ref(),
            tracker: &mut self.tracker,
            target_compression,
            source_encrypted: self.client.encryption_enabled(),
            target_encrypted: self.backend.encryption_enabled(),
        };
        let result = run_pipeline(messages, &ctx.hooks, &mut bridge_ctx);
        if result.surviving.is_empty() {
            return Ok(());
        }
        let frame = codec::encode_batch(&result.surviving, target_compression)?;
        self.backend.send_batch(frame).await
    }

    /// Closes the session and everything it owns.
    ///
    /// A pending transfer is cancelled: its queue is discarded and its link
    /// closed, so no queued message can outlive the session.
    pub async fn close(&mut self, ctx: &ProxyContext, reason: Option<String>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut machine) = self.pending_transfer.take() {
            machine.queue.discard();
            machine.link.close().await;
        }
        self.client.close().await;
        self.backend.close().await;
        let _ = ctx
            .events
            .emit(
                PLAYER_DISCONNECTED,
                &PlayerDisconnectedEvent {
                    player_id: self.player_id,
                    reason,
                    timestamp: current_timestamp(),
                },
            )
            .await;
    }
}
