//! Steady-state bidirectional packet bridging.
//!
//! For each inbound batch the bridge produces exactly one outbound action:
//! forward the original compressed bytes unchanged, or re-encode a possibly
//! filtered message list. Recompression is the dominant cost of the proxy,
//! so the pass-through path is taken whenever the output is provably
//! identical to the input: no hook mutated or cancelled anything, no
//! rewrite changed a field, and the source and target peers agree on
//! compression and encryption.

pub mod transfer_queue;

use proxy_protocol::{Batch, Compression, Message};
use tracing::{debug, warn};

use crate::hooks::{HookChain, HookContext, HookOutcome};
use crate::rewrite::RewriteTables;
use crate::session::tracker::EntityTracker;
use crate::types::{Direction, PlayerId, SessionPhase};

/// Everything one batch-processing call borrows from the session.
///
/// Components never hold session state across calls; they borrow it for
/// the duration of one batch.
pub struct BridgeContext<'a> {
    /// The session the batch belongs to.
    pub player_id: PlayerId,
    /// Phase selecting the hook chain.
    pub phase: SessionPhase,
    /// Which way the batch is flowing.
    pub direction: Direction,
    /// Rewrite tables for the current backend connection, absent before
    /// the backend's world-init has been seen.
    pub rewrite: Option<&'a RewriteTables>,
    /// Live world-state registry, updated from client-bound traffic.
    pub tracker: &'a mut EntityTracker,
    /// The target peer's currently negotiated compression.
    pub target_compression: Compression,
    /// Whether the source peer's frames are encrypted.
    pub source_encrypted: bool,
    /// Whether the target peer expects encrypted frames.
    pub target_encrypted: bool,
}

/// The single outbound action produced for one inbound batch.
#[derive(Debug)]
pub enum BridgeAction {
    /// Forward the original compressed byte range untouched.
    PassThrough(Vec<u8>),
    /// Serialize the surviving messages as a new framed batch at the
    /// target peer's settings. `original_len` is the inbound frame size,
    /// kept for metrics only.
    Reencode {
        /// Messages to serialize, in order. Ownership moves to the peer.
        messages: Vec<Message>,
        /// Byte length of the inbound frame.
        original_len: usize,
    },
    /// Nothing survives; send nothing.
    Drop,
}

/// Counters for one bridge direction. Logged, never load-bearing.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeMetrics {
    /// Batches forwarded byte-identically.
    pub batches_passed_through: u64,
    /// Batches re-encoded.
    pub batches_reencoded: u64,
    /// Messages dropped by cancellation or hook error.
    pub messages_dropped: u64,
}

/// Result of running the per-message pipeline over a batch's messages.
pub(crate) struct PipelineResult {
    pub surviving: Vec<Message>,
    pub mutated: bool,
    pub dropped: usize,
}

/// Runs hooks, rewrite, and tracking over each message in order.
///
/// Each message is owned by exactly one stage at a time: it enters the
/// hook chain by mutable reference, is rewritten in place, observed by the
/// tracker, and then either moves into the surviving list or is freed here
/// (cancellation, hook error).
pub(crate) fn run_pipeline(
    messages: Vec<Message>,
    hooks: &HookChain,
    ctx: &mut BridgeContext<'_>,
) -> PipelineResult {
    let hook_ctx = HookContext {
        player_id: ctx.player_id,
        phase: ctx.phase,
        direction: ctx.direction,
    };

    let mut surviving = Vec::with_capacity(messages.len());
    let mut mutated = false;
    let mut dropped = 0usize;

    'messages: for mut message in messages {
        for hook in hooks.hooks_for(ctx.phase) {
            match hook.handle(&hook_ctx, &mut message) {
                Ok(HookOutcome::Forward) => {}
                Ok(HookOutcome::Modified) => mutated = true,
                Ok(HookOutcome::Cancel) => {
                    dropped += 1;
                    continue 'messages;
                }
                Err(error) => {
                    // One message only; the batch and session continue.
                    warn!(
                        player = %ctx.player_id,
                        hook = hook.name(),
                        kind = ?message.kind,
                        "hook failed, dropping message: {error}"
                    );
                    dropped += 1;
                    continue 'messages;
                }
            }
        }

        if let Some(rewrite) = ctx.rewrite {
            let changed = match ctx.direction {
                Direction::BackendToClient => rewrite.apply_client_bound(&mut message),
                Direction::ClientToBackend => rewrite.apply_backend_bound(&mut message),
            };
            mutated |= changed;
        }

        if ctx.direction == Direction::BackendToClient {
            ctx.tracker.observe(&message);
        }

        surviving.push(message);
    }

    PipelineResult {
        surviving,
        mutated,
        dropped,
    }
}

/// The steady-state bridge for one direction of one session.
#[derive(Debug, Default)]
pub struct BatchBridge {
    metrics: BridgeMetrics,
}

impl BatchBridge {
    /// Creates a bridge with zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics accumulated so far.
    pub fn metrics(&self) -> BridgeMetrics {
        self.metrics
    }

    /// Processes one inbound batch into exactly one outbound action.
    pub fn process(
        &mut self,
        batch: Batch,
        hooks: &HookChain,
        ctx: &mut BridgeContext<'_>,
    ) -> BridgeAction {
        let compression = batch.compression();
        let (messages, raw, _) = batch.into_parts();
        let original_count = messages.len();
        let original_len = raw.len();

        let result = run_pipeline(messages, hooks, ctx);
        self.metrics.messages_dropped += result.dropped as u64;

        let filtered = result.surviving.len() != original_count;
        if !result.mutated
            && !filtered
            && compression == ctx.target_compression
            && ctx.source_encrypted == ctx.target_encrypted
        {
            debug!(
                player = %ctx.player_id,
                bytes = original_len,
                "batch passed through"
            );
            self.metrics.batches_passed_through += 1;
            return BridgeAction::PassThrough(raw);
        }

        if result.surviving.is_empty() {
            // Every message was cancelled; an empty frame carries nothing.
            return BridgeAction::Drop;
        }

        self.metrics.batches_reencoded += 1;
        BridgeAction::Reencode {
            messages: result.surviving,
            original_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HookError;
    use crate::hooks::ProtocolHook;
    use crate::rewrite::{EntityRewriter, IdTable, RewriteTables, RESERVED_ENTITY_ID_BASE};
    use proxy_protocol::{codec, Field, MessageKind};
    use std::sync::Arc;

    fn tables(backend_id: i32) -> RewriteTables {
        RewriteTables::new(
            EntityRewriter::new(RESERVED_ENTITY_ID_BASE, backend_id),
            IdTable::identity(),
            IdTable::identity(),
        )
    }

    fn make_batch(messages: Vec<Message>, compression: Compression) -> Batch {
        let frame = codec::encode_batch(&messages, compression).unwrap();
        codec::decode_batch(&frame).unwrap()
    }

    fn ctx<'a>(
        rewrite: Option<&'a RewriteTables>,
        tracker: &'a mut EntityTracker,
    ) -> BridgeContext<'a> {
        BridgeContext {
            player_id: PlayerId::new(),
            phase: SessionPhase::Connected,
            direction: Direction::BackendToClient,
            rewrite,
            tracker,
            target_compression: Compression::None,
            source_encrypted: false,
            target_encrypted: false,
        }
    }

    #[test]
    fn unmodified_batch_passes_through_byte_identically() {
        let batch = make_batch(vec![Message::chat("hi")], Compression::None);
        let raw = batch.raw().to_vec();

        let mut bridge = BatchBridge::new();
        let mut tracker = EntityTracker::new();
        let hooks = HookChain::new();
        let action = bridge.process(batch, &hooks, &mut ctx(None, &mut tracker));

        match action {
            BridgeAction::PassThrough(bytes) => assert_eq!(bytes, raw),
            other => panic!("expected pass-through, got {other:?}"),
        }
        assert_eq!(bridge.metrics().batches_passed_through, 1);
    }

    #[test]
    fn rewritten_batch_is_reencoded() {
        let batch = make_batch(
            vec![Message::new(
                MessageKind::EntityEvent,
                vec![Field::EntityId(42)],
            )],
            Compression::None,
        );
        let rewrite = tables(42);

        let mut bridge = BatchBridge::new();
        let mut tracker = EntityTracker::new();
        let hooks = HookChain::new();
        let action = bridge.process(batch, &hooks, &mut ctx(Some(&rewrite), &mut tracker));

        match action {
            BridgeAction::Reencode { messages, .. } => {
                assert_eq!(messages[0].entity_id(), Some(RESERVED_ENTITY_ID_BASE));
            }
            other => panic!("expected re-encode, got {other:?}"),
        }
        assert_eq!(bridge.metrics().batches_reencoded, 1);
    }

    #[test]
    fn compression_mismatch_forces_reencode() {
        let batch = make_batch(vec![Message::chat("hi")], Compression::Zlib);
        let mut bridge = BatchBridge::new();
        let mut tracker = EntityTracker::new();
        let hooks = HookChain::new();
        let mut context = ctx(None, &mut tracker);
        context.target_compression = Compression::None;

        let action = bridge.process(batch, &hooks, &mut context);
        assert!(matches!(action, BridgeAction::Reencode { .. }));
    }

    #[test]
    fn encryption_mismatch_forces_reencode() {
        let batch = make_batch(vec![Message::chat("hi")], Compression::None);
        let mut bridge = BatchBridge::new();
        let mut tracker = EntityTracker::new();
        let hooks = HookChain::new();
        let mut context = ctx(None, &mut tracker);
        context.source_encrypted = true;
        context.target_encrypted = false;

        let action = bridge.process(batch, &hooks, &mut context);
        assert!(matches!(action, BridgeAction::Reencode { .. }));
    }

    struct FailOnChat;

    impl ProtocolHook for FailOnChat {
        fn name(&self) -> &'static str {
            "fail_on_chat"
        }

        fn handle(
            &self,
            _ctx: &HookContext,
            message: &mut Message,
        ) -> Result<HookOutcome, HookError> {
            if message.kind == MessageKind::Chat {
                Err(HookError("synthetic failure".to_string()))
            } else {
                Ok(HookOutcome::Forward)
            }
        }
    }

    #[test]
    fn hook_error_drops_only_that_message() {
        let batch = make_batch(
            vec![
                Message::chat("dropped"),
                Message::new(MessageKind::KeepAlive, vec![]),
            ],
            Compression::None,
        );

        let mut hooks = HookChain::new();
        hooks.register(SessionPhase::Connected, Arc::new(FailOnChat));

        let mut bridge = BatchBridge::new();
        let mut tracker = EntityTracker::new();
        let action = bridge.process(batch, &hooks, &mut ctx(None, &mut tracker));

        match action {
            BridgeAction::Reencode { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].kind, MessageKind::KeepAlive);
            }
            other => panic!("expected re-encode, got {other:?}"),
        }
        assert_eq!(bridge.metrics().messages_dropped, 1);
    }

    #[test]
    fn fully_cancelled_batch_is_dropped() {
        struct CancelAll;
        impl ProtocolHook for CancelAll {
            fn name(&self) -> &'static str {
                "cancel_all"
            }
            fn handle(
                &self,
                _ctx: &HookContext,
                _message: &mut Message,
            ) -> Result<HookOutcome, HookError> {
                Ok(HookOutcome::Cancel)
            }
        }

        let batch = make_batch(vec![Message::chat("a"), Message::chat("b")], Compression::None);
        let mut hooks = HookChain::new();
        hooks.register(SessionPhase::Connected, Arc::new(CancelAll));

        let mut bridge = BatchBridge::new();
        let mut tracker = EntityTracker::new();
        let action = bridge.process(batch, &hooks, &mut ctx(None, &mut tracker));
        assert!(matches!(action, BridgeAction::Drop));
        assert_eq!(bridge.metrics().messages_dropped, 2);
    }

    #[test]
    fn client_bound_traffic_updates_tracker() {
        let batch = make_batch(
            vec![Message::new(
                MessageKind::EntitySpawn,
                vec![Field::EntityId(42)],
            )],
            Compression::None,
        );
        let rewrite = tables(42);
        let mut bridge = BatchBridge::new();
        let mut tracker = EntityTracker::new();
        let hooks = HookChain::new();
        bridge.process(batch, &hooks, &mut ctx(Some(&rewrite), &mut tracker));

        // Tracked in client space, after rewrite.
        assert!(tracker.entities().contains(&RESERVED_ENTITY_ID_BASE));
    }
}
