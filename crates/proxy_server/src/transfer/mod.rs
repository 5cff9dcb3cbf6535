//! The backend transfer handshake.
//!
//! Moving a player between backends without a client reconnect is a
//! three-step dance. The new backend is dialed and its traffic quarantined.
//! The client is immediately sent a dimension change into a throwaway
//! dimension, which forces it to discard the old world's state (a change
//! into the dimension it already occupies would be a client-side no-op, so
//! the throwaway differs from both the current and the target dimension).
//! When the client acknowledges, the real target dimension goes out along
//! with synthesized removals of all tracked transient state. The second
//! acknowledgement is the synchronization point: the quarantine releases,
//! the new backend is told the player is live, and the session's backend
//! link swaps.
//!
//! The phase sequence for one transfer is strictly
//! `Reset -> Phase1 -> Phase2 -> Reset`, where `Reset` means no transfer
//! is pending. Acks arriving in `Reset` belong to gameplay and are
//! forwarded, never consumed here.

use std::sync::Arc;

use proxy_protocol::{codec, Message, MessageKind};
use tracing::{debug, info, warn};

use crate::backend::Link;
use crate::bridge::transfer_queue::TransferQueue;
use crate::bridge::{run_pipeline, BridgeContext};
use crate::context::ProxyContext;
use crate::error::{ProxyError, TransferError};
use crate::events::{
    TransferCompletedEvent, TransferFailedEvent, TransferStartedEvent, TRANSFER_COMPLETED,
    TRANSFER_FAILED, TRANSFER_STARTED,
};
use crate::rewrite::RewriteTables;
use crate::session::tracker::EntityTracker;
use crate::session::Session;
use crate::types::{current_timestamp, Direction, SessionPhase};

/// Where a session stands in the transfer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// No transfer pending. Never stored on a live state machine; it is
    /// what [`Session::transfer_phase`] reports between transfers.
    Reset,
    /// Throwaway dimension change sent, awaiting the client's ack.
    Phase1,
    /// Real dimension change sent, awaiting the final ack.
    Phase2,
}

/// State owned by one in-flight transfer.
pub struct TransferStateMachine {
    /// Registry name of the backend being transferred to.
    pub target_backend: String,
    /// Link to the new backend.
    pub link: Arc<dyn Link>,
    /// Current handshake phase, always `Phase1` or `Phase2`.
    pub phase: TransferPhase,
    /// Dimension the player lands in, supplied by the transfer's caller.
    pub target_dimension: i32,
    /// Quarantined traffic from the new backend.
    pub queue: TransferQueue,
    /// Rewrite tables built from the new backend's world-init.
    pub rewrite: Option<RewriteTables>,
    /// World state of the new backend, observed as its traffic is
    /// quarantined. Becomes the session's tracker at completion.
    pub tracker: EntityTracker,
    /// True once this transfer is itself a fallback attempt; a failed
    /// fallback disconnects instead of chaining further.
    pub fallback_attempt: bool,
}

impl TransferStateMachine {
    /// True while the client owes a dimension ack.
    pub fn awaiting_ack(&self) -> bool {
        matches!(self.phase, TransferPhase::Phase1 | TransferPhase::Phase2)
    }
}

/// Picks a dimension the client is guaranteed to actually change into.
///
/// Must differ from both the current and the target dimension; the first
/// fitting value from the conventional set is used.
fn throwaway_dimension(current: i32, target: i32) -> i32 {
    [-1, 1, 0]
        .into_iter()
        .find(|&d| d != current && d != target)
        .unwrap_or(-1)
}

/// Starts a transfer to `target`, landing the player in `target_dimension`.
///
/// Dials the backend, installs the quarantine, and immediately walks the
/// client into the throwaway dimension. On a connect failure the
/// configured fallback backend is tried once before the error is returned.
/// A transfer to the backend the player is already on is a no-op.
pub async fn initiate_transfer(
    session: &mut Session,
    ctx: &ProxyContext,
    target: &str,
    target_dimension: i32,
) -> Result<(), ProxyError> {
    if session.pending_transfer.is_some() {
        return Err(TransferError::AlreadyPending.into());
    }
    if target == session.backend_name {
        debug!(player = %session.player_id, backend = target, "already on target backend");
        return Ok(());
    }

    let mut target = target.to_string();
    let mut is_fallback = false;
    loop {
        match connect_and_install(session, ctx, &target, target_dimension, is_fallback).await {
            Ok(()) => return send_throwaway_change(session).await,
            Err(error) => {
                warn!(
                    player = %session.player_id,
                    backend = %target,
                    "transfer initiation failed: {error}"
                );
                let _ = ctx
                    .events
                    .emit(
                        TRANSFER_FAILED,
                        &TransferFailedEvent::now(
                            session.player_id,
                            target.as_str(),
                            error.to_string(),
                        ),
                    )
                    .await;
                if !is_fallback {
                    if let Some(fallback) = ctx.registry.fallback_for(session.player_id, &target) {
                        target = fallback;
                        is_fallback = true;
                        continue;
                    }
                }
                return Err(error.into());
            }
        }
    }
}

/// Dials `target` and installs the pending machine in `Phase1`.
async fn connect_and_install(
    session: &mut Session,
    ctx: &ProxyContext,
    target: &str,
    target_dimension: i32,
    fallback_attempt: bool,
) -> Result<(), TransferError> {
    let addr = ctx
        .registry
        .resolve(target)
        .ok_or_else(|| TransferError::UnknownBackend(target.to_string()))?;
    let link = ctx.connector.connect(addr).await?;

    let settings = &ctx.config.transfer;
    session.pending_transfer = Some(TransferStateMachine {
        target_backend: target.to_string(),
        link,
        phase: TransferPhase::Phase1,
        target_dimension,
        queue: TransferQueue::new(
            settings.queue_capacity,
            settings.transient_denylist.clone(),
        ),
        rewrite: None,
        tracker: EntityTracker::suspended(),
        fallback_attempt,
    });
    session.phase = SessionPhase::Transferring;

    info!(
        player = %session.player_id,
        from = %session.backend_name,
        to = target,
        "transfer started"
    );
    let _ = ctx
        .events
        .emit(
            TRANSFER_STARTED,
            &TransferStartedEvent {
                player_id: session.player_id,
                from_backend: session.backend_name.clone(),
                to_backend: target.to_string(),
                timestamp: current_timestamp(),
            },
        )
        .await;
    Ok(())
}

/// Walks the client into the throwaway dimension, opening phase 1.
async fn send_throwaway_change(session: &mut Session) -> Result<(), ProxyError> {
    let throwaway = match session.pending_transfer.as_ref() {
        Some(machine) => throwaway_dimension(session.dimension, machine.target_dimension),
        None => return Ok(()),
    };
    debug!(
        player = %session.player_id,
        dimension = throwaway,
        "dimension swap started"
    );
    session
        .send_to_client(&[Message::dimension_change(throwaway)])
        .await?;
    // The client-visible dimension tracks what was last sent, so a
    // fallback handshake picks a throwaway that still forces a change.
    session.dimension = throwaway;
    Ok(())
}

/// Handles one frame from the pending backend's link.
///
/// The world-init builds the rewrite tables for the connection; everything
/// else runs through the hook/rewrite pipeline and is then quarantined, so
/// queued messages sit in client space and a hook-cancelled message never
/// counts against the quarantine bound. A quarantine overflow fails the
/// whole transfer, because dropping arbitrary world state would leave the
/// client inconsistent, and a backend-sent disconnect fails it too.
pub async fn handle_pending_backend_batch(
    session: &mut Session,
    ctx: &ProxyContext,
    frame: Vec<u8>,
) -> Result<(), ProxyError> {
    if session.closed {
        return Ok(());
    }
    let batch = codec::decode_batch(&frame)?;
    let (messages, _, _) = batch.into_parts();

    let player_id = session.player_id;
    let proxy_entity_id = session.proxy_entity_id;
    let client_compression = session.client.compression();
    let client_encrypted = session.client.encryption_enabled();

    let mut failure = None;
    {
        let machine = match session.pending_transfer.as_mut() {
            Some(machine) => machine,
            None => return Ok(()),
        };

        let mut arriving = Vec::with_capacity(messages.len());
        for message in messages {
            if machine.rewrite.is_none() && message.kind == MessageKind::WorldInit {
                match RewriteTables::from_world_init(proxy_entity_id, &message, &ctx.palettes) {
                    Some(tables) => {
                        debug!(
                            player = %player_id,
                            backend = %machine.target_backend,
                            backend_entity_id = tables.entity().backend_id(),
                            "pending backend announced its world"
                        );
                        machine.rewrite = Some(tables);
                        machine.tracker.resume();
                    }
                    None => {
                        warn!(
                            player = %player_id,
                            "pending world init carries no entity id"
                        );
                    }
                }
                // The client is already initialized; it gets dimension
                // changes instead of a second world-init.
                continue;
            }
            if message.kind == MessageKind::Disconnect {
                failure = Some(TransferError::BackendDisconnect {
                    backend: machine.target_backend.clone(),
                    reason: message.text().unwrap_or("no reason given").to_string(),
                });
                break;
            }
            arriving.push(message);
        }

        if failure.is_none() && !arriving.is_empty() {
            let mut bridge_ctx = BridgeContext {
                player_id,
                phase: SessionPhase::Transferring,
                direction: Direction::BackendToClient,
                rewrite: machine.rewrite.as_ref(),
                tracker: &mut machine.tracker,
                target_compression: client_compression,
                source_encrypted: machine.link.encryption_enabled(),
                target_encrypted: client_encrypted,
            };
            let result = run_pipeline(arriving, &ctx.hooks, &mut bridge_ctx);
            for survivor in result.surviving {
                if let Err(error) = machine.queue.enqueue(survivor) {
                    failure = Some(error);
                    break;
                }
            }
        }
    }

    if let Some(error) = failure {
        let machine = session
            .pending_transfer
            .take()
            .ok_or_else(|| ProxyError::Internal("failure without pending transfer".to_string()))?;
        return fail_transfer(session, ctx, machine, error).await;
    }
    Ok(())
}

/// Advances the handshake on a client dimension ack.
///
/// An ack with no transfer pending is not an error; the caller forwards it
/// as ordinary gameplay.
pub async fn handle_dimension_ack(
    session: &mut Session,
    ctx: &ProxyContext,
) -> Result<(), ProxyError> {
    let phase = match session.pending_transfer.as_ref() {
        Some(machine) => machine.phase,
        None => return Ok(()),
    };
    match phase {
        TransferPhase::Reset => Ok(()),
        TransferPhase::Phase1 => {
            let target = {
                let machine = match session.pending_transfer.as_mut() {
                    Some(machine) => machine,
                    None => return Ok(()),
                };
                machine.phase = TransferPhase::Phase2;
                machine.target_dimension
            };
            // The old world is gone from the client's point of view; every
            // tracked piece of transient state must be explicitly erased
            // before the new world streams in.
            let mut messages = session.tracker.synthesize_reset();
            messages.push(Message::dimension_change(target));
            session.tracker.clear();
            session.send_to_client(&messages).await?;
            session.dimension = target;
            Ok(())
        }
        TransferPhase::Phase2 => complete_transfer(session, ctx).await,
    }
}

/// Final step: release the quarantine, greet the new backend, swap links.
async fn complete_transfer(session: &mut Session, ctx: &ProxyContext) -> Result<(), ProxyError> {
    let machine = match session.pending_transfer.take() {
        Some(machine) => machine,
        None => return Ok(()),
    };

    // The new backend may have died while the client was acking.
    if !machine.link.is_open() {
        let backend = machine.target_backend.clone();
        return fail_transfer(
            session,
            ctx,
            machine,
            TransferError::BackendClosed(backend),
        )
        .await;
    }
    if machine.rewrite.is_none() {
        let backend = machine.target_backend.clone();
        return fail_transfer(
            session,
            ctx,
            machine,
            TransferError::BackendDisconnect {
                backend,
                reason: "world init missing at completion".to_string(),
            },
        )
        .await;
    }

    let TransferStateMachine {
        target_backend,
        link,
        target_dimension,
        mut queue,
        rewrite,
        tracker,
        fallback_attempt,
        ..
    } = machine;
    let Some(rewrite) = rewrite else {
        return Err(ProxyError::Internal(
            "transfer completed without rewrite tables".to_string(),
        ));
    };

    // The quarantine already holds hook-filtered, client-space messages;
    // replay them in arrival order.
    let released = queue.release();
    let queued_count = released.len();
    if !released.is_empty() {
        session.send_to_client(&released).await?;
    }

    // Tell the new backend its player is live before gameplay flows.
    let greeting = codec::encode_batch(&[Message::player_initialized()], link.compression())?;
    if let Err(error) = link.send_batch(greeting).await {
        warn!(
            player = %session.player_id,
            backend = %target_backend,
            "new backend rejected completion: {error}"
        );
        link.close().await;
        return fallback_or_disconnect(
            session,
            ctx,
            &target_backend,
            target_dimension,
            fallback_attempt,
            "backend closed during completion",
        )
        .await;
    }

    // Swap. The old link is closed only now, so a failed completion never
    // touches it.
    let old = std::mem::replace(&mut session.backend, link);
    old.close().await;
    session.backend_name = target_backend.clone();
    session.rewrite = Some(rewrite);
    // The machine's tracker saw everything quarantined; it is the new
    // world's registry from here on.
    session.tracker = tracker;
    session.backend_generation += 1;
    session.phase = SessionPhase::Connected;
    session.dimension = target_dimension;

    info!(
        player = %session.player_id,
        backend = %target_backend,
        released = queued_count,
        "transfer completed"
    );
    let _ = ctx
        .events
        .emit(
            TRANSFER_COMPLETED,
            &TransferCompletedEvent {
                player_id: session.player_id,
                backend: target_backend,
                timestamp: current_timestamp(),
            },
        )
        .await;
    Ok(())
}

/// Tears down a failed transfer and decides where the player lands.
///
/// The old backend link stays untouched either way; the player is moved to
/// the configured fallback if one exists and has not been tried yet,
/// otherwise disconnected with the reason.
pub async fn fail_transfer(
    session: &mut Session,
    ctx: &ProxyContext,
    mut machine: TransferStateMachine,
    error: TransferError,
) -> Result<(), ProxyError> {
    warn!(
        player = %session.player_id,
        backend = %machine.target_backend,
        phase = ?machine.phase,
        "transfer failed: {error}"
    );
    machine.queue.discard();
    machine.link.close().await;
    let _ = ctx
        .events
        .emit(
            TRANSFER_FAILED,
            &TransferFailedEvent::now(
                session.player_id,
                machine.target_backend.clone(),
                error.to_string(),
            ),
        )
        .await;

    fallback_or_disconnect(
        session,
        ctx,
        &machine.target_backend,
        machine.target_dimension,
        machine.fallback_attempt,
        &error.to_string(),
    )
    .await
}

/// One silent fallback attempt, then disconnect.
async fn fallback_or_disconnect(
    session: &mut Session,
    ctx: &ProxyContext,
    failed_backend: &str,
    target_dimension: i32,
    fallback_attempt: bool,
    reason: &str,
) -> Result<(), ProxyError> {
    session.phase = SessionPhase::Connected;
    if !fallback_attempt {
        if let Some(fallback) = ctx.registry.fallback_for(session.player_id, failed_backend) {
            let _ = session
                .send_to_client(&[Message::chat(format!(
                    "Could not connect to {failed_backend}, sending you to {fallback}"
                ))])
                .await;
            match connect_and_install(session, ctx, &fallback, target_dimension, true).await {
                Ok(()) => return send_throwaway_change(session).await,
                Err(error) => {
                    warn!(
                        player = %session.player_id,
                        backend = %fallback,
                        "fallback failed: {error}"
                    );
                }
            }
        }
    }

    let reason = format!("Lost connection to {failed_backend}: {reason}");
    let _ = session.send_to_client(&[Message::disconnect(reason.clone())]).await;
    session.close(ctx, Some(reason)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throwaway_differs_from_current_and_target() {
        assert_eq!(throwaway_dimension(0, 0), -1);
        assert_eq!(throwaway_dimension(-1, -1), 1);
        assert_eq!(throwaway_dimension(-1, 1), 0);
        assert_eq!(throwaway_dimension(1, 0), -1);
        for (current, target) in [(0, 0), (-1, -1), (1, 1), (0, 1), (-1, 0)] {
            let throwaway = throwaway_dimension(current, target);
            assert_ne!(throwaway, current);
            assert_ne!(throwaway, target);
        }
    }
}
