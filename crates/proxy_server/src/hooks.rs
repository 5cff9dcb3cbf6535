//! Protocol hook chain.
//!
//! Hooks are the plugin-visible seam in the bridge: an ordered list of
//! handlers that may inspect or mutate each message before it is forwarded,
//! registered per session phase. Cancellation is an explicit outcome value,
//! never an error or an exception-like control-flow signal.

use std::sync::Arc;

use proxy_protocol::Message;

use crate::error::HookError;
use crate::types::{Direction, PlayerId, SessionPhase};

/// What a hook decided about one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Forward the message, unmodified by this hook.
    Forward,
    /// Forward the message; this hook mutated its fields.
    Modified,
    /// Do not forward this message. A cancellation signal, not an error.
    Cancel,
}

/// Per-message context handed to each hook.
#[derive(Debug, Clone, Copy)]
pub struct HookContext {
    /// The session the message belongs to.
    pub player_id: PlayerId,
    /// The session phase whose chain is running.
    pub phase: SessionPhase,
    /// Which way the message is flowing.
    pub direction: Direction,
}

/// A protocol hook observing and transforming messages in flight.
///
/// A returned [`HookError`] aborts processing of that one message only; it
/// is dropped and logged, and the rest of the batch continues.
pub trait ProtocolHook: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Handles one message, possibly mutating it in place.
    fn handle(&self, ctx: &HookContext, message: &mut Message) -> Result<HookOutcome, HookError>;
}

/// Ordered hook registrations, per session phase.
#[derive(Default)]
pub struct HookChain {
    login: Vec<Arc<dyn ProtocolHook>>,
    connected: Vec<Arc<dyn ProtocolHook>>,
    transferring: Vec<Arc<dyn ProtocolHook>>,
}

impl HookChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook at the end of one phase's chain.
    pub fn register(&mut self, phase: SessionPhase, hook: Arc<dyn ProtocolHook>) {
        self.chain_mut(phase).push(hook);
    }

    /// Registers a hook for every phase.
    pub fn register_all_phases(&mut self, hook: Arc<dyn ProtocolHook>) {
        self.login.push(hook.clone());
        self.connected.push(hook.clone());
        self.transferring.push(hook);
    }

    /// The hooks that run for a given phase, in registration order.
    pub fn hooks_for(&self, phase: SessionPhase) -> &[Arc<dyn ProtocolHook>] {
        match phase {
            SessionPhase::Login => &self.login,
            SessionPhase::Connected => &self.connected,
            SessionPhase::Transferring => &self.transferring,
        }
    }

    fn chain_mut(&mut self, phase: SessionPhase) -> &mut Vec<Arc<dyn ProtocolHook>> {
        match phase {
            SessionPhase::Login => &mut self.login,
            SessionPhase::Connected => &mut self.connected,
            SessionPhase::Transferring => &mut self.transferring,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_protocol::MessageKind;

    struct CancelChat;

    impl ProtocolHook for CancelChat {
        fn name(&self) -> &'static str {
            "cancel_chat"
        }

        fn handle(
            &self,
            _ctx: &HookContext,
            message: &mut Message,
        ) -> Result<HookOutcome, HookError> {
            if message.kind == MessageKind::Chat {
                Ok(HookOutcome::Cancel)
            } else {
                Ok(HookOutcome::Forward)
            }
        }
    }

    #[test]
    fn hooks_register_per_phase() {
        let mut chain = HookChain::new();
        chain.register(SessionPhase::Connected, Arc::new(CancelChat));
        assert_eq!(chain.hooks_for(SessionPhase::Connected).len(), 1);
        assert!(chain.hooks_for(SessionPhase::Login).is_empty());
        assert!(chain.hooks_for(SessionPhase::Transferring).is_empty());
    }

    #[test]
    fn register_all_phases_covers_every_chain() {
        let mut chain = HookChain::new();
        chain.register_all_phases(Arc::new(CancelChat));
        for phase in [
            SessionPhase::Login,
            SessionPhase::Connected,
            SessionPhase::Transferring,
        ] {
            assert_eq!(chain.hooks_for(phase).len(), 1);
        }
    }
}
