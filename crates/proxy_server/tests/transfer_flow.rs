//! End-to-end transfer tests over in-memory links.
//!
//! Sessions are driven directly by feeding frames into their handlers, the
//! way the pump tasks do, with fake links capturing everything the proxy
//! sends to either peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use proxy_protocol::{codec, Compression, Field, Message, MessageKind};
use proxy_server::backend::{Connector, Link, StaticRegistry};
use proxy_server::events::{TransferCompletedEvent, TransferFailedEvent, TRANSFER_COMPLETED, TRANSFER_FAILED};
use proxy_server::transfer;
use proxy_server::{
    BackendSettings, HookChain, HookContext, HookError, HookOutcome, PaletteCatalog, PlayerId,
    ProtocolHook, ProxyConfig, ProxyContext, ProxyError, Session, SessionPhase, TransferError,
    TransferPhase,
};

struct FakeLink {
    compression: Compression,
    open: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl FakeLink {
    fn new(compression: Compression) -> Arc<Self> {
        Arc::new(Self {
            compression,
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Every message sent over this link, flattened across batches.
    fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .flat_map(|frame| {
                codec::decode_batch(frame)
                    .expect("sent frames are well-formed")
                    .into_parts()
                    .0
            })
            .collect()
    }

    /// The messages of the most recently sent batch.
    fn last_batch(&self) -> Vec<Message> {
        let frames = self.sent.lock().unwrap();
        let frame = frames.last().expect("at least one batch was sent");
        codec::decode_batch(frame).unwrap().into_parts().0
    }

    fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Link for FakeLink {
    async fn send_batch(&self, frame: Vec<u8>) -> Result<(), ProxyError> {
        if !self.is_open() {
            return Err(ProxyError::Network("link is closed".to_string()));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv_batch(&self) -> Result<Option<Vec<u8>>, ProxyError> {
        Ok(None)
    }

    fn compression(&self) -> Compression {
        self.compression
    }

    fn encryption_enabled(&self) -> bool {
        false
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

struct FakeConnector {
    links: Mutex<HashMap<SocketAddr, Arc<FakeLink>>>,
}

impl FakeConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(HashMap::new()),
        })
    }

    fn stage(&self, addr: &str, link: Arc<FakeLink>) {
        self.links
            .lock()
            .unwrap()
            .insert(addr.parse().unwrap(), link);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn Link>, TransferError> {
        self.links
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .map(|link| link as Arc<dyn Link>)
            .ok_or_else(|| TransferError::ConnectTimeout(addr.to_string()))
    }
}

const LOBBY_ADDR: &str = "10.9.0.1:25566";
const ARENA_ADDR: &str = "10.9.0.2:25566";
const HUB_ADDR: &str = "10.9.0.3:25566";

fn test_config() -> ProxyConfig {
    ProxyConfig {
        backends: vec![
            BackendSettings {
                name: "lobby".to_string(),
                address: LOBBY_ADDR.parse().unwrap(),
                fallback: None,
            },
            BackendSettings {
                name: "arena".to_string(),
                address: ARENA_ADDR.parse().unwrap(),
                fallback: Some("hub".to_string()),
            },
            BackendSettings {
                name: "hub".to_string(),
                address: HUB_ADDR.parse().unwrap(),
                fallback: None,
            },
        ],
        ..ProxyConfig::default()
    }
}

fn context(config: ProxyConfig, connector: Arc<FakeConnector>, hooks: HookChain) -> ProxyContext {
    let registry = Arc::new(StaticRegistry::from_config(&config));
    ProxyContext::new(config, registry, connector, hooks, PaletteCatalog::identity())
}

fn frame(messages: &[Message]) -> Vec<u8> {
    codec::encode_batch(messages, Compression::None).unwrap()
}

fn world_init(entity_id: i32, dimension: i32) -> Message {
    Message::new(
        MessageKind::WorldInit,
        vec![
            Field::EntityId(entity_id),
            Field::UInt(0),
            Field::Dimension(dimension),
        ],
    )
}

fn spawn(entity_id: i32) -> Message {
    Message::new(MessageKind::EntitySpawn, vec![Field::EntityId(entity_id)])
}

struct Harness {
    ctx: ProxyContext,
    session: Session,
    client: Arc<FakeLink>,
    lobby: Arc<FakeLink>,
    connector: Arc<FakeConnector>,
}

/// A session connected to "lobby", world already initialized with backend
/// entity id 42 in dimension 0.
async fn connected_session(config: ProxyConfig) -> Harness {
    connected_session_with_hooks(config, HookChain::new()).await
}

async fn connected_session_with_hooks(config: ProxyConfig, hooks: HookChain) -> Harness {
    let connector = FakeConnector::new();
    let ctx = context(config, connector.clone(), hooks);
    let client = FakeLink::new(Compression::None);
    let lobby = FakeLink::new(Compression::None);
    let mut session = Session::new(
        PlayerId::new(),
        ctx.entity_ids.allocate(),
        client.clone(),
        lobby.clone(),
        "lobby".to_string(),
    );
    session
        .handle_backend_frame(&ctx, 0, frame(&[world_init(42, 0)]))
        .await
        .unwrap();
    Harness {
        ctx,
        session,
        client,
        lobby,
        connector,
    }
}

#[tokio::test]
async fn world_init_builds_rewrite_and_bridges_ids() {
    let mut h = connected_session(test_config()).await;
    let proxy_id = h.session.proxy_entity_id;

    // Backend-assigned id 42 reaches the client as the proxy-stable id.
    h.session
        .handle_backend_frame(&h.ctx, 0, frame(&[spawn(42)]))
        .await
        .unwrap();
    let to_client = h.client.last_batch();
    assert_eq!(to_client.last().unwrap().entity_id(), Some(proxy_id));

    // And the client's references translate back to the backend's id.
    h.session
        .handle_client_frame(
            &h.ctx,
            frame(&[Message::new(
                MessageKind::EntityMove,
                vec![Field::EntityId(proxy_id)],
            )]),
        )
        .await
        .unwrap();
    assert_eq!(h.lobby.last_batch()[0].entity_id(), Some(42));
}

#[tokio::test]
async fn untouched_batches_pass_through_byte_identically() {
    let mut h = connected_session(test_config()).await;

    let original = frame(&[Message::chat("hello"), Message::new(MessageKind::KeepAlive, vec![])]);
    h.session
        .handle_backend_frame(&h.ctx, 0, original.clone())
        .await
        .unwrap();
    assert_eq!(h.client.sent_frames().last().unwrap(), &original);
}

#[tokio::test]
async fn full_transfer_with_same_dimension_hops_through_throwaway() {
    let mut h = connected_session(test_config()).await;
    let arena = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());

    let completed = Arc::new(AtomicUsize::new(0));
    let completed_clone = completed.clone();
    h.ctx
        .events
        .on(TRANSFER_COMPLETED, move |_: TransferCompletedEvent| {
            completed_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    // Initiating immediately walks the client into a throwaway dimension,
    // distinct from both the current world and the target.
    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();
    assert_eq!(h.session.transfer_phase(), TransferPhase::Phase1);
    let first_swap = h.client.last_batch();
    let throwaway = first_swap.last().unwrap();
    assert_eq!(throwaway.kind, MessageKind::DimensionChange);
    assert_ne!(throwaway.dimension(), Some(0));

    // The new backend's traffic is quarantined while the client acks; its
    // world-init only builds the rewrite tables.
    transfer::handle_pending_backend_batch(
        &mut h.session,
        &h.ctx,
        frame(&[world_init(7, 0), spawn(100)]),
    )
    .await
    .unwrap();
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&[spawn(101)]))
        .await
        .unwrap();

    // First ack: the real dimension change goes out.
    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();
    assert_eq!(h.session.transfer_phase(), TransferPhase::Phase2);
    let second_swap = h.client.last_batch();
    assert_eq!(second_swap.last().unwrap().kind, MessageKind::DimensionChange);
    assert_eq!(second_swap.last().unwrap().dimension(), Some(0));

    // Second ack: quarantine releases in order, the new backend is greeted,
    // and the session's backend swaps.
    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();
    assert_eq!(h.session.transfer_phase(), TransferPhase::Reset);

    let released = h.client.last_batch();
    let ids: Vec<_> = released.iter().filter_map(Message::entity_id).collect();
    assert_eq!(ids, vec![100, 101]);

    assert_eq!(arena.sent_messages()[0].kind, MessageKind::PlayerInitialized);
    assert_eq!(h.session.backend_name, "arena");
    assert_eq!(h.session.backend_generation, 1);
    assert!(h.session.pending_transfer.is_none());
    assert!(!h.lobby.is_open());
    assert!(!h.session.closed);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_target_dimension_still_takes_both_phases() {
    let mut h = connected_session(test_config()).await;
    let arena = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());

    // Current dimension 0, target -1: the throwaway must avoid both.
    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", -1)
        .await
        .unwrap();
    let throwaway = h.client.last_batch();
    assert_eq!(throwaway[0].dimension(), Some(1));

    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&[world_init(7, -1)]))
        .await
        .unwrap();

    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();
    assert_eq!(h.client.last_batch().last().unwrap().dimension(), Some(-1));
    assert_eq!(h.session.transfer_phase(), TransferPhase::Phase2);

    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();
    assert_eq!(h.session.backend_name, "arena");
    assert_eq!(h.session.dimension, -1);
    assert!(h.session.pending_transfer.is_none());
}

#[tokio::test]
async fn quarantine_overflow_fails_over_to_the_fallback() {
    let mut config = test_config();
    config.transfer.queue_capacity = 4;
    let mut h = connected_session(config).await;
    let arena = FakeLink::new(Compression::None);
    let hub = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());
    h.connector.stage(HUB_ADDR, hub.clone());

    let failed = Arc::new(AtomicUsize::new(0));
    let failed_clone = failed.clone();
    h.ctx
        .events
        .on(TRANSFER_FAILED, move |_: TransferFailedEvent| {
            failed_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();

    // Arena never sends its world-init; flood the quarantine past its
    // capacity instead.
    let flood: Vec<Message> = (0..10).map(spawn).collect();
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&flood))
        .await
        .unwrap();

    // The client already left the old world, so the failure rolls over to
    // the configured fallback: arena is torn down, hub is now pending, and
    // the old lobby link was never touched.
    let pending = h.session.pending_transfer.as_ref().expect("fallback pending");
    assert_eq!(pending.target_backend, "hub");
    assert!(pending.fallback_attempt);
    assert!(!arena.is_open());
    assert!(h.lobby.is_open());
    assert!(!h.session.closed);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert!(h
        .client
        .sent_messages()
        .iter()
        .any(|m| m.kind == MessageKind::Chat));
}

struct CancelChat;

impl ProtocolHook for CancelChat {
    fn name(&self) -> &'static str {
        "cancel_chat"
    }

    fn handle(&self, _ctx: &HookContext, message: &mut Message) -> Result<HookOutcome, HookError> {
        if message.kind == MessageKind::Chat {
            Ok(HookOutcome::Cancel)
        } else {
            Ok(HookOutcome::Forward)
        }
    }
}

#[tokio::test]
async fn quarantine_holds_hook_filtered_client_space_messages() {
    let mut config = test_config();
    config.transfer.queue_capacity = 4;
    let mut hooks = HookChain::new();
    hooks.register(SessionPhase::Transferring, Arc::new(CancelChat));
    let mut h = connected_session_with_hooks(config, hooks).await;
    let arena = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());

    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&[world_init(7, 0)]))
        .await
        .unwrap();

    // Hooks run before the quarantine bound is charged: cancelled messages
    // far beyond the capacity cause no overflow.
    let chatter: Vec<Message> = (0..10).map(|i| Message::chat(format!("spam {i}"))).collect();
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&chatter))
        .await
        .unwrap();
    assert!(h.session.pending_transfer.is_some());

    // The new backend's own player id is rewritten before queueing.
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&[spawn(7)]))
        .await
        .unwrap();

    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();
    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();

    let released = h.client.last_batch();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].entity_id(), Some(h.session.proxy_entity_id));
    // The released spawn is already registered for the new world.
    assert!(h.session.tracker.entities().contains(&h.session.proxy_entity_id));
}

#[tokio::test]
async fn pending_backend_disconnect_fails_the_transfer() {
    let mut h = connected_session(test_config()).await;
    let arena = FakeLink::new(Compression::None);
    let hub = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());
    h.connector.stage(HUB_ADDR, hub.clone());

    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();
    transfer::handle_pending_backend_batch(
        &mut h.session,
        &h.ctx,
        frame(&[world_init(7, 0), Message::disconnect("server closing")]),
    )
    .await
    .unwrap();

    // The disconnect fails the transfer instead of reaching the client:
    // the fallback is dialed and the old lobby link stays authoritative.
    let pending = h.session.pending_transfer.as_ref().expect("fallback pending");
    assert_eq!(pending.target_backend, "hub");
    assert!(!arena.is_open());
    assert!(h.lobby.is_open());
    assert!(!h.session.closed);
    assert!(h
        .client
        .sent_messages()
        .iter()
        .all(|m| m.kind != MessageKind::Disconnect));
}

#[tokio::test]
async fn extra_ack_in_the_final_batch_is_forwarded_as_gameplay() {
    let mut h = connected_session(test_config()).await;
    let arena = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());

    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&[world_init(7, 0)]))
        .await
        .unwrap();
    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();

    // Two acks in one batch: the first completes the handshake, the second
    // is ordinary gameplay for the new backend.
    h.session
        .handle_client_frame(
            &h.ctx,
            frame(&[Message::dimension_ack(), Message::dimension_ack()]),
        )
        .await
        .unwrap();

    assert!(h.session.pending_transfer.is_none());
    let to_arena = arena.sent_messages();
    assert_eq!(to_arena[0].kind, MessageKind::PlayerInitialized);
    assert!(to_arena.iter().any(Message::is_dimension_ack));
}

#[tokio::test]
async fn backend_death_before_final_ack_falls_back_without_touching_old_link() {
    let mut h = connected_session(test_config()).await;
    let arena = FakeLink::new(Compression::None);
    let hub = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());
    h.connector.stage(HUB_ADDR, hub.clone());

    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&[world_init(7, 0)]))
        .await
        .unwrap();
    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();

    // Arena dies between the real dimension change and the final ack.
    arena.close().await;
    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();

    // The client already left the old world, so the configured fallback is
    // dialed; the old lobby link was never swapped or closed.
    let pending = h.session.pending_transfer.as_ref().expect("fallback pending");
    assert_eq!(pending.target_backend, "hub");
    assert!(h.lobby.is_open());
    assert!(!h.session.closed);
}

#[tokio::test]
async fn exhausted_fallback_disconnects_the_player() {
    let mut h = connected_session(test_config()).await;
    let arena = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());
    // "hub" resolves but is not dialable: the fallback attempt fails too.

    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&[world_init(7, 0)]))
        .await
        .unwrap();
    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();

    arena.close().await;
    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();

    assert!(h.session.closed);
    assert!(h
        .client
        .sent_messages()
        .iter()
        .any(|m| m.kind == MessageKind::Disconnect));
}

#[tokio::test]
async fn spurious_ack_is_forwarded_as_gameplay() {
    let mut h = connected_session(test_config()).await;

    h.session
        .handle_client_frame(&h.ctx, frame(&[Message::dimension_ack()]))
        .await
        .unwrap();
    assert_eq!(h.lobby.last_batch()[0].kind, MessageKind::ClientAction);
}

#[tokio::test]
async fn second_transfer_while_pending_is_rejected() {
    let mut h = connected_session(test_config()).await;
    let arena = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena);

    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();
    let second = transfer::initiate_transfer(&mut h.session, &h.ctx, "hub", 0).await;
    assert!(matches!(
        second,
        Err(ProxyError::Transfer(TransferError::AlreadyPending))
    ));
}

#[tokio::test]
async fn unknown_backend_is_rejected() {
    let mut h = connected_session(test_config()).await;
    let result = transfer::initiate_transfer(&mut h.session, &h.ctx, "void", 0).await;
    assert!(matches!(
        result,
        Err(ProxyError::Transfer(TransferError::UnknownBackend(_)))
    ));
}

#[tokio::test]
async fn session_close_cancels_a_pending_transfer() {
    let mut h = connected_session(test_config()).await;
    let arena = FakeLink::new(Compression::None);
    h.connector.stage(ARENA_ADDR, arena.clone());

    transfer::initiate_transfer(&mut h.session, &h.ctx, "arena", 0)
        .await
        .unwrap();
    transfer::handle_pending_backend_batch(&mut h.session, &h.ctx, frame(&[spawn(100)]))
        .await
        .unwrap();

    h.session.close(&h.ctx, Some("client quit".to_string())).await;
    assert!(h.session.pending_transfer.is_none());
    assert!(!arena.is_open());
    assert!(!h.lobby.is_open());
    assert!(!h.client.is_open());
}
