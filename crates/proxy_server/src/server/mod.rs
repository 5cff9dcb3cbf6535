//! Proxy server: listener setup, accept loops, and session pump tasks.
//!
//! Each session runs on three kinds of tasks: one pump reading the client
//! link, one pump reading whatever the session's current backend link is,
//! and, while a transfer is in flight, one auxiliary pump reading the
//! pending backend link. Pumps hold no session state of their own; they
//! re-fetch the links they read from the session on every iteration, so a
//! backend swap or a fallback retry redirects them without respawning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use proxy_protocol::Compression;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::tcp::TcpLink;
use crate::backend::Link;
use crate::context::ProxyContext;
use crate::error::{ProxyError, TransferError};
use crate::events::{PlayerConnectedEvent, PLAYER_CONNECTED};
use crate::session::Session;
use crate::transfer::{self, TransferStateMachine};
use crate::types::{current_timestamp, PlayerId};

/// Compression spoken on client links.
const CLIENT_COMPRESSION: Compression = Compression::Zlib;
/// Whether client links carry encrypted frames.
const CLIENT_ENCRYPTION: bool = false;

/// The proxy's accept surface and session registry.
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    sessions: Arc<DashMap<PlayerId, Arc<Mutex<Session>>>>,
    shutdown: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Creates a server around an assembled context.
    pub fn new(ctx: ProxyContext) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            ctx: Arc::new(ctx),
            sessions: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// The shared context.
    pub fn context(&self) -> Arc<ProxyContext> {
        self.ctx.clone()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Signals every accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Runs accept loops until shutdown is signalled.
    ///
    /// With `use_reuse_port` enabled one listener is bound per CPU core and
    /// the kernel balances accepts across them; otherwise a single listener
    /// serves all connections.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let loops = if self.ctx.config.use_reuse_port {
            num_cpus::get()
        } else {
            1
        };
        info!(
            bind = %self.ctx.config.bind_address,
            accept_loops = loops,
            "proxy listening"
        );

        let mut accept_loops = FuturesUnordered::new();
        for id in 0..loops {
            let listener = self.create_listener()?;
            let ctx = self.ctx.clone();
            let sessions = self.sessions.clone();
            let mut shutdown = self.shutdown.subscribe();
            accept_loops.push(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            debug!(accept_loop = id, "accept loop stopping");
                            break;
                        }
                        accepted = listener.accept() => match accepted {
                            Ok((stream, addr)) => {
                                handle_connection(ctx.clone(), sessions.clone(), stream, addr)
                                    .await;
                            }
                            Err(e) => {
                                warn!(accept_loop = id, "accept failed: {e}");
                                tokio::time::sleep(Duration::from_millis(50)).await;
                            }
                        }
                    }
                }
            });
        }

        while accept_loops.next().await.is_some() {}
        info!("proxy stopped");
        Ok(())
    }

    /// Requests a transfer of a connected player to another backend,
    /// landing them in `target_dimension`.
    pub async fn transfer_player(
        &self,
        player_id: PlayerId,
        target: &str,
        target_dimension: i32,
    ) -> Result<(), ProxyError> {
        let session = self
            .sessions
            .get(&player_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                ProxyError::Transfer(TransferError::UnknownBackend(format!(
                    "no session for {player_id}"
                )))
            })?;

        {
            let mut guard = session.lock().await;
            transfer::initiate_transfer(&mut guard, &self.ctx, target, target_dimension).await?;
        }
        spawn_pending_pump(self.ctx.clone(), self.sessions.clone(), session, player_id);
        Ok(())
    }

    /// Binds a listener through socket2 so SO_REUSEPORT can be set before
    /// the bind.
    fn create_listener(&self) -> Result<TcpListener, ProxyError> {
        let addr = self.ctx.config.bind_address;
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ProxyError::Network(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ProxyError::Network(e.to_string()))?;
        #[cfg(unix)]
        if self.ctx.config.use_reuse_port {
            socket
                .set_reuse_port(true)
                .map_err(|e| ProxyError::Network(e.to_string()))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| ProxyError::Network(e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| ProxyError::Network(e.to_string()))?;
        socket
            .listen(1024)
            .map_err(|e| ProxyError::Network(e.to_string()))?;
        TcpListener::from_std(socket.into()).map_err(|e| ProxyError::Network(e.to_string()))
    }
}

type Sessions = Arc<DashMap<PlayerId, Arc<Mutex<Session>>>>;

/// Sets up a new session for an accepted client connection.
async fn handle_connection(
    ctx: Arc<ProxyContext>,
    sessions: Sessions,
    stream: TcpStream,
    addr: SocketAddr,
) {
    if sessions.len() >= ctx.config.max_connections {
        warn!(%addr, "connection refused, session limit reached");
        return;
    }
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%addr, "failed to set nodelay: {e}");
    }

    let backend_name = ctx.config.default_backend.clone();
    let backend_addr = match ctx.registry.resolve(&backend_name) {
        Some(addr) => addr,
        None => {
            error!(backend = %backend_name, "default backend not in registry");
            return;
        }
    };
    let backend = match ctx.connector.connect(backend_addr).await {
        Ok(link) => link,
        Err(e) => {
            warn!(%addr, backend = %backend_name, "default backend unreachable: {e}");
            return;
        }
    };

    let player_id = PlayerId::new();
    let proxy_entity_id = ctx.entity_ids.allocate();
    let client: Arc<dyn Link> =
        Arc::new(TcpLink::new(stream, CLIENT_COMPRESSION, CLIENT_ENCRYPTION));
    let session = Arc::new(Mutex::new(Session::new(
        player_id,
        proxy_entity_id,
        client.clone(),
        backend.clone(),
        backend_name,
    )));
    sessions.insert(player_id, session.clone());

    info!(player = %player_id, %addr, "player connected");
    let _ = ctx
        .events
        .emit(
            PLAYER_CONNECTED,
            &PlayerConnectedEvent {
                player_id,
                remote_addr: addr,
                timestamp: current_timestamp(),
            },
        )
        .await;

    tokio::spawn(client_pump(
        ctx.clone(),
        sessions.clone(),
        session.clone(),
        client,
        player_id,
    ));
    tokio::spawn(backend_pump(ctx, sessions, session, player_id));
}

/// Reads the client link until it closes, feeding frames to the session.
async fn client_pump(
    ctx: Arc<ProxyContext>,
    sessions: Sessions,
    session: Arc<Mutex<Session>>,
    client: Arc<dyn Link>,
    player_id: PlayerId,
) {
    let reason = loop {
        match client.recv_batch().await {
            Ok(Some(frame)) => {
                let mut guard = session.lock().await;
                if let Err(e) = guard.handle_client_frame(&ctx, frame).await {
                    warn!(player = %player_id, "client frame failed: {e}");
                    break Some(e.to_string());
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e.to_string()),
        }
    };
    close_session(&ctx, &sessions, &session, player_id, reason).await;
}

/// Reads whatever the session's current backend link is.
///
/// The link and generation are re-fetched every iteration: when a transfer
/// swap closes the old link, the pending read fails, and the next
/// iteration picks up the new link under the new generation.
async fn backend_pump(
    ctx: Arc<ProxyContext>,
    sessions: Sessions,
    session: Arc<Mutex<Session>>,
    player_id: PlayerId,
) {
    loop {
        let (link, generation) = {
            let guard = session.lock().await;
            if guard.closed {
                return;
            }
            (guard.backend.clone(), guard.backend_generation)
        };
        match link.recv_batch().await {
            Ok(Some(frame)) => {
                let mut guard = session.lock().await;
                if let Err(e) = guard.handle_backend_frame(&ctx, generation, frame).await {
                    warn!(player = %player_id, "backend frame failed: {e}");
                    drop(guard);
                    close_session(&ctx, &sessions, &session, player_id, Some(e.to_string())).await;
                    return;
                }
            }
            Ok(None) | Err(_) => {
                let still_current = {
                    let guard = session.lock().await;
                    if guard.closed {
                        return;
                    }
                    guard.backend_generation == generation
                };
                if still_current {
                    // The backend died outside any transfer; there is
                    // nothing to bridge anymore.
                    close_session(
                        &ctx,
                        &sessions,
                        &session,
                        player_id,
                        Some("backend closed the connection".to_string()),
                    )
                    .await;
                    return;
                }
                // Swapped out mid-transfer; next iteration reads the new
                // backend link.
            }
        }
    }
}

/// Spawns the pump reading a pending backend link during a transfer.
fn spawn_pending_pump(
    ctx: Arc<ProxyContext>,
    sessions: Sessions,
    session: Arc<Mutex<Session>>,
    player_id: PlayerId,
) {
    tokio::spawn(async move {
        loop {
            let link = {
                let guard = session.lock().await;
                if guard.closed {
                    return;
                }
                match guard.pending_transfer.as_ref() {
                    Some(machine) => machine.link.clone(),
                    // Completed or abandoned; the backend pump owns the
                    // link from here.
                    None => return,
                }
            };
            match link.recv_batch().await {
                Ok(Some(frame)) => {
                    let mut guard = session.lock().await;
                    if !pending_link_is(&guard, &link) {
                        // The transfer may have completed between the read
                        // and the lock; the frame then belongs to the
                        // session's new backend.
                        if Arc::ptr_eq(&guard.backend, &link) {
                            let generation = guard.backend_generation;
                            if let Err(e) =
                                guard.handle_backend_frame(&ctx, generation, frame).await
                            {
                                warn!(player = %player_id, "backend frame failed: {e}");
                            }
                        }
                        continue;
                    }
                    if let Err(e) = transfer::handle_pending_backend_batch(&mut guard, &ctx, frame)
                        .await
                    {
                        warn!(player = %player_id, "pending backend frame failed: {e}");
                        drop(guard);
                        close_session(&ctx, &sessions, &session, player_id, Some(e.to_string()))
                            .await;
                        return;
                    }
                }
                Ok(None) | Err(_) => {
                    // Take and fail under one guard, so no new transfer can
                    // be initiated between the two and then overwritten.
                    let mut guard = session.lock().await;
                    if guard.closed || !pending_link_is(&guard, &link) {
                        continue;
                    }
                    if let Some(machine) = guard.pending_transfer.take() {
                        let backend = machine.target_backend.clone();
                        let result = transfer::fail_transfer(
                            &mut guard,
                            &ctx,
                            machine,
                            TransferError::BackendDisconnect {
                                backend,
                                reason: "link closed during transfer".to_string(),
                            },
                        )
                        .await;
                        if let Err(e) = result {
                            warn!(player = %player_id, "transfer failure handling failed: {e}");
                        }
                        // A fallback may have installed a new pending link;
                        // the loop re-fetches it.
                    }
                }
            }
        }
    });
}

fn pending_link_is(session: &Session, link: &Arc<dyn Link>) -> bool {
    session
        .pending_transfer
        .as_ref()
        .is_some_and(|machine: &TransferStateMachine| Arc::ptr_eq(&machine.link, link))
}

/// Closes a session and removes it from the registry. Idempotent.
async fn close_session(
    ctx: &ProxyContext,
    sessions: &Sessions,
    session: &Arc<Mutex<Session>>,
    player_id: PlayerId,
    reason: Option<String>,
) {
    let mut guard = session.lock().await;
    if !guard.closed {
        info!(player = %player_id, reason = reason.as_deref().unwrap_or("clean close"), "player disconnected");
        guard.close(ctx, reason).await;
    }
    drop(guard);
    sessions.remove(&player_id);
}
