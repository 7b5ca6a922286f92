//! Core relay server implementation.
//!
//! `RelayServer` owns the listeners and wires the transport layer to the
//! relay logic: sniffed TCP acceptors (optionally one per core via
//! SO_REUSEPORT), the reliable-UDP endpoint, the per-connection read loops,
//! the idle sweeper and the shutdown path. It contains no relay policy of
//! its own; every decoded packet goes straight to the connection's
//! [`RelayConnect`] session.

use crate::config::ServerConfig;
use crate::error::ServerError;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use waypoint_net::codec::{decode_frame, read_packet};
use waypoint_net::rudp::{RudpIncoming, RudpListener};
use waypoint_net::sniff::{classify, peek_head, request_path, ProtocolKind};
use waypoint_net::web::HttpResponse;
use waypoint_net::{
    current_millis, ConnectionChannel, GeoLookup, NetConnect, NetEvents, NoGeo, WebRoutes,
};
use waypoint_relay::{
    relay_client_commands, CommandRegistry, MessageBundle, RelayConnect, RelayDirectory,
};

/// Everything a connection task needs, shared across acceptors.
struct ConnCtx {
    directory: Arc<RelayDirectory>,
    commands: Arc<CommandRegistry>,
    bundle: Arc<MessageBundle>,
    events: Arc<NetEvents>,
    web: Arc<WebRoutes>,
    sessions: Arc<DashMap<Uuid, Arc<RelayConnect>>>,
    geo: Arc<dyn GeoLookup>,
    max_connections: usize,
    max_packet_bytes: usize,
    local_port: u16,
}

/// The relay server: listeners, connection lifecycle, shutdown.
pub struct RelayServer {
    config: ServerConfig,
    ctx: Arc<ConnCtx>,
    shutdown_sender: broadcast::Sender<()>,
}

impl RelayServer {
    /// Build the server: relay state, command set, close hook, web routes.
    /// Nothing binds until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Self {
        let directory = Arc::new(RelayDirectory::new());
        let commands = Arc::new(relay_client_commands());
        let bundle = Arc::new(MessageBundle::with_defaults());
        let events = Arc::new(NetEvents::new());
        let sessions: Arc<DashMap<Uuid, Arc<RelayConnect>>> = Arc::new(DashMap::new());
        let (shutdown_sender, _) = broadcast::channel(1);

        // Whatever closes a channel, the session tears down exactly once:
        // the spawned disconnect is a no-op when the session started it.
        {
            let sessions = sessions.clone();
            events.on_close(move |channel| {
                if let Some((_, connect)) = sessions.remove(&channel.id()) {
                    tokio::spawn(async move { connect.disconnect().await });
                }
            });
        }

        let web = Arc::new(WebRoutes::new(config.websocket_uri.clone()));
        {
            let sessions = sessions.clone();
            let directory = directory.clone();
            web.get("/status", move |_request| {
                let body = serde_json::json!({
                    "status": "ok",
                    "connections": sessions.len(),
                    "rooms": directory.len(),
                });
                HttpResponse::json(body.to_string())
            });
        }

        let ctx = Arc::new(ConnCtx {
            directory,
            commands,
            bundle,
            events,
            web,
            sessions,
            geo: Arc::new(NoGeo),
            max_connections: config.max_connections,
            max_packet_bytes: config.max_packet_bytes,
            local_port: config.bind_address.port(),
        });

        Self {
            config,
            ctx,
            shutdown_sender,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn active_sessions(&self) -> usize {
        self.ctx.sessions.len()
    }

    pub fn active_rooms(&self) -> usize {
        self.ctx.directory.len()
    }

    /// Bind everything and run until shutdown.
    pub async fn start(&self) -> Result<(), ServerError> {
        info!("🚀 Starting relay server on {}", self.config.bind_address);

        // One acceptor per core only pays off when the kernel spreads the
        // load across listeners.
        let core_count = num_cpus::get();
        let num_acceptors = if self.config.use_reuse_port {
            core_count
        } else {
            1
        };
        info!(
            "🧠 Detected {} CPU cores, using {} acceptor(s)",
            core_count, num_acceptors
        );

        let mut listeners = Vec::new();
        for i in 0..num_acceptors {
            let listener = self.build_listener()?;
            info!("✅ Listener {} bound on {}", i, self.config.bind_address);
            listeners.push(listener);
        }

        let rudp = RudpListener::bind(self.config.udp_bind_address).await?;
        info!("✅ Reliable-UDP endpoint bound on {}", rudp.local_addr());

        self.spawn_idle_sweep();

        let mut shutdown_receiver = self.shutdown_sender.subscribe();

        let mut accept_futures = listeners
            .into_iter()
            .map(|listener| {
                let ctx = self.ctx.clone();
                async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, addr)) => {
                                let ctx = ctx.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, ctx).await {
                                        debug!("Connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                                break;
                            }
                        }
                    }
                }
            })
            .collect::<FuturesUnordered<_>>();

        let rudp_accept = {
            let rudp = rudp.clone();
            let ctx = self.ctx.clone();
            async move {
                while let Some(incoming) = rudp.accept().await {
                    let ctx = ctx.clone();
                    tokio::spawn(async move { handle_rudp_connection(incoming, ctx).await });
                }
            }
        };

        tokio::select! {
            _ = accept_futures.next() => {}
            _ = rudp_accept => {}
            _ = shutdown_receiver.recv() => {
                info!("Shutdown signal received");
            }
        }

        info!("🧹 Performing server cleanup...");
        rudp.shutdown().await;
        let remaining: Vec<Arc<RelayConnect>> = self
            .ctx
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connect in remaining {
            connect.disconnect().await;
        }
        info!("✅ Server cleanup completed");

        info!("Server stopped");
        Ok(())
    }

    /// Ask a running server to stop accepting and tear down.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        info!("🛑 Shutting down relay server...");
        let _ = self.shutdown_sender.send(());
        Ok(())
    }

    fn build_listener(&self) -> Result<TcpListener, ServerError> {
        let socket = Socket::new(
            Domain::for_address(self.config.bind_address),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
        socket.set_reuse_address(true).ok();

        if self.config.use_reuse_port {
            #[cfg(unix)]
            {
                if let Err(e) = socket.set_reuse_port(true) {
                    warn!("Failed to set SO_REUSEPORT: {}", e);
                } else {
                    info!("SO_REUSEPORT enabled for load balancing across acceptor threads");
                }
            }
            #[cfg(not(unix))]
            {
                warn!("SO_REUSEPORT is not supported on this platform. Using SO_REUSEADDR only.");
            }
        }

        socket
            .bind(&self.config.bind_address.into())
            .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
        socket
            .listen(65535)
            .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        std_listener.set_nonblocking(true).ok();
        TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
    }

    fn spawn_idle_sweep(&self) {
        let ctx = self.ctx.clone();
        let idle_timeout_millis = self.config.idle_timeout.as_millis() as i64;
        let tick = self.config.idle_timeout.min(Duration::from_secs(30));
        let mut shutdown_rx = self.shutdown_sender.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let now = current_millis();
                        let idle: Vec<Arc<RelayConnect>> = ctx
                            .sessions
                            .iter()
                            .filter(|entry| {
                                entry.value().session().idle_for(now) > idle_timeout_millis
                            })
                            .map(|entry| entry.value().clone())
                            .collect();
                        for connect in idle {
                            info!(
                                "Sweeping idle connection {} ({})",
                                connect.channel().id(),
                                connect.channel().ip()
                            );
                            connect.disconnect().await;
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("bind_address", &self.config.bind_address)
            .field("sessions", &self.ctx.sessions.len())
            .field("rooms", &self.ctx.directory.len())
            .finish()
    }
}

/// Classify one accepted stream and run the matching pipeline. The sniffer
/// only peeks, so the game path starts with the stream byte-identical to
/// what the client sent.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ConnCtx>,
) -> Result<(), ServerError> {
    let head = peek_head(&mut stream).await?;
    match classify(&head, ctx.web.ws_uri()) {
        ProtocolKind::Game => handle_game_stream(stream, addr, ctx).await,
        ProtocolKind::Http => {
            debug!("http request from {}", addr);
            ctx.web.serve_http(stream).await?;
            Ok(())
        }
        ProtocolKind::WebSocket => {
            let path = request_path(&head).unwrap_or_else(|| ctx.web.ws_uri().to_string());
            debug!("websocket upgrade from {} at {}", addr, path);
            ctx.web.serve_websocket(stream, &path).await?;
            Ok(())
        }
    }
}

async fn handle_game_stream(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ConnCtx>,
) -> Result<(), ServerError> {
    if ctx.sessions.len() >= ctx.max_connections {
        warn!("Connection limit reached, refusing {}", addr);
        return Ok(());
    }

    let (mut read_half, write_half) = stream.into_split();
    let channel = ConnectionChannel::stream(
        write_half,
        addr,
        ctx.local_port,
        ctx.geo.as_ref(),
        ctx.events.clone(),
    );
    let connect = Arc::new(RelayConnect::new(
        channel.clone(),
        ctx.directory.clone(),
        ctx.commands.clone(),
        ctx.bundle.clone(),
    ));
    ctx.sessions.insert(channel.id(), connect.clone());
    info!(
        "📡 {} connected ({}, {})",
        addr,
        channel.kind().as_str(),
        channel.id()
    );

    loop {
        match read_packet(&mut read_half, ctx.max_packet_bytes).await {
            Ok(Some(packet)) => {
                if let Err(e) = connect.receive_packet(packet).await {
                    warn!("Protocol error from {}: {}", addr, e);
                    break;
                }
                if connect.channel().is_closed() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Framing error from {}: {}", addr, e);
                break;
            }
        }
    }
    connect.disconnect().await;
    Ok(())
}

async fn handle_rudp_connection(incoming: RudpIncoming, ctx: Arc<ConnCtx>) {
    let addr = incoming.peer.addr();
    if ctx.sessions.len() >= ctx.max_connections {
        warn!("Connection limit reached, refusing rudp peer {}", addr);
        incoming.peer.shutdown().await;
        return;
    }

    let channel = ConnectionChannel::rudp(
        incoming.peer,
        ctx.local_port,
        ctx.geo.as_ref(),
        ctx.events.clone(),
    );
    let connect = Arc::new(RelayConnect::new(
        channel.clone(),
        ctx.directory.clone(),
        ctx.commands.clone(),
        ctx.bundle.clone(),
    ));
    ctx.sessions.insert(channel.id(), connect.clone());
    info!(
        "📡 {} connected ({}, {})",
        addr,
        channel.kind().as_str(),
        channel.id()
    );

    let mut inbound = incoming.inbound;
    while let Some(frame) = inbound.recv().await {
        match decode_frame(&frame, ctx.max_packet_bytes) {
            Ok(packet) => {
                if let Err(e) = connect.receive_packet(packet).await {
                    warn!("Protocol error from {}: {}", addr, e);
                    break;
                }
                if connect.channel().is_closed() {
                    break;
                }
            }
            Err(e) => {
                warn!("Bad frame from {}: {}", addr, e);
                break;
            }
        }
    }
    connect.disconnect().await;
}
