//! WebSocket server for board notifications.
//!
//! Architecture:
//! ```text
//! Client (user C, tab 1) ──┐
//! Client (user C, tab 2) ──┼── handshake (x-user-id) ── ConnectionRegistry
//! Client (user A)        ──┘                                  ▲
//!                                                             │ snapshot
//! BoardService ── commit ── BroadcastHub ─────────────────────┘
//!                                 │
//!                  per-connection writer task (bounded mpsc)
//! ```
//!
//! Each accepted socket gets a reader loop and a writer task. Outbound frames
//! go through a bounded channel; a broadcast that cannot enqueue within
//! `send_timeout` fails and the hub evicts the connection.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::model::UserId;
use crate::protocol::{Event, EventType};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, TransportError};
use crate::service::BoardService;
use crate::storage::{BoardStore, RocksStore, StoreConfig, StoreError};

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Decides who is on the other end of a WebSocket handshake.
pub trait HandshakeAuthenticator: Send + Sync {
    /// `None` rejects the handshake with 401.
    fn authenticate(&self, request: &Request) -> Option<UserId>;
}

/// Trusts the `x-user-id` header set by an authenticating gateway.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedHeaderAuth;

impl HandshakeAuthenticator for TrustedHeaderAuth {
    fn authenticate(&self, request: &Request) -> Option<UserId> {
        request
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    total_messages: AtomicU64,
}

/// One registered WebSocket, as seen by the broadcast hub.
struct WsConnection {
    id: ConnectionId,
    outbound: mpsc::Sender<Message>,
    send_timeout: Duration,
    shutdown: Arc<Notify>,
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, event: &Event) -> Result<(), TransportError> {
        let text = event
            .encode()
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        match self
            .outbound
            .send_timeout(Message::text(text), self.send_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(TransportError::Timeout),
            Err(SendTimeoutError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        let _ = self.outbound.try_send(Message::Close(None));
        self.shutdown.notify_one();
    }
}

/// The board notification server.
pub struct BoardServer {
    config: ServerConfig,
    service: Arc<BoardService>,
    registry: Arc<ConnectionRegistry>,
    authenticator: Arc<dyn HandshakeAuthenticator>,
    stats: Arc<AtomicServerStats>,
}

impl BoardServer {
    /// Create a server over an already opened store.
    pub fn new(config: ServerConfig, store: Arc<dyn BoardStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let service = Arc::new(BoardService::new(
            store,
            registry.clone(),
            config.request_timeout,
        ));
        Self {
            config,
            service,
            registry,
            authenticator: Arc::new(TrustedHeaderAuth),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Open the RocksDB store at `config.storage_path` and build the server.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let store = RocksStore::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?;
        Ok(Self::new(config, Arc::new(store)))
    }

    /// Replace the handshake authenticator.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn HandshakeAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Board server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let authenticator = self.authenticator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, authenticator, stats, config)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to teardown.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        authenticator: Arc<dyn HandshakeAuthenticator>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut user: Option<UserId> = None;
        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| match authenticator.authenticate(request) {
                Some(id) => {
                    user = Some(id);
                    Ok(response)
                }
                None => Err(unauthorized()),
            },
        )
        .await;

        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected handshake from {addr}: {e}");
                return Ok(());
            }
        };
        let Some(user) = user else {
            return Ok(());
        };

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(config.outbound_buffer);
        let shutdown = Arc::new(Notify::new());
        let conn = Arc::new(WsConnection {
            id: Uuid::new_v4(),
            outbound: out_tx,
            send_timeout: config.send_timeout,
            shutdown: shutdown.clone(),
        });

        // Writer task: drains the outbound channel into the socket.
        let mut writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_sender.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        registry.register(user, conn.clone()).await;
        log::info!("User {user} connected from {addr} as {}", conn.id);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            let reply = match Event::decode(text.as_str()) {
                                Ok(evt) if evt.event_type == EventType::Ping => Event::pong(),
                                Ok(evt) => {
                                    log::warn!("Unexpected event {:?} from {addr}", evt.event_type);
                                    Event::undefined()
                                }
                                Err(e) => {
                                    log::warn!("Malformed event from {addr}: {e}");
                                    Event::undefined()
                                }
                            };
                            if let Err(e) = conn.send(&reply).await {
                                log::warn!("Reply to {addr} failed: {e}");
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if conn.outbound.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {
                            let _ = conn.send(&Event::undefined()).await;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    log::debug!("Connection {} from {addr} was evicted", conn.id);
                    break;
                }
            }
        }

        registry.deregister(conn.id, user).await;
        conn.close().await;
        if tokio::time::timeout(config.send_timeout, &mut writer).await.is_err() {
            writer.abort();
        }
        log::info!("User {user} disconnected from {addr}");
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn service(&self) -> &Arc<BoardService> {
        &self.service
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
