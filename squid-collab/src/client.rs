//! Minimal WebSocket client for the board server.
//!
//! Used by integration tests and tooling: connects as a given user, sends
//! `PING` (or any event), and surfaces every incoming [`Event`] on a channel.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::model::UserId;
use crate::protocol::{Event, ProtocolError};
use crate::server::USER_ID_HEADER;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A connection to the board server on behalf of one user.
pub struct BoardClient {
    user_id: UserId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<Event>>,
    event_tx: mpsc::Sender<Event>,
}

impl BoardClient {
    pub fn new(user_id: UserId, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.event_rx.take()
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let header: HeaderValue = self
            .user_id
            .to_string()
            .parse()
            .map_err(|_| ClientError::Connect("invalid user id header".into()))?;
        request.headers_mut().insert(USER_ID_HEADER, header);

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Event::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping malformed server event: {e}"),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = out_tx.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
        });

        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    /// Send any event to the server.
    pub async fn send_event(&self, event: &Event) -> Result<(), ClientError> {
        let text = event.encode()?;
        self.outgoing(Message::text(text)).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send_event(&Event::ping()).await
    }

    /// Send a raw text frame, bypassing event encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.outgoing(Message::text(text.into())).await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn outgoing(&self, msg: Message) -> Result<(), ClientError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(msg).await.map_err(|_| ClientError::Closed),
            None => Err(ClientError::Closed),
        }
    }
}
