//! Realtime relay over WebSocket.
//!
//! Each socket gets a connection id and an entry in the [`ConnectionManager`]
//! for as long as the socket lives: `Connecting → Open → Closed`. Outbound
//! messages go through a per-connection unbounded channel drained by a
//! writer task, which keeps delivery FIFO per connection. Inbound text
//! frames decode into [`ClientMessage`] and are dispatched exhaustively.

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Event, SessionMetrics, SessionStatus};
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    #[serde(rename_all = "camelCase")]
    JoinSession { session_id: String },
    LeaveSession,
    #[serde(rename_all = "camelCase")]
    TrackEvent {
        event_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        server_version: String,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    Joined { session_id: String },
    Left,
    #[serde(rename_all = "camelCase")]
    EventAck { event_id: String },
    #[serde(rename_all = "camelCase")]
    SessionUpdate {
        session_id: String,
        status: SessionStatus,
        event_count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<SessionMetrics>,
    },
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

struct ConnectionHandle {
    sender: mpsc::UnboundedSender<ServerMessage>,
    state: ConnectionState,
    session_id: Option<String>,
    opened_at: DateTime<Utc>,
}

/// Registry of live connections keyed by connection id.
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in the `Connecting` state. The receiver yields every
    /// message queued for it until the connection is removed.
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections.insert(
            id.clone(),
            ConnectionHandle {
                sender,
                state: ConnectionState::Connecting,
                session_id: None,
                opened_at: Utc::now(),
            },
        );
        debug!(connection_id = %id, "connection registered");
        (id, receiver)
    }

    /// `Connecting → Open`. Returns false for unknown or closed connections.
    pub fn mark_open(&self, id: &str) -> bool {
        match self.connections.get_mut(id) {
            Some(mut handle) if handle.state == ConnectionState::Connecting => {
                handle.state = ConnectionState::Open;
                true
            }
            _ => false,
        }
    }

    /// Current state; a removed connection reads as `Closed`.
    pub fn state(&self, id: &str) -> ConnectionState {
        self.connections
            .get(id)
            .map(|h| h.state)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Drop a connection and its outbound channel. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        match self.connections.remove(id) {
            Some((_, handle)) => {
                let lifetime = Utc::now() - handle.opened_at;
                debug!(
                    connection_id = %id,
                    lifetime_ms = lifetime.num_milliseconds(),
                    "connection removed"
                );
                true
            }
            None => false,
        }
    }

    pub fn send(&self, id: &str, message: ServerMessage) -> bool {
        match self.connections.get(id) {
            Some(handle) => handle.sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn join(&self, id: &str, session_id: &str) -> bool {
        match self.connections.get_mut(id) {
            Some(mut handle) => {
                handle.session_id = Some(session_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn leave(&self, id: &str) {
        if let Some(mut handle) = self.connections.get_mut(id) {
            handle.session_id = None;
        }
    }

    pub fn session_of(&self, id: &str) -> Option<String> {
        self.connections.get(id).and_then(|h| h.session_id.clone())
    }

    /// Send to every open connection joined to `session_id`. Returns the
    /// number of connections reached.
    pub fn broadcast_session(&self, session_id: &str, message: &ServerMessage) -> usize {
        self.connections
            .iter()
            .filter(|entry| {
                entry.state == ConnectionState::Open
                    && entry.session_id.as_deref() == Some(session_id)
            })
            .filter(|entry| entry.sender.send(message.clone()).is_ok())
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Shutdown hook: drop every connection. Writer tasks see their channel
    /// close and close their sockets.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        self.connections.clear();
        if count > 0 {
            info!(connections = count, "relay closed all connections");
        }
        count
    }
}

/// Push the current state of `session_id` to its subscribers.
pub async fn notify_session(relay: &ConnectionManager, store: &DocumentStore, session_id: &str) {
    let (session, events) = match (
        store.get_session(session_id).await,
        store.events_for(session_id).await,
    ) {
        (Ok(session), Ok(events)) => (session, events),
        _ => return,
    };
    let update = ServerMessage::SessionUpdate {
        session_id: session.session_id,
        status: session.status,
        event_count: events.len() as u64,
        metrics: session.metrics,
    };
    let reached = relay.broadcast_session(session_id, &update);
    debug!(session_id = %session_id, reached, "session update broadcast");
}

/// Handle one decoded client message. Returns the direct reply, if any.
pub async fn dispatch(
    relay: &ConnectionManager,
    store: &DocumentStore,
    connection_id: &str,
    message: ClientMessage,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::JoinSession { session_id } => match store.get_session(&session_id).await {
            Ok(_) => {
                relay.join(connection_id, &session_id);
                Some(ServerMessage::Joined { session_id })
            }
            Err(e) => Some(ServerMessage::error(e.to_string())),
        },
        ClientMessage::LeaveSession => {
            relay.leave(connection_id);
            Some(ServerMessage::Left)
        }
        ClientMessage::TrackEvent {
            event_type,
            payload,
        } => {
            let Some(session_id) = relay.session_of(connection_id) else {
                return Some(ServerMessage::error("join a session before tracking events"));
            };
            match store
                .record_event(Event::new(&session_id, event_type, payload))
                .await
            {
                Ok(event_id) => {
                    // Ack before the broadcast the sender also receives.
                    relay.send(connection_id, ServerMessage::EventAck { event_id });
                    notify_session(relay, store, &session_id).await;
                    None
                }
                Err(e) => Some(ServerMessage::error(e.to_string())),
            }
        }
    }
}

/// Drive one upgraded socket until either side closes it.
pub async fn serve_socket(
    socket: WebSocket,
    relay: Arc<ConnectionManager>,
    store: Arc<DocumentStore>,
) {
    let (connection_id, mut outbound) = relay.register();
    let (mut sink, mut stream) = socket.split();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection_id = %writer_id, error = %e, "failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    relay.send(
        &connection_id,
        ServerMessage::Connected {
            connection_id: connection_id.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );
    relay.mark_open(&connection_id);
    info!(connection_id = %connection_id, "relay connection open");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = match decode(&text) {
                    Ok(message) => dispatch(&relay, &store, &connection_id, message).await,
                    Err(e) => {
                        debug!(connection_id = %connection_id, error = %e, "undecodable client message");
                        Some(ServerMessage::error(format!("invalid message: {}", e)))
                    }
                };
                if let Some(reply) = reply {
                    if !relay.send(&connection_id, reply) {
                        // Removed by close_all during shutdown.
                        break;
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(connection_id = %connection_id, ?frame, "closed by client");
                break;
            }
            Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "relay socket error");
                break;
            }
        }
    }

    relay.remove(&connection_id);
    let _ = writer.await;
    info!(connection_id = %connection_id, "relay connection closed");
}
