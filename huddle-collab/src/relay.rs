//! Reference relay: per-document fan-out over WebSocket.
//!
//! ```text
//! Client A ──┐                          ┌──► Client B
//!            ├── Room (document_id) ────┤
//! Client C ──┘   broadcast channel      └──► Client C (never the sender)
//! ```
//!
//! The relay knows nothing about presence, comments or edits. It answers
//! `ping`, routes every other frame by its `document_id` and, when a socket
//! goes away, tells the room that its last known user left. Nothing is
//! persisted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::RelayConfig;
use crate::error::CollabError;
use crate::presence::PresenceLeft;
use crate::protocol::{new_id, Envelope, Handshake, Message};

/// `sender_id` used on frames the relay originates.
pub const RELAY_SENDER: &str = "relay";

/// Relay-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

/// A frame on its way through a room, tagged with the connection it came from.
#[derive(Debug, Clone)]
struct Relayed {
    origin: Arc<str>,
    frame: Arc<str>,
}

struct Room {
    sender: broadcast::Sender<Relayed>,
    members: usize,
}

/// Document rooms keyed by document id.
#[derive(Clone)]
struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    capacity: usize,
}

impl RoomRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Join `document_id`, creating the room on first use.
    async fn join(&self, document_id: &str) -> Membership {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(document_id.to_string()).or_insert_with(|| {
            log::info!("Room {document_id} opened");
            Room {
                sender: broadcast::channel(self.capacity).0,
                members: 0,
            }
        });
        room.members += 1;
        Membership {
            document_id: document_id.to_string(),
            sender: room.sender.clone(),
            receiver: room.sender.subscribe(),
        }
    }

    /// Drop one member; removes the room when it empties.
    async fn leave(&self, document_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(document_id) {
            room.members = room.members.saturating_sub(1);
            if room.members == 0 {
                rooms.remove(document_id);
                log::info!("Room {document_id} removed (empty)");
            }
        }
    }

    async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// One connection's seat in a room.
struct Membership {
    document_id: String,
    sender: broadcast::Sender<Relayed>,
    receiver: broadcast::Receiver<Relayed>,
}

impl Membership {
    fn publish(&self, origin: &Arc<str>, frame: &str) -> usize {
        self.sender
            .send(Relayed {
                origin: origin.clone(),
                frame: Arc::from(frame),
            })
            .unwrap_or(0)
    }
}

/// The relay server.
#[derive(Clone)]
pub struct Relay {
    config: RelayConfig,
    rooms: RoomRegistry,
    stats: Arc<RwLock<RelayStats>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = RoomRegistry::new(config.room_capacity);
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), CollabError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await.map_err(transport)?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection_id: Arc<str> = Arc::from(new_id());
        log::info!("Connection {connection_id} established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let hello = Envelope::new(
            Message::ConnectionEstablished(Handshake {
                connection_id: connection_id.to_string(),
            }),
            RELAY_SENDER,
            None,
        );
        let sent = ws_sender.send(WsMessage::text(hello.encode()?)).await;

        let mut membership: Option<Membership> = None;
        let mut last_sender: Option<String> = None;

        let result = match sent {
            Err(e) => Err(transport(e)),
            Ok(()) => loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                let text = text.as_str();
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let envelope = match Envelope::decode(text) {
                                    Ok(envelope) => envelope,
                                    Err(e) => {
                                        log::warn!("Malformed frame from {addr}: {e}");
                                        self.stats.write().await.malformed_messages += 1;
                                        continue;
                                    }
                                };

                                if matches!(envelope.message, Message::Ping) {
                                    let pong = Envelope::new(Message::Pong, RELAY_SENDER, envelope.document_id.clone());
                                    match pong.encode() {
                                        Ok(frame) => {
                                            if let Err(e) = ws_sender.send(WsMessage::text(frame)).await {
                                                break Err(transport(e));
                                            }
                                        }
                                        Err(e) => log::warn!("Could not encode pong: {e}"),
                                    }
                                    continue;
                                }

                                last_sender = Some(envelope.sender_id.clone());
                                if let Some(doc) = envelope.document_id.as_deref() {
                                    if membership.as_ref().map(|m| m.document_id.as_str()) != Some(doc) {
                                        if let Some(old) = membership.take() {
                                            self.rooms.leave(&old.document_id).await;
                                        }
                                        membership = Some(self.rooms.join(doc).await);
                                        self.stats.write().await.active_rooms = self.rooms.len().await;
                                        log::info!("Connection {connection_id} joined room {doc}");
                                    }
                                }

                                match &membership {
                                    Some(room) => {
                                        let receivers = room.publish(&connection_id, text);
                                        log::debug!(
                                            "Relayed {} from {} to room {} ({receivers} subscriber(s))",
                                            envelope.kind(),
                                            envelope.sender_id,
                                            room.document_id
                                        );
                                    }
                                    None => log::debug!("Dropping {} from {addr}: no room", envelope.kind()),
                                }
                            }

                            Some(Ok(WsMessage::Ping(data))) => {
                                if let Err(e) = ws_sender.send(WsMessage::Pong(data)).await {
                                    break Err(transport(e));
                                }
                            }

                            Some(Ok(WsMessage::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break Ok(());
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break Ok(());
                            }

                            _ => {}
                        }
                    }

                    relayed = async {
                        match membership.as_mut() {
                            Some(room) => room.receiver.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match relayed {
                            Ok(relayed) => {
                                if relayed.origin == connection_id {
                                    continue;
                                }
                                if let Err(e) = ws_sender.send(WsMessage::text(relayed.frame.to_string())).await {
                                    break Err(transport(e));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {connection_id} lagged by {n} messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => break Ok(()),
                        }
                    }
                }
            },
        };

        if let Some(room) = membership.take() {
            if let Some(user_id) = last_sender {
                let left = Envelope::new(
                    Message::UserPresenceLeft(PresenceLeft { user_id: user_id.clone() }),
                    user_id,
                    Some(room.document_id.clone()),
                );
                match left.encode() {
                    Ok(frame) => {
                        room.publish(&connection_id, &frame);
                    }
                    Err(e) => log::warn!("Could not announce departure: {e}"),
                }
            }
            self.rooms.leave(&room.document_id).await;
        }

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = self.rooms.len().await;
        }
        log::info!("Connection {connection_id} finished");
        result
    }
}

fn transport(e: tokio_tungstenite::tungstenite::Error) -> CollabError {
    CollabError::Transport(e.to_string())
}
