//! Connection lifecycle for one browser session.
//!
//! [`ConnectionManager`] is a sans-IO state machine: it never owns a socket.
//! Callers feed it transport outcomes (`on_open`, `on_frame`, `on_closed`)
//! and the current time (`tick`), and drain the [`TransportCommand`]s it
//! wants executed plus the [`ConnectionEvent`]s it produced.
//!
//! ```text
//!              connect()             on_open()
//! Disconnected ─────────► Connecting ─────────► Connected
//!      ▲                      │                     │ drop / heartbeat timeout
//!      │ exhausted            │ failure             ▼
//!      └───────────────── Reconnecting ◄────────────┘
//!                         (fixed delay, bounded attempts)
//! ```
//!
//! Provides:
//! - Outbound queue while not connected (flushed in order on open)
//! - Heartbeat ping/pong with timeout escalation
//! - Bounded fixed-delay reconnect with a single terminal error
//! - Cumulative traffic metrics

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::CollabConfig;
use crate::error::{CollabError, ProtocolError};
use crate::protocol::{new_id, Envelope, Message};
use crate::throttle::FixedWindow;

/// Close code for a normal, caller-initiated shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code used when the heartbeat times out.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Who the session is acting as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    /// Per-session token attached to the endpoint URL.
    pub token: String,
}

impl SessionIdentity {
    /// Identity with a freshly generated session token.
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar: None,
            token: new_id(),
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }
}

/// I/O the driver must perform on behalf of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Open a socket to `url`. Report the outcome via `on_open` or `on_closed`.
    Open { url: String },
    /// Write a text frame.
    Send { frame: String },
    /// Close the socket.
    Close { code: u16, reason: String },
}

/// Things that happened, for the session and UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Established { connection_id: String },
    Inbound(Envelope),
    Malformed(ProtocolError),
    /// Reconnect attempts exhausted. Emitted once per outage.
    TerminalError(CollabError),
}

/// Cumulative traffic counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_attempts: u64,
    /// Successful re-opens after an unexpected drop.
    pub reconnects: u64,
    pub dropped_messages: u64,
    pub malformed_messages: u64,
    pub last_latency: Option<Duration>,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    envelope: Envelope,
    critical: bool,
}

/// Messages accumulated while the connection is down.
///
/// Bounded; on overflow the oldest non-critical message is evicted first.
#[derive(Debug)]
pub struct OutboundQueue {
    queue: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append `envelope`, returning whatever was evicted to make room.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let evicted = if self.queue.len() >= self.capacity {
            let victim = self
                .queue
                .iter()
                .position(|m| !m.critical)
                .unwrap_or(0);
            self.queue.remove(victim).map(|m| m.envelope)
        } else {
            None
        };
        let critical = envelope.message.is_critical();
        self.queue.push_back(QueuedMessage { envelope, critical });
        evicted
    }

    /// Put a message back at the tail after a failed write.
    pub fn requeue(&mut self, envelope: Envelope) -> Option<Envelope> {
        self.push(envelope)
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).map(|m| m.envelope).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Owns the lifecycle of the single duplex channel of a session.
pub struct ConnectionManager {
    identity: SessionIdentity,
    server_url: String,
    document_id: Option<String>,

    state: ConnectionState,
    connection_id: Option<String>,
    queue: OutboundQueue,

    heartbeat: FixedWindow,
    ping_outstanding: Option<Instant>,

    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    recovering: bool,

    /// An `Open` was issued and its outcome is not known yet.
    open_in_flight: bool,
    socket_open: bool,
    manual: bool,

    metrics: ConnectionMetrics,
    commands: Vec<TransportCommand>,
    events: VecDeque<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(config: &CollabConfig, identity: SessionIdentity) -> Self {
        Self {
            identity,
            server_url: config.server_url.clone(),
            document_id: None,
            state: ConnectionState::Disconnected,
            connection_id: None,
            queue: OutboundQueue::new(config.outbound_queue_capacity),
            heartbeat: FixedWindow::new(config.heartbeat_interval),
            ping_outstanding: None,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
            reconnect_attempts: 0,
            reconnect_at: None,
            recovering: false,
            open_in_flight: false,
            socket_open: false,
            manual: false,
            metrics: ConnectionMetrics::default(),
            commands: Vec::new(),
            events: VecDeque::new(),
        }
    }

    /// Document used as the routing key in the endpoint URL on the next open.
    pub fn set_document(&mut self, document_id: Option<String>) {
        self.document_id = document_id;
    }

    /// Endpoint URL with the session token, user and document attached.
    pub fn endpoint_url(&self) -> Result<String, CollabError> {
        let mut url = url::Url::parse(&self.server_url)
            .map_err(|e| CollabError::Config(format!("invalid server_url {}: {e}", self.server_url)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("token", &self.identity.token);
            query.append_pair("user", &self.identity.user_id);
            if let Some(doc) = &self.document_id {
                query.append_pair("document", doc);
            }
        }
        Ok(url.to_string())
    }

    /// Start connecting. No-op while already connected or connecting.
    pub fn connect(&mut self, now: Instant) {
        if self.open_in_flight || self.socket_open {
            return;
        }
        self.manual = false;
        self.recovering = false;
        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        self.open(now);
    }

    fn open(&mut self, _now: Instant) {
        match self.endpoint_url() {
            Ok(url) => {
                log::info!("Opening connection to {}", self.server_url);
                self.open_in_flight = true;
                self.commands.push(TransportCommand::Open { url });
            }
            Err(e) => {
                log::error!("Cannot open connection: {e}");
                self.set_state(ConnectionState::Disconnected);
                self.events.push_back(ConnectionEvent::TerminalError(e));
            }
        }
    }

    /// The transport opened successfully.
    pub fn on_open(&mut self, now: Instant) {
        if self.manual || !self.open_in_flight {
            log::debug!("Ignoring open outcome for a cancelled attempt");
            return;
        }
        self.open_in_flight = false;
        self.socket_open = true;
        if self.recovering {
            self.metrics.reconnects += 1;
            log::info!("Reconnected after {} attempt(s)", self.reconnect_attempts);
        }
        self.recovering = false;
        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.ping_outstanding = None;
        self.heartbeat.mark(now);
        self.set_state(ConnectionState::Connected);

        let queued = self.queue.drain();
        if !queued.is_empty() {
            log::info!("Flushing {} queued message(s)", queued.len());
        }
        for envelope in queued {
            self.transmit(&envelope);
        }
    }

    /// Send now if connected, otherwise queue (heartbeats are dropped).
    pub fn send(&mut self, envelope: Envelope) {
        if self.state == ConnectionState::Connected {
            self.transmit(&envelope);
            return;
        }
        if envelope.message.is_heartbeat() {
            log::trace!("Dropping {} while {:?}", envelope.kind(), self.state);
            return;
        }
        log::debug!("Queueing {} while {:?}", envelope.kind(), self.state);
        self.enqueue(envelope);
    }

    /// A write the driver attempted failed; keep the message for later.
    pub fn on_send_failed(&mut self, frame: &str) {
        match Envelope::decode(frame) {
            Ok(envelope) if !envelope.message.is_heartbeat() => {
                log::warn!("Write of {} failed, requeueing", envelope.kind());
                self.enqueue(envelope);
            }
            Ok(_) => {}
            Err(e) => log::error!("Failed write could not be requeued: {e}"),
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        if let Some(evicted) = self.queue.push(envelope) {
            self.metrics.dropped_messages += 1;
            log::warn!(
                "Outbound queue full ({}), dropped queued {}",
                self.queue.capacity(),
                evicted.kind()
            );
        }
    }

    fn transmit(&mut self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(frame) => {
                self.metrics.messages_sent += 1;
                self.metrics.bytes_sent += frame.len() as u64;
                self.commands.push(TransportCommand::Send { frame });
            }
            Err(e) => log::error!("Failed to encode {}: {e}", envelope.kind()),
        }
    }

    /// A text frame arrived.
    pub fn on_frame(&mut self, text: &str, now: Instant) {
        self.metrics.messages_received += 1;
        self.metrics.bytes_received += text.len() as u64;

        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Discarding malformed frame: {e}");
                self.metrics.malformed_messages += 1;
                self.events.push_back(ConnectionEvent::Malformed(e));
                return;
            }
        };

        match &envelope.message {
            Message::Ping => {
                let pong = Envelope::new(Message::Pong, self.identity.user_id.clone(), None);
                if self.state == ConnectionState::Connected {
                    self.transmit(&pong);
                }
            }
            Message::Pong => {
                if let Some(sent) = self.ping_outstanding.take() {
                    self.metrics.last_latency = Some(now.saturating_duration_since(sent));
                }
            }
            Message::ConnectionEstablished(handshake) => {
                log::info!("Connection established as {}", handshake.connection_id);
                self.connection_id = Some(handshake.connection_id.clone());
                self.events.push_back(ConnectionEvent::Established {
                    connection_id: handshake.connection_id.clone(),
                });
            }
            _ => self.events.push_back(ConnectionEvent::Inbound(envelope)),
        }
    }

    /// The socket closed or an open attempt failed.
    pub fn on_closed(&mut self, now: Instant) {
        self.handle_drop(now);
    }

    /// Transport-level error. Reported, never raised.
    pub fn on_transport_error(&mut self, error: &str, now: Instant) {
        if self.open_in_flight || self.socket_open {
            log::error!("Transport error: {error}");
        } else {
            log::debug!("Transport error after teardown: {error}");
        }
        self.handle_drop(now);
    }

    fn handle_drop(&mut self, now: Instant) {
        if !self.open_in_flight && !self.socket_open {
            return;
        }
        let was_open = self.socket_open;
        self.open_in_flight = false;
        self.socket_open = false;
        self.ping_outstanding = None;
        self.connection_id = None;
        if self.manual {
            return;
        }
        if was_open {
            log::warn!("Connection lost");
            self.reconnect_attempts = 0;
        }
        self.recovering = true;
        self.schedule_reconnect(now);
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.reconnect_attempts >= self.max_reconnect_attempts {
            let attempts = self.reconnect_attempts;
            log::error!("Giving up after {attempts} reconnect attempt(s)");
            self.reconnect_at = None;
            self.recovering = false;
            self.heartbeat.reset();
            self.set_state(ConnectionState::Disconnected);
            self.events
                .push_back(ConnectionEvent::TerminalError(CollabError::ReconnectExhausted { attempts }));
            return;
        }
        self.reconnect_attempts += 1;
        self.metrics.reconnect_attempts += 1;
        self.reconnect_at = Some(now + self.reconnect_delay);
        log::info!(
            "Reconnect attempt {}/{} in {:?}",
            self.reconnect_attempts,
            self.max_reconnect_attempts,
            self.reconnect_delay
        );
        self.set_state(ConnectionState::Reconnecting);
    }

    /// Drive heartbeat and reconnect timers.
    pub fn tick(&mut self, now: Instant) {
        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.reconnect_at = None;
                self.open(now);
            }
        }

        if self.state != ConnectionState::Connected || !self.heartbeat.ready(now) {
            return;
        }
        if self.ping_outstanding.is_some() {
            log::warn!("No pong within {:?}, reconnecting", self.heartbeat.interval());
            self.commands.push(TransportCommand::Close {
                code: CLOSE_HEARTBEAT_TIMEOUT,
                reason: "heartbeat timeout".into(),
            });
            self.handle_drop(now);
            return;
        }
        self.heartbeat.mark(now);
        self.ping_outstanding = Some(now);
        let ping = Envelope::new(Message::Ping, self.identity.user_id.clone(), None);
        self.transmit(&ping);
    }

    /// Manual shutdown. Idempotent.
    pub fn disconnect(&mut self) {
        if self.manual && self.state == ConnectionState::Disconnected {
            return;
        }
        self.manual = true;
        if self.socket_open || self.open_in_flight {
            self.commands.push(TransportCommand::Close {
                code: CLOSE_NORMAL,
                reason: "normal closure".into(),
            });
        }
        self.open_in_flight = false;
        self.socket_open = false;
        self.reconnect_at = None;
        self.recovering = false;
        self.ping_outstanding = None;
        self.heartbeat.reset();
        self.connection_id = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push_back(ConnectionEvent::StateChanged(state));
        }
    }

    /// Take the I/O the driver must perform, in order.
    pub fn take_commands(&mut self) -> Vec<TransportCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }
}
