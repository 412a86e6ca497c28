//! Async driver that runs a [`CollabSession`] over tokio-tungstenite.
//!
//! One task owns the session. Application calls become requests on a
//! channel, socket traffic and the tick interval are fed in as inputs, and
//! the session's transport commands are executed after every step:
//!
//! ```text
//!  CollabClient ──requests──┐
//!  reader task ──inbound────┼──► driver task ── CollabSession
//!  tick interval ───────────┘        │
//!                                    ├──► WebSocket sink (Open / Send / Close)
//!                                    └──► SessionEvent channel
//! ```
//!
//! Each socket gets a generation number; input from an older socket is
//! ignored.

use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::comments::{CommentAnchor, LiveComment};
use crate::config::CollabConfig;
use crate::conflict::{Resolution, ResolutionOutcome};
use crate::connection::{SessionIdentity, TransportCommand};
use crate::cursor::SelectionRange;
use crate::edits::{DocumentEdit, DocumentSubstrate, EditKind, EditPosition};
use crate::error::{CollabError, Result};
use crate::presence::{ActivityKind, PresenceStatus};
use crate::protocol::{Envelope, MessageKind};
use crate::session::{CollabSession, SessionEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type Reply<T> = oneshot::Sender<Result<T>>;
type Inspect<S> = Box<dyn FnOnce(&CollabSession<S>) + Send>;

enum ClientRequest<S: DocumentSubstrate> {
    Connect,
    Disconnect,
    Join(String),
    Leave,
    Activity(ActivityKind),
    Status(PresenceStatus),
    Area(Option<String>),
    Cursor {
        x: f64,
        y: f64,
        selection: Option<SelectionRange>,
    },
    AddComment {
        content: String,
        anchor: Option<CommentAnchor>,
        parent_id: Option<String>,
        reply: Reply<LiveComment>,
    },
    EditComment {
        id: String,
        content: String,
        reply: Reply<LiveComment>,
    },
    ResolveComment {
        id: String,
        reply: Reply<LiveComment>,
    },
    ToggleReaction {
        id: String,
        emoji: String,
        reply: Reply<LiveComment>,
    },
    RecordEdit {
        kind: EditKind,
        position: EditPosition,
        content: String,
        previous_content: Option<String>,
        metadata: serde_json::Value,
        reply: Reply<DocumentEdit>,
    },
    ResolveConflict {
        conflict_id: String,
        resolution: Resolution,
        reply: Reply<ResolutionOutcome>,
    },
    Subscribe(MessageKind, Box<dyn FnMut(&Envelope) + Send>),
    Inspect(Inspect<S>),
    Shutdown,
}

/// What the reader and connect tasks report back to the driver.
enum Inbound {
    Opened { generation: u64, sink: WsSink },
    OpenFailed { generation: u64, error: String },
    Frame { generation: u64, text: String },
    Closed { generation: u64 },
    Failed { generation: u64, error: String },
}

/// Handle to a session running on a background task.
pub struct CollabClient<S: DocumentSubstrate + Send + 'static> {
    requests: mpsc::UnboundedSender<ClientRequest<S>>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    task: JoinHandle<()>,
}

impl<S: DocumentSubstrate + Send + 'static> CollabClient<S> {
    /// Validate `config` and start the driver task. Does not connect yet.
    pub fn spawn(config: CollabConfig, identity: SessionIdentity, substrate: S) -> Result<Self> {
        let tick_interval = config.tick_interval;
        let session = CollabSession::new(config, identity, substrate)?;
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            session,
            events: event_tx,
            sink: None,
            generation: 0,
        };
        let task = tokio::spawn(driver.run(request_rx, tick_interval));

        Ok(Self {
            requests: request_tx,
            event_rx: Some(event_rx),
            task,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    fn request(&self, request: ClientRequest<S>) -> Result<()> {
        self.requests.send(request).map_err(|_| CollabError::ClientClosed)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> ClientRequest<S>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.request(build(tx))?;
        rx.await.map_err(|_| CollabError::ClientClosed)?
    }

    pub fn connect(&self) -> Result<()> {
        self.request(ClientRequest::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.request(ClientRequest::Disconnect)
    }

    pub fn join_document(&self, document_id: impl Into<String>) -> Result<()> {
        self.request(ClientRequest::Join(document_id.into()))
    }

    pub fn leave_document(&self) -> Result<()> {
        self.request(ClientRequest::Leave)
    }

    pub fn record_activity(&self, kind: ActivityKind) -> Result<()> {
        self.request(ClientRequest::Activity(kind))
    }

    pub fn set_status(&self, status: PresenceStatus) -> Result<()> {
        self.request(ClientRequest::Status(status))
    }

    pub fn set_area(&self, area: Option<String>) -> Result<()> {
        self.request(ClientRequest::Area(area))
    }

    pub fn move_cursor(&self, x: f64, y: f64, selection: Option<SelectionRange>) -> Result<()> {
        self.request(ClientRequest::Cursor { x, y, selection })
    }

    pub async fn add_comment(
        &self,
        content: impl Into<String>,
        anchor: Option<CommentAnchor>,
        parent_id: Option<String>,
    ) -> Result<LiveComment> {
        let content = content.into();
        self.call(|reply| ClientRequest::AddComment {
            content,
            anchor,
            parent_id,
            reply,
        })
        .await
    }

    pub async fn edit_comment(&self, id: impl Into<String>, content: impl Into<String>) -> Result<LiveComment> {
        let (id, content) = (id.into(), content.into());
        self.call(|reply| ClientRequest::EditComment { id, content, reply }).await
    }

    pub async fn resolve_comment(&self, id: impl Into<String>) -> Result<LiveComment> {
        let id = id.into();
        self.call(|reply| ClientRequest::ResolveComment { id, reply }).await
    }

    pub async fn toggle_reaction(&self, id: impl Into<String>, emoji: impl Into<String>) -> Result<LiveComment> {
        let (id, emoji) = (id.into(), emoji.into());
        self.call(|reply| ClientRequest::ToggleReaction { id, emoji, reply }).await
    }

    pub async fn record_edit(
        &self,
        kind: EditKind,
        position: EditPosition,
        content: impl Into<String>,
        previous_content: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<DocumentEdit> {
        let content = content.into();
        self.call(|reply| ClientRequest::RecordEdit {
            kind,
            position,
            content,
            previous_content,
            metadata,
            reply,
        })
        .await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: impl Into<String>,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome> {
        let conflict_id = conflict_id.into();
        self.call(|reply| ClientRequest::ResolveConflict {
            conflict_id,
            resolution,
            reply,
        })
        .await
    }

    /// Register an observer for inbound messages of `kind`.
    pub fn on<F>(&self, kind: MessageKind, handler: F) -> Result<()>
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        self.request(ClientRequest::Subscribe(kind, Box::new(handler)))
    }

    /// Run `f` against the session on the driver task and return its result.
    pub async fn with_session<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&CollabSession<S>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.request(ClientRequest::Inspect(Box::new(move |session: &CollabSession<S>| {
            let _ = tx.send(f(session));
        })))?;
        rx.await.map_err(|_| CollabError::ClientClosed)
    }

    /// Leave, close the socket and stop the driver.
    pub async fn shutdown(self) -> Result<()> {
        self.request(ClientRequest::Shutdown)?;
        self.task
            .await
            .map_err(|e| CollabError::Transport(format!("driver task failed: {e}")))
    }
}

struct Driver<S: DocumentSubstrate> {
    session: CollabSession<S>,
    events: mpsc::UnboundedSender<SessionEvent>,
    sink: Option<WsSink>,
    generation: u64,
}

impl<S: DocumentSubstrate + Send + 'static> Driver<S> {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<ClientRequest<S>>, tick_interval: Duration) {
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(256);
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = requests.recv() => {
                    match request {
                        Some(ClientRequest::Shutdown) | None => {
                            self.session.leave_document();
                            self.session.disconnect(Instant::now());
                            self.flush(&inbound_tx).await;
                            break;
                        }
                        Some(request) => self.handle_request(request),
                    }
                }
                Some(inbound) = inbound_rx.recv() => self.handle_inbound(inbound),
                _ = ticker.tick() => self.session.tick(Instant::now()),
            }
            self.flush(&inbound_tx).await;
        }
        log::info!("Collaboration driver for {} stopped", self.session.user_id());
    }

    fn handle_request(&mut self, request: ClientRequest<S>) {
        let now = Instant::now();
        let session = &mut self.session;
        match request {
            ClientRequest::Connect => session.connect(now),
            ClientRequest::Disconnect => session.disconnect(now),
            ClientRequest::Join(document_id) => session.join_document(document_id, now),
            ClientRequest::Leave => session.leave_document(),
            ClientRequest::Activity(kind) => session.record_activity(kind, now),
            ClientRequest::Status(status) => session.set_status(status, now),
            ClientRequest::Area(area) => session.set_area(area, now),
            ClientRequest::Cursor { x, y, selection } => session.move_cursor(x, y, selection, now),
            ClientRequest::AddComment {
                content,
                anchor,
                parent_id,
                reply,
            } => {
                let _ = reply.send(session.add_comment(content, anchor, parent_id.as_deref()));
            }
            ClientRequest::EditComment { id, content, reply } => {
                let _ = reply.send(session.edit_comment(&id, content));
            }
            ClientRequest::ResolveComment { id, reply } => {
                let _ = reply.send(session.resolve_comment(&id));
            }
            ClientRequest::ToggleReaction { id, emoji, reply } => {
                let _ = reply.send(session.toggle_reaction(&id, &emoji));
            }
            ClientRequest::RecordEdit {
                kind,
                position,
                content,
                previous_content,
                metadata,
                reply,
            } => {
                let _ = reply.send(session.record_edit(kind, position, content, previous_content, metadata, now));
            }
            ClientRequest::ResolveConflict {
                conflict_id,
                resolution,
                reply,
            } => {
                let _ = reply.send(session.resolve_conflict(&conflict_id, resolution));
            }
            ClientRequest::Subscribe(kind, handler) => session.on(kind, handler),
            ClientRequest::Inspect(f) => f(&*session),
            ClientRequest::Shutdown => {}
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let now = Instant::now();
        match inbound {
            Inbound::Opened { generation, sink } if generation == self.generation => {
                self.sink = Some(sink);
                self.session.on_open(now);
            }
            Inbound::OpenFailed { generation, error } if generation == self.generation => {
                self.session.on_transport_error(&error, now);
            }
            Inbound::Frame { generation, text } if generation == self.generation => {
                self.session.on_frame(&text, now);
            }
            Inbound::Closed { generation } if generation == self.generation => {
                self.sink = None;
                self.session.on_closed(now);
            }
            Inbound::Failed { generation, error } if generation == self.generation => {
                self.sink = None;
                self.session.on_transport_error(&error, now);
            }
            _ => log::trace!("Ignoring input from a retired socket"),
        }
    }

    /// Execute pending transport commands and forward session events.
    async fn flush(&mut self, inbound_tx: &mpsc::Sender<Inbound>) {
        loop {
            let commands = self.session.take_commands();
            if commands.is_empty() {
                break;
            }
            for command in commands {
                self.execute(command, inbound_tx).await;
            }
        }
        for event in self.session.drain_events() {
            if self.events.send(event).is_err() {
                log::trace!("Event receiver dropped");
            }
        }
    }

    async fn execute(&mut self, command: TransportCommand, inbound_tx: &mpsc::Sender<Inbound>) {
        match command {
            TransportCommand::Open { url } => {
                self.generation += 1;
                self.sink = None;
                tokio::spawn(open_socket(url, self.generation, inbound_tx.clone()));
            }
            TransportCommand::Send { frame } => {
                let written = match self.sink.as_mut() {
                    Some(sink) => sink.send(WsMessage::text(frame.clone())).await.map_err(|e| e.to_string()),
                    None => Err("no open socket".to_string()),
                };
                if let Err(e) = written {
                    log::warn!("Write failed: {e}");
                    self.session.on_send_failed(&frame);
                    if self.sink.take().is_some() {
                        self.generation += 1;
                        self.session.on_transport_error(&e, Instant::now());
                    }
                }
            }
            TransportCommand::Close { code, reason } => {
                self.generation += 1;
                if let Some(mut sink) = self.sink.take() {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                        log::debug!("Close frame not delivered: {e}");
                    }
                    let _ = sink.close().await;
                }
            }
        }
    }
}

/// Connect, hand the write half to the driver and pump the read half.
async fn open_socket(url: String, generation: u64, inbound: mpsc::Sender<Inbound>) {
    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let _ = inbound
                .send(Inbound::OpenFailed {
                    generation,
                    error: e.to_string(),
                })
                .await;
            return;
        }
    };
    let (sink, mut reader) = stream.split();
    if inbound.send(Inbound::Opened { generation, sink }).await.is_err() {
        return;
    }

    let last = loop {
        match reader.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let frame = Inbound::Frame {
                    generation,
                    text: text.as_str().to_owned(),
                };
                if inbound.send(frame).await.is_err() {
                    return;
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => break Inbound::Closed { generation },
            Some(Err(e)) => {
                break Inbound::Failed {
                    generation,
                    error: e.to_string(),
                }
            }
            Some(Ok(_)) => {}
        }
    };
    let _ = inbound.send(last).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edits::PlainTextDocument;

    fn identity() -> SessionIdentity {
        SessionIdentity::new("alice", "Alice")
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_config() {
        let config = CollabConfig::default().with_queue_capacity(0);
        let result = CollabClient::spawn(config, identity(), PlainTextDocument::new(""));
        assert!(matches!(result, Err(CollabError::Config(_))));
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = CollabClient::spawn(CollabConfig::default(), identity(), PlainTextDocument::new("")).unwrap();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_comment_is_queued() {
        let client = CollabClient::spawn(CollabConfig::default(), identity(), PlainTextDocument::new("")).unwrap();
        client.join_document("doc-1").unwrap();
        let comment = client.add_comment("hello", None, None).await.unwrap();
        assert_eq!(comment.author_id, "alice");

        let queued = client.with_session(|s| s.connection().queued_len()).await.unwrap();
        // presence announcement + comment
        assert_eq!(queued, 2);
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_before_join_fail() {
        let client = CollabClient::spawn(CollabConfig::default(), identity(), PlainTextDocument::new("")).unwrap();
        let err = client
            .record_edit(EditKind::Insert, EditPosition::at(0), "x", None, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, CollabError::NotJoined);
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_up_once() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = CollabConfig::new(format!("ws://127.0.0.1:{port}"))
            .with_reconnect(2, Duration::from_millis(20))
            .with_tick_interval(Duration::from_millis(5));
        let mut client = CollabClient::spawn(config, identity(), PlainTextDocument::new("")).unwrap();
        let mut events = client.take_event_rx().unwrap();
        client.connect().unwrap();

        let terminal = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(SessionEvent::TerminalError(e)) => return Some(e),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(terminal, Some(CollabError::ReconnectExhausted { attempts: 2 }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::TerminalError(_)));
        }
        client.shutdown().await.unwrap();
    }
}
