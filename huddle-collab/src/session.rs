//! One browser session's view of a collaborative document.
//!
//! [`CollabSession`] composes the components and is the only thing the
//! application talks to:
//!
//! ```text
//!   UI calls ──► CollabSession ──► Presence / Cursor / Comments / Edits
//!                     │                              │
//!                     │ outbound envelopes           ▼
//!                     ▼                        ConflictResolver
//!             ConnectionManager ──► TransportCommand (driver executes)
//!                     ▲
//!   driver feeds ─────┘ on_open / on_frame / on_closed / tick
//! ```
//!
//! Everything is synchronous and owned by one task; no locking.

use std::collections::VecDeque;
use std::time::Instant;

use crate::comments::{CommentAnchor, CommentChange, CommentThreadManager, LiveComment};
use crate::config::CollabConfig;
use crate::conflict::{ConflictResolution, ConflictResolver, Resolution, ResolutionOutcome};
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, SessionIdentity, TransportCommand};
use crate::cursor::{CursorBroadcaster, CursorUpdate, SelectionRange};
use crate::dispatch::HandlerRegistry;
use crate::edits::{DocumentEdit, DocumentSubstrate, EditCoordinator, EditKind, EditOutcome, EditPosition};
use crate::error::{CollabError, Result};
use crate::presence::{ActivityKind, PresenceStatus, PresenceTracker, PresenceUpdate, RosterChange};
use crate::protocol::{Envelope, Message, MessageKind};

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStatus {
        state: ConnectionState,
        participants: usize,
    },
    Connected {
        connection_id: String,
    },
    Presence {
        change: RosterChange,
        participants: usize,
    },
    CursorMoved(CursorUpdate),
    CursorsFaded(Vec<String>),
    Comments(Vec<CommentChange>),
    EditApplied(String),
    ConflictDetected(ConflictResolution),
    ConflictResolved(ConflictResolution),
    /// Non-fatal problem worth surfacing.
    Warning(CollabError),
    /// The connection gave up. Emitted once per outage.
    TerminalError(CollabError),
}

/// The collaboration layer for one session and one joined document.
pub struct CollabSession<S: DocumentSubstrate> {
    user_id: String,
    document_id: Option<String>,
    connection: ConnectionManager,
    presence: PresenceTracker,
    cursors: CursorBroadcaster,
    comments: CommentThreadManager,
    edits: EditCoordinator,
    conflicts: ConflictResolver,
    handlers: HandlerRegistry,
    substrate: S,
    events: VecDeque<SessionEvent>,
}

impl<S: DocumentSubstrate> CollabSession<S> {
    pub fn new(config: CollabConfig, identity: SessionIdentity, substrate: S) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            user_id: identity.user_id.clone(),
            document_id: None,
            presence: PresenceTracker::new(&identity, &config),
            cursors: CursorBroadcaster::new(identity.user_id.clone(), identity.display_name.clone(), &config),
            comments: CommentThreadManager::new(identity.user_id.clone(), identity.display_name.clone()),
            edits: EditCoordinator::new(
                identity.user_id.clone(),
                identity.display_name.clone(),
                config.conflict_window,
            ),
            conflicts: ConflictResolver::new(config.resolved_history_limit),
            connection: ConnectionManager::new(&config, identity),
            handlers: HandlerRegistry::new(),
            substrate,
            events: VecDeque::new(),
        })
    }

    // ── Connection ─────────────────────────────────────────────

    pub fn connect(&mut self, now: Instant) {
        self.connection.connect(now);
        self.pump(now);
    }

    /// Best-effort departure notice, then close.
    pub fn disconnect(&mut self, now: Instant) {
        if self.connection.is_connected() {
            if let Some(doc) = self.document_id.clone() {
                self.send(Message::UserPresenceLeft(crate::presence::PresenceLeft {
                    user_id: self.user_id.clone(),
                }));
                log::debug!("Announced departure from {doc}");
            }
        }
        self.connection.disconnect();
        self.pump(now);
    }

    pub fn on_open(&mut self, now: Instant) {
        self.connection.on_open(now);
        self.pump(now);
    }

    pub fn on_frame(&mut self, text: &str, now: Instant) {
        self.connection.on_frame(text, now);
        self.pump(now);
    }

    pub fn on_closed(&mut self, now: Instant) {
        self.connection.on_closed(now);
        self.pump(now);
    }

    pub fn on_transport_error(&mut self, error: &str, now: Instant) {
        self.connection.on_transport_error(error, now);
        self.pump(now);
    }

    pub fn on_send_failed(&mut self, frame: &str) {
        self.connection.on_send_failed(frame);
    }

    // ── Document lifecycle ─────────────────────────────────────

    /// Join `document_id`, leaving the current document first.
    pub fn join_document(&mut self, document_id: impl Into<String>, now: Instant) {
        let document_id = document_id.into();
        if self.document_id.as_deref() == Some(document_id.as_str()) {
            return;
        }
        self.leave_document();

        log::info!("Joining document {document_id}");
        self.document_id = Some(document_id.clone());
        self.connection.set_document(Some(document_id.clone()));
        self.comments.reset(Some(document_id.clone()));
        self.edits.reset(Some(document_id.clone()));
        self.conflicts.clear();
        self.cursors.reset();
        let announcement = self.presence.join_document(document_id, now);
        self.send(Message::UserPresenceUpdate(announcement));
    }

    /// Leave the current document. Local teardown is unconditional.
    pub fn leave_document(&mut self) {
        let Some(document_id) = self.document_id.clone() else {
            return;
        };
        log::info!("Leaving document {document_id}");
        if let Some(left) = self.presence.leave_document() {
            self.send(Message::UserPresenceLeft(left));
        }
        self.document_id = None;
        self.connection.set_document(None);
        self.comments.reset(None);
        self.edits.reset(None);
        self.conflicts.clear();
        self.cursors.reset();
    }

    // ── Presence & cursor ──────────────────────────────────────

    pub fn record_activity(&mut self, kind: ActivityKind, now: Instant) {
        if let Some(update) = self.presence.record_activity(kind, now) {
            self.send(Message::UserPresenceUpdate(update));
        }
    }

    pub fn set_status(&mut self, status: PresenceStatus, now: Instant) {
        if let Some(update) = self.presence.set_status(status, now) {
            self.send(Message::UserPresenceUpdate(update));
        }
    }

    pub fn set_area(&mut self, area: Option<String>, now: Instant) {
        if let Some(update) = self.presence.set_area(area, now) {
            self.send(Message::UserPresenceUpdate(update));
        }
    }

    /// Local pointer moved. Also counts as activity.
    pub fn move_cursor(&mut self, x: f64, y: f64, selection: Option<SelectionRange>, now: Instant) {
        self.record_activity(ActivityKind::Pointer, now);
        if self.document_id.is_none() {
            return;
        }
        if let Some(update) = self.cursors.move_local(x, y, selection, now) {
            log::trace!("Cursor at ({x}, {y})");
            self.send(Message::CursorPosition(update));
        }
    }

    // ── Comments ───────────────────────────────────────────────

    pub fn add_comment(
        &mut self,
        content: impl Into<String>,
        anchor: Option<CommentAnchor>,
        parent_id: Option<&str>,
    ) -> Result<LiveComment> {
        let comment = self.comments.add(content, anchor, parent_id)?;
        self.send(Message::CommentAdded(comment.clone()));
        Ok(comment)
    }

    pub fn edit_comment(&mut self, id: &str, content: impl Into<String>) -> Result<LiveComment> {
        let comment = self.comments.edit(id, content)?;
        self.send(Message::CommentUpdated(comment.clone()));
        Ok(comment)
    }

    pub fn resolve_comment(&mut self, id: &str) -> Result<LiveComment> {
        let comment = self.comments.resolve(id, &self.user_id)?;
        self.send(Message::CommentUpdated(comment.clone()));
        Ok(comment)
    }

    pub fn toggle_reaction(&mut self, id: &str, emoji: &str) -> Result<LiveComment> {
        let comment = self.comments.toggle_reaction(id, &self.user_id, emoji)?;
        self.send(Message::CommentUpdated(comment.clone()));
        Ok(comment)
    }

    // ── Edits & conflicts ──────────────────────────────────────

    pub fn record_edit(
        &mut self,
        kind: EditKind,
        position: EditPosition,
        content: impl Into<String>,
        previous_content: Option<String>,
        metadata: serde_json::Value,
        now: Instant,
    ) -> Result<DocumentEdit> {
        let edit = self
            .edits
            .record_local(kind, position, content, previous_content, metadata, now)?;
        self.send(Message::DocumentEdit(edit.clone()));
        Ok(edit)
    }

    /// Settle a conflict locally and broadcast the resolution.
    pub fn resolve_conflict(&mut self, conflict_id: &str, resolution: Resolution) -> Result<ResolutionOutcome> {
        let outcome = self.conflicts.resolve(conflict_id, resolution, &self.user_id)?;
        self.finalize(&outcome);
        self.send(Message::ConflictResolved(outcome.record.clone()));
        self.events
            .push_back(SessionEvent::ConflictResolved(outcome.record.clone()));
        Ok(outcome)
    }

    fn finalize(&mut self, outcome: &ResolutionOutcome) {
        if let Err(e) = self.edits.finalize(outcome, &mut self.substrate) {
            log::warn!("Resolution of {} could not be applied: {e}", outcome.record.id);
            self.events.push_back(SessionEvent::Warning(e.into()));
        }
    }

    fn on_edit_outcome(&mut self, outcome: EditOutcome) {
        match outcome {
            EditOutcome::Applied(id) | EditOutcome::Acknowledged(id) => {
                self.events.push_back(SessionEvent::EditApplied(id));
            }
            EditOutcome::Conflicted { conflict, is_new } => {
                if is_new {
                    log::info!("Conflict {} detected", conflict.id);
                }
                self.send(Message::ConflictDetected(conflict.clone()));
                self.events.push_back(SessionEvent::ConflictDetected(conflict));
            }
            EditOutcome::Ignored | EditOutcome::Duplicate => {}
        }
    }

    // ── Timers ─────────────────────────────────────────────────

    /// Drive every timer: heartbeat, reconnect, presence, cursor fade, edits.
    pub fn tick(&mut self, now: Instant) {
        self.connection.tick(now);

        let presence = self.presence.tick(now);
        if let Some(update) = presence.broadcast {
            self.send(Message::UserPresenceUpdate(update));
        }
        for user_id in presence.expired {
            self.cursors.remove(&user_id);
            self.events.push_back(SessionEvent::Presence {
                change: RosterChange::Expired(user_id),
                participants: self.presence.participant_count(),
            });
        }

        let faded = self.cursors.tick(now);
        if !faded.is_empty() {
            self.events.push_back(SessionEvent::CursorsFaded(faded));
        }

        for outcome in self.edits.tick(now, &mut self.substrate, &mut self.conflicts) {
            self.on_edit_outcome(outcome);
        }

        self.pump(now);
    }

    // ── Inbound ────────────────────────────────────────────────

    fn pump(&mut self, now: Instant) {
        while let Some(event) = self.connection.poll_event() {
            match event {
                ConnectionEvent::StateChanged(state) => {
                    if state == ConnectionState::Connected {
                        if let Some(update) = self.presence.announcement(now) {
                            self.send(Message::UserPresenceUpdate(update));
                        }
                    }
                    self.events.push_back(SessionEvent::ConnectionStatus {
                        state,
                        participants: self.presence.participant_count(),
                    });
                }
                ConnectionEvent::Established { connection_id } => {
                    self.events.push_back(SessionEvent::Connected { connection_id });
                }
                ConnectionEvent::Inbound(envelope) => self.handle_inbound(envelope, now),
                ConnectionEvent::Malformed(_) => {}
                ConnectionEvent::TerminalError(e) => {
                    self.events.push_back(SessionEvent::TerminalError(e));
                }
            }
        }
    }

    fn handle_inbound(&mut self, envelope: Envelope, now: Instant) {
        if let (Some(theirs), Some(ours)) = (&envelope.document_id, &self.document_id) {
            if theirs != ours {
                log::debug!("Dropping {} for document {theirs}", envelope.kind());
                return;
            }
        }
        if self.document_id.is_none() {
            log::debug!("Dropping {} while not joined", envelope.kind());
            return;
        }
        log::debug!("Inbound {} from {}", envelope.kind(), envelope.sender_id);

        match &envelope.message {
            Message::UserPresenceUpdate(update) => {
                if let Some(change) = self.presence.apply_remote(update.clone(), now) {
                    self.presence_event(change);
                }
            }
            Message::UserPresenceLeft(left) => {
                self.cursors.remove(&left.user_id);
                if let Some(change) = self.presence.apply_left(&left.user_id) {
                    self.presence_event(change);
                }
            }
            Message::CursorPosition(update) => {
                if self.cursors.apply_remote(update.clone(), now) {
                    self.presence.set_cursor(&update.user_id, update.position());
                    self.events.push_back(SessionEvent::CursorMoved(update.clone()));
                }
            }
            Message::CommentAdded(comment) | Message::CommentUpdated(comment) => {
                match self.comments.apply_remote(comment.clone()) {
                    Ok(changes) if !changes.is_empty() => {
                        self.events.push_back(SessionEvent::Comments(changes));
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Comment {} rejected: {e}", comment.id),
                }
            }
            Message::DocumentEdit(edit) => {
                let outcome = self
                    .edits
                    .apply_remote(edit.clone(), &mut self.substrate, &mut self.conflicts);
                self.on_edit_outcome(outcome);
            }
            Message::ConflictDetected(record) => {
                self.edits.hold(record.edit_ids(), &mut self.substrate);
                let (merged, changed) = self.conflicts.apply_remote_detected(record.clone());
                if changed {
                    self.events.push_back(SessionEvent::ConflictDetected(merged));
                }
            }
            Message::ConflictResolved(record) => {
                if let Some(outcome) = self.conflicts.apply_remote_resolved(record.clone()) {
                    self.finalize(&outcome);
                    self.events
                        .push_back(SessionEvent::ConflictResolved(outcome.record));
                }
            }
            Message::Ping | Message::Pong | Message::ConnectionEstablished(_) => {}
        }

        self.handlers.dispatch(&envelope);
    }

    fn presence_event(&mut self, change: RosterChange) {
        self.events.push_back(SessionEvent::Presence {
            change,
            participants: self.presence.participant_count(),
        });
    }

    fn send(&mut self, message: Message) {
        let envelope = Envelope::new(message, self.user_id.clone(), self.document_id.clone());
        self.connection.send(envelope);
    }

    // ── Outputs & accessors ────────────────────────────────────

    /// Register an observer for inbound messages of `kind`.
    pub fn on<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        self.handlers.on(kind, handler);
    }

    pub fn take_commands(&mut self) -> Vec<TransportCommand> {
        self.connection.take_commands()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn cursors(&self) -> &CursorBroadcaster {
        &self.cursors
    }

    pub fn comments(&self) -> &CommentThreadManager {
        &self.comments
    }

    pub fn edits(&self) -> &EditCoordinator {
        &self.edits
    }

    pub fn conflicts(&self) -> &ConflictResolver {
        &self.conflicts
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn substrate_mut(&mut self) -> &mut S {
        &mut self.substrate
    }

    /// Presence announcement for the current document, if joined.
    pub fn local_presence(&mut self, now: Instant) -> Option<PresenceUpdate> {
        self.presence.announcement(now)
    }
}
