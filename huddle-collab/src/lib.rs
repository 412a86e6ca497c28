//! # huddle-collab - Real-time collaboration coordination layer
//!
//! Presence, live cursors, threaded comments, edit propagation and conflict
//! handling for a shared document, over one persistent WebSocket per session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌─────────────┐
//! │ CollabClient     │ ◄────────────────► │ Relay       │
//! │  └ CollabSession │     JSON frames    │ (fan-out)   │
//! └────────┬─────────┘                    └──────┬──────┘
//!          │                                     │
//!          ▼                                     ▼
//! ┌──────────────────────────────┐        one broadcast
//! │ Presence · Cursors · Comments│        channel per
//! │ Edits ─► ConflictResolver    │        document room
//! │ ConnectionManager (queue)    │
//! └──────────────────────────────┘
//! ```
//!
//! The components are synchronous state machines driven with explicit
//! `Instant`s; [`client::CollabClient`] runs them on a tokio task.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope and message kinds
//! - [`connection`]: lifecycle, heartbeat, reconnect, offline queue
//! - [`presence`]: roster, idle detection, leases
//! - [`cursor`]: throttled cursor broadcast and fade-out
//! - [`comments`]: anchored threads, replies, reactions
//! - [`edits`]: edit log and the document substrate seam
//! - [`conflict`]: conflict grouping and resolution strategies
//! - [`session`]: composition of the above for one document
//! - [`client`]: tokio / tokio-tungstenite driver
//! - [`relay`]: reference fan-out endpoint

pub mod client;
pub mod comments;
pub mod config;
pub mod conflict;
pub mod connection;
pub mod cursor;
pub mod dispatch;
pub mod edits;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod throttle;

// Re-exports for convenience
pub use client::CollabClient;
pub use comments::{CommentAnchor, CommentChange, CommentThread, CommentThreadManager, LiveComment, Reaction};
pub use config::{CollabConfig, RelayConfig};
pub use conflict::{
    ConflictResolution, ConflictResolver, Resolution, ResolutionOutcome, ResolutionStrategy, Severity,
};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionMetrics, ConnectionState, OutboundQueue, SessionIdentity,
    TransportCommand,
};
pub use cursor::{cursor_color, CursorBroadcaster, CursorUpdate, Point, RemoteCursor, SelectionRange};
pub use dispatch::{Handler, HandlerRegistry};
pub use edits::{
    DocumentEdit, DocumentSubstrate, EditCoordinator, EditKind, EditOutcome, EditPosition, PlainTextDocument,
};
pub use error::{CollabError, CommentError, ConflictError, ProtocolError, Result, SubstrateError};
pub use presence::{
    ActivityKind, PresenceLeft, PresenceStatus, PresenceTracker, PresenceUpdate, RosterChange, UserPresence,
};
pub use protocol::{Envelope, Handshake, Message, MessageKind};
pub use relay::{Relay, RelayStats};
pub use session::{CollabSession, SessionEvent};
pub use throttle::{FixedWindow, MovementThrottle};
