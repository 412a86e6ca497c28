//! Error types for the collaboration layer.
//!
//! Only local, synchronous failures are represented here. Transport failures
//! are reported through [`ConnectionEvent`](crate::connection::ConnectionEvent)
//! and recovered by the reconnect policy; overlapping edits are not errors at
//! all but conflicts (see [`crate::conflict`]).

use thiserror::Error;

/// Wire encode/decode failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Rejected comment operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommentError {
    #[error("comment {0} not found")]
    NotFound(String),
    #[error("thread root {0} not found")]
    UnknownThread(String),
    #[error("comment {0} is already resolved")]
    AlreadyResolved(String),
    #[error("comment {id} belongs to document {document_id}")]
    WrongDocument { id: String, document_id: String },
}

/// Rejected conflict operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("conflict {0} is not active")]
    NotActive(String),
    #[error("conflict {0} has no edits")]
    Empty(String),
}

/// The document substrate refused to apply an edit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("anchor {position} is outside the document (length {len})")]
    OutOfRange { position: usize, len: usize },
    #[error("invalid range {start}..{end}")]
    InvalidRange { start: usize, end: usize },
}

/// Umbrella error returned by session-level operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollabError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("no document joined")]
    NotJoined,
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("client task has shut down")]
    ClientClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Comment(#[from] CommentError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

pub type Result<T, E = CollabError> = std::result::Result<T, E>;
