//! Threaded comments anchored to a document.
//!
//! Local changes are applied optimistically and broadcast; the authoritative
//! broadcast is merged back by id with last-write-wins on `updated_at`.
//! Threads are one level deep: a reply to a reply is attached to the root.
//!
//! Replies can outrun their root on the wire. They wait in a pending buffer
//! keyed by the missing root id and are attached when it arrives.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, CommentError};
use crate::protocol::{new_id, unix_millis};

/// Where a comment is pinned on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentAnchor {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

/// One user's emoji on a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: String,
    pub emoji: String,
    pub timestamp: u64,
}

/// `comment_added` / `comment_updated` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveComment {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<CommentAnchor>,
    /// `None` for a thread root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl LiveComment {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn has_reaction(&self, user_id: &str, emoji: &str) -> bool {
        self.reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
    }

    fn touch(&mut self) {
        self.updated_at = unix_millis().max(self.updated_at + 1);
    }
}

/// A root and its replies, in arrival order.
#[derive(Debug)]
pub struct CommentThread<'a> {
    pub root: &'a LiveComment,
    pub replies: Vec<&'a LiveComment>,
}

/// What a remote comment did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentChange {
    Added(String),
    Updated(String),
    /// Reply held until its root arrives.
    Buffered(String),
    /// Previously buffered reply now attached.
    Attached(String),
}

/// Comment cache for the joined document.
pub struct CommentThreadManager {
    author_id: String,
    author_name: String,
    document_id: Option<String>,
    comments: HashMap<String, LiveComment>,
    /// Comment ids in arrival order.
    order: Vec<String>,
    /// Replies waiting for their root, keyed by root id.
    pending: HashMap<String, Vec<LiveComment>>,
}

impl CommentThreadManager {
    pub fn new(author_id: impl Into<String>, author_name: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
            author_name: author_name.into(),
            document_id: None,
            comments: HashMap::new(),
            order: Vec::new(),
            pending: HashMap::new(),
        }
    }

    /// Switch documents, dropping every cached comment.
    pub fn reset(&mut self, document_id: Option<String>) {
        self.document_id = document_id;
        self.comments.clear();
        self.order.clear();
        self.pending.clear();
    }

    /// Create a comment or reply authored by the local user.
    pub fn add(
        &mut self,
        content: impl Into<String>,
        anchor: Option<CommentAnchor>,
        parent_id: Option<&str>,
    ) -> Result<LiveComment, CollabError> {
        let document_id = self.document_id.clone().ok_or(CollabError::NotJoined)?;
        let parent_id = match parent_id {
            None => None,
            Some(parent) => {
                let root = self
                    .root_of(parent)
                    .ok_or_else(|| CommentError::UnknownThread(parent.to_string()))?;
                Some(root)
            }
        };
        let now = unix_millis();
        let comment = LiveComment {
            id: new_id(),
            content: content.into(),
            author_id: self.author_id.clone(),
            author_name: self.author_name.clone(),
            document_id,
            anchor,
            parent_id,
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
            reactions: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.insert(comment.clone());
        Ok(comment)
    }

    /// Replace a comment's text.
    pub fn edit(&mut self, id: &str, content: impl Into<String>) -> Result<LiveComment, CommentError> {
        let comment = self.get_mut(id)?;
        comment.content = content.into();
        comment.touch();
        Ok(comment.clone())
    }

    /// Mark a comment resolved. Resolving twice is rejected.
    pub fn resolve(&mut self, id: &str, resolver: &str) -> Result<LiveComment, CommentError> {
        let comment = self.get_mut(id)?;
        if comment.is_resolved {
            return Err(CommentError::AlreadyResolved(id.to_string()));
        }
        comment.is_resolved = true;
        comment.resolved_by = Some(resolver.to_string());
        comment.resolved_at = Some(unix_millis());
        comment.touch();
        Ok(comment.clone())
    }

    /// Add `emoji` from `user_id`, or remove it if already present.
    pub fn toggle_reaction(&mut self, id: &str, user_id: &str, emoji: &str) -> Result<LiveComment, CommentError> {
        let comment = self.get_mut(id)?;
        let before = comment.reactions.len();
        comment
            .reactions
            .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        if comment.reactions.len() == before {
            comment.reactions.push(Reaction {
                user_id: user_id.to_string(),
                emoji: emoji.to_string(),
                timestamp: unix_millis(),
            });
        }
        comment.touch();
        Ok(comment.clone())
    }

    /// Merge a comment broadcast by the endpoint.
    pub fn apply_remote(&mut self, mut comment: LiveComment) -> Result<Vec<CommentChange>, CommentError> {
        if self.document_id.as_deref() != Some(comment.document_id.as_str()) {
            return Err(CommentError::WrongDocument {
                id: comment.id,
                document_id: comment.document_id,
            });
        }

        if let Some(existing) = self.comments.get_mut(&comment.id) {
            if comment.updated_at < existing.updated_at {
                log::debug!("Stale update for comment {} ignored", comment.id);
                return Ok(Vec::new());
            }
            let id = comment.id.clone();
            // keep the thread placement we already normalized
            comment.parent_id = existing.parent_id.clone();
            *existing = comment;
            return Ok(vec![CommentChange::Updated(id)]);
        }

        let parent = match comment.parent_id.clone() {
            None => {
                let id = comment.id.clone();
                self.insert(comment);
                let mut changes = vec![CommentChange::Added(id.clone())];
                self.attach_pending(&id, &mut changes);
                return Ok(changes);
            }
            Some(parent) => parent,
        };

        match self.root_of(&parent) {
            Some(root) => {
                let id = comment.id.clone();
                comment.parent_id = Some(root);
                self.insert(comment);
                let mut changes = vec![CommentChange::Added(id.clone())];
                self.attach_pending(&id, &mut changes);
                Ok(changes)
            }
            None => {
                log::debug!("Reply {} waiting for thread {}", comment.id, parent);
                let id = comment.id.clone();
                let waiting = self.pending.entry(parent).or_default();
                match waiting.iter_mut().find(|c| c.id == comment.id) {
                    Some(held) if held.updated_at <= comment.updated_at => *held = comment,
                    Some(_) => {}
                    None => waiting.push(comment),
                }
                Ok(vec![CommentChange::Buffered(id)])
            }
        }
    }

    fn attach_pending(&mut self, arrived: &str, changes: &mut Vec<CommentChange>) {
        let mut stack = vec![arrived.to_string()];
        while let Some(parent) = stack.pop() {
            let Some(replies) = self.pending.remove(&parent) else {
                continue;
            };
            let Some(root) = self.root_of(&parent) else {
                continue;
            };
            for mut reply in replies {
                if self.comments.contains_key(&reply.id) {
                    continue;
                }
                log::debug!("Attaching buffered reply {} to {}", reply.id, root);
                reply.parent_id = Some(root.clone());
                stack.push(reply.id.clone());
                changes.push(CommentChange::Attached(reply.id.clone()));
                self.insert(reply);
            }
        }
    }

    fn insert(&mut self, comment: LiveComment) {
        self.order.push(comment.id.clone());
        self.comments.insert(comment.id.clone(), comment);
    }

    /// Thread root for a known comment id.
    fn root_of(&self, id: &str) -> Option<String> {
        let comment = self.comments.get(id)?;
        Some(comment.parent_id.clone().unwrap_or_else(|| comment.id.clone()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut LiveComment, CommentError> {
        self.comments
            .get_mut(id)
            .ok_or_else(|| CommentError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&LiveComment> {
        self.comments.get(id)
    }

    /// Roots in display order with their replies.
    pub fn threads(&self) -> Vec<CommentThread<'_>> {
        let mut threads: Vec<CommentThread<'_>> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for id in &self.order {
            let Some(comment) = self.comments.get(id) else {
                continue;
            };
            if comment.is_root() {
                index.insert(comment.id.as_str(), threads.len());
                threads.push(CommentThread {
                    root: comment,
                    replies: Vec::new(),
                });
            }
        }
        for id in &self.order {
            let Some(comment) = self.comments.get(id) else {
                continue;
            };
            if let Some(slot) = comment.parent_id.as_deref().and_then(|p| index.get(p)) {
                threads[*slot].replies.push(comment);
            }
        }
        threads
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn pending_reply_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Unresolved thread roots.
    pub fn unresolved_count(&self) -> usize {
        self.comments
            .values()
            .filter(|c| c.is_root() && !c.is_resolved)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CommentThreadManager {
        let mut m = CommentThreadManager::new("alice", "Alice");
        m.reset(Some("doc".into()));
        m
    }

    fn remote(id: &str, parent: Option<&str>, updated_at: u64) -> LiveComment {
        LiveComment {
            id: id.into(),
            content: format!("comment {id}"),
            author_id: "bob".into(),
            author_name: "Bob".into(),
            document_id: "doc".into(),
            anchor: None,
            parent_id: parent.map(String::from),
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
            reactions: Vec::new(),
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn test_add_requires_document() {
        let mut m = CommentThreadManager::new("alice", "Alice");
        assert_eq!(m.add("hi", None, None).unwrap_err(), CollabError::NotJoined);
    }

    #[test]
    fn test_add_root_and_reply() {
        let mut m = manager();
        let root = m
            .add("Check this chart", Some(CommentAnchor { x: 1.0, y: 2.0, element_id: None }), None)
            .unwrap();
        let reply = m.add("Agreed", None, Some(&root.id)).unwrap();
        assert_eq!(reply.parent_id.as_deref(), Some(root.id.as_str()));

        let threads = m.threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].replies.len(), 1);
        assert_eq!(m.unresolved_count(), 1);
    }

    #[test]
    fn test_reply_to_reply_attaches_to_root() {
        let mut m = manager();
        let root = m.add("root", None, None).unwrap();
        let reply = m.add("reply", None, Some(&root.id)).unwrap();
        let nested = m.add("nested", None, Some(&reply.id)).unwrap();
        assert_eq!(nested.parent_id, Some(root.id));
    }

    #[test]
    fn test_reply_to_unknown_thread_rejected() {
        let mut m = manager();
        let err = m.add("reply", None, Some("missing")).unwrap_err();
        assert_eq!(err, CollabError::Comment(CommentError::UnknownThread("missing".into())));
    }

    #[test]
    fn test_resolve_once() {
        let mut m = manager();
        let root = m.add("root", None, None).unwrap();
        let resolved = m.resolve(&root.id, "alice").unwrap();
        assert!(resolved.is_resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("alice"));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(m.unresolved_count(), 0);
        assert_eq!(
            m.resolve(&root.id, "bob"),
            Err(CommentError::AlreadyResolved(root.id.clone()))
        );
    }

    #[test]
    fn test_edit_bumps_updated_at() {
        let mut m = manager();
        let root = m.add("tpyo", None, None).unwrap();
        let edited = m.edit(&root.id, "typo").unwrap();
        assert_eq!(edited.content, "typo");
        assert!(edited.updated_at > root.updated_at);
        assert_eq!(m.edit("nope", "x"), Err(CommentError::NotFound("nope".into())));
    }

    #[test]
    fn test_reaction_toggle_twice_is_identity() {
        let mut m = manager();
        let root = m.add("root", None, None).unwrap();
        let once = m.toggle_reaction(&root.id, "bob", "👍").unwrap();
        assert!(once.has_reaction("bob", "👍"));
        m.toggle_reaction(&root.id, "carol", "👍").unwrap();
        let twice = m.toggle_reaction(&root.id, "bob", "👍").unwrap();
        assert!(!twice.has_reaction("bob", "👍"));
        assert_eq!(twice.reactions.len(), 1);
    }

    #[test]
    fn test_remote_dedup_and_last_write_wins() {
        let mut m = manager();
        assert_eq!(
            m.apply_remote(remote("c1", None, 10)).unwrap(),
            vec![CommentChange::Added("c1".into())]
        );

        let mut newer = remote("c1", None, 20);
        newer.content = "newer".into();
        assert_eq!(m.apply_remote(newer).unwrap(), vec![CommentChange::Updated("c1".into())]);

        let mut older = remote("c1", None, 15);
        older.content = "older".into();
        assert!(m.apply_remote(older).unwrap().is_empty());

        assert_eq!(m.len(), 1);
        assert_eq!(m.get("c1").unwrap().content, "newer");
    }

    #[test]
    fn test_own_comment_echo_reconciles() {
        let mut m = manager();
        let local = m.add("mine", None, None).unwrap();
        let changes = m.apply_remote(local.clone()).unwrap();
        assert_eq!(changes, vec![CommentChange::Updated(local.id.clone())]);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_orphan_reply_buffered_until_root_arrives() {
        let mut m = manager();
        assert_eq!(
            m.apply_remote(remote("reply-1", Some("root-9"), 5)).unwrap(),
            vec![CommentChange::Buffered("reply-1".into())]
        );
        assert_eq!(m.pending_reply_count(), 1);
        assert!(m.threads().is_empty());

        let changes = m.apply_remote(remote("root-9", None, 4)).unwrap();
        assert_eq!(
            changes,
            vec![
                CommentChange::Added("root-9".into()),
                CommentChange::Attached("reply-1".into())
            ]
        );
        assert_eq!(m.pending_reply_count(), 0);
        let threads = m.threads();
        assert_eq!(threads[0].root.id, "root-9");
        assert_eq!(threads[0].replies[0].id, "reply-1");
    }

    #[test]
    fn test_buffered_chain_attaches_to_root() {
        let mut m = manager();
        // reply-to-reply arrives first, then the reply, then the root
        m.apply_remote(remote("r2", Some("r1"), 3)).unwrap();
        m.apply_remote(remote("r1", Some("root"), 2)).unwrap();
        m.apply_remote(remote("root", None, 1)).unwrap();

        assert_eq!(m.pending_reply_count(), 0);
        assert_eq!(m.get("r2").unwrap().parent_id.as_deref(), Some("root"));
        assert_eq!(m.threads()[0].replies.len(), 2);
    }

    #[test]
    fn test_wrong_document_rejected() {
        let mut m = manager();
        let mut c = remote("c1", None, 1);
        c.document_id = "elsewhere".into();
        assert!(matches!(
            m.apply_remote(c),
            Err(CommentError::WrongDocument { .. })
        ));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut m = manager();
        m.apply_remote(remote("c1", None, 1)).unwrap();
        m.apply_remote(remote("r", Some("x"), 1)).unwrap();
        m.reset(Some("doc-2".into()));
        assert!(m.is_empty());
        assert_eq!(m.pending_reply_count(), 0);
    }
}
