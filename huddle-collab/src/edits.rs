//! Edit propagation and conflict routing.
//!
//! ```text
//! local change ──► record_local ──► pending (applied=false) ──► broadcast
//!                                        │
//!                 server echo / window elapsed ──► substrate.apply ──► applied
//!
//! remote edit ──► overlaps an edit of another author within the
//!                 conflict window (pending, conflicted or revertible)?
//!                   ├─ yes ──► revert applied candidates,
//!                   │          ConflictResolver::detect (nothing applied)
//!                   └─ no  ──► substrate.apply (inverse kept for revert)
//!                                 └─ rejected ──► conflict=true, single-edit conflict
//! ```
//!
//! Every participant, author or observer, holds a conflict's edits out of
//! the document until the resolution arrives.
//!
//! The log is append-only; only `applied` / `conflict` flags change.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::conflict::{ConflictResolution, ConflictResolver, ResolutionOutcome};
use crate::error::{CollabError, SubstrateError};
use crate::protocol::{new_id, unix_millis};

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
    Format,
    Annotation,
}

/// Where an edit lands. Offsets are in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPosition {
    pub start: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

impl EditPosition {
    /// Zero-width position (insertion point).
    pub fn at(start: usize) -> Self {
        Self {
            start,
            end: None,
            page: None,
            element_id: None,
        }
    }

    pub fn span(start: usize, end: usize) -> Self {
        Self {
            start,
            end: Some(end),
            page: None,
            element_id: None,
        }
    }

    /// `(start, end)` with `end` defaulting to `start`.
    pub fn range(&self) -> (usize, usize) {
        (self.start, self.end.unwrap_or(self.start))
    }

    /// Closed-interval overlap on the same page and element.
    pub fn overlaps(&self, other: &EditPosition) -> bool {
        if let (Some(a), Some(b)) = (self.page, other.page) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&self.element_id, &other.element_id) {
            if a != b {
                return false;
            }
        }
        let (s1, e1) = self.range();
        let (s2, e2) = other.range();
        s1 <= e2 && s2 <= e1
    }
}

/// `document_edit` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEdit {
    pub id: String,
    pub document_id: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(rename = "edit_type")]
    pub kind: EditKind,
    pub position: EditPosition,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_content: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: u64,
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub conflict: bool,
}

impl DocumentEdit {
    /// Whether the two edits fall within `window` of each other.
    pub fn within(&self, other: &DocumentEdit, window: Duration) -> bool {
        self.timestamp.abs_diff(other.timestamp) <= window.as_millis() as u64
    }
}

// ───────────────────────────────────────────────────────────────────
// Document substrate
// ───────────────────────────────────────────────────────────────────

/// The document model edits are applied to.
pub trait DocumentSubstrate {
    fn apply(&mut self, edit: &DocumentEdit) -> Result<(), SubstrateError>;

    /// Text currently covered by `position`. Substrates returning `None`
    /// cannot have applied edits reverted when they turn out to conflict.
    fn text_at(&self, _position: &EditPosition) -> Option<String> {
        None
    }
}

/// Edit undoing `edit`, given the text it is about to overwrite.
fn inverse(edit: &DocumentEdit, removed: String) -> Option<DocumentEdit> {
    let start = edit.position.start;
    let written = edit.content.chars().count();
    let (kind, position, content) = match edit.kind {
        EditKind::Insert => (EditKind::Delete, EditPosition::span(start, start + written), String::new()),
        EditKind::Delete => (EditKind::Insert, EditPosition::at(start), removed),
        EditKind::Replace => (EditKind::Replace, EditPosition::span(start, start + written), removed),
        EditKind::Format | EditKind::Annotation => return None,
    };
    Some(DocumentEdit {
        id: format!("{}:undo", edit.id),
        kind,
        position: EditPosition {
            page: edit.position.page,
            element_id: edit.position.element_id.clone(),
            ..position
        },
        content,
        previous_content: None,
        metadata: serde_json::Value::Null,
        ..edit.clone()
    })
}

/// Char-indexed plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainTextDocument {
    chars: Vec<char>,
}

impl PlainTextDocument {
    pub fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
        }
    }

    pub fn text(&self) -> String {
        self.chars.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    fn checked_range(&self, position: &EditPosition) -> Result<(usize, usize), SubstrateError> {
        let (start, end) = position.range();
        if start > end {
            return Err(SubstrateError::InvalidRange { start, end });
        }
        if end > self.chars.len() {
            return Err(SubstrateError::OutOfRange {
                position: end,
                len: self.chars.len(),
            });
        }
        Ok((start, end))
    }
}

impl DocumentSubstrate for PlainTextDocument {
    fn text_at(&self, position: &EditPosition) -> Option<String> {
        let (start, end) = self.checked_range(position).ok()?;
        Some(self.chars[start..end].iter().collect())
    }

    fn apply(&mut self, edit: &DocumentEdit) -> Result<(), SubstrateError> {
        let (start, end) = self.checked_range(&edit.position)?;
        match edit.kind {
            EditKind::Insert => {
                self.chars.splice(start..start, edit.content.chars());
            }
            EditKind::Delete => {
                self.chars.drain(start..end);
            }
            EditKind::Replace => {
                self.chars.splice(start..end, edit.content.chars());
            }
            // no formatting layer in plain text
            EditKind::Format | EditKind::Annotation => {}
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Coordinator
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditStatus {
    /// Local, waiting for acknowledgment.
    Pending,
    Conflicted,
    Applied,
    Discarded,
}

/// What happened to an edit.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    /// Other document, or no document joined.
    Ignored,
    /// Already known.
    Duplicate,
    /// A local edit was acknowledged and applied.
    Acknowledged(String),
    Applied(String),
    Conflicted {
        conflict: ConflictResolution,
        is_new: bool,
    },
}

/// Owns the edit log of the joined document.
pub struct EditCoordinator {
    author_id: String,
    author_name: String,
    document_id: Option<String>,
    conflict_window: Duration,
    log: Vec<DocumentEdit>,
    index: HashMap<String, usize>,
    status: HashMap<String, EditStatus>,
    /// Inverse of each applied edit of another author.
    undo: HashMap<String, DocumentEdit>,
    /// Local edits awaiting acknowledgment, oldest first.
    pending: VecDeque<(String, Instant)>,
}

impl EditCoordinator {
    pub fn new(author_id: impl Into<String>, author_name: impl Into<String>, conflict_window: Duration) -> Self {
        Self {
            author_id: author_id.into(),
            author_name: author_name.into(),
            document_id: None,
            conflict_window,
            log: Vec::new(),
            index: HashMap::new(),
            status: HashMap::new(),
            undo: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Switch documents, dropping the log and pending acknowledgments.
    pub fn reset(&mut self, document_id: Option<String>) {
        self.document_id = document_id;
        self.log.clear();
        self.index.clear();
        self.status.clear();
        self.undo.clear();
        self.pending.clear();
    }

    /// Wrap a local change. The caller broadcasts the returned edit.
    pub fn record_local(
        &mut self,
        kind: EditKind,
        position: EditPosition,
        content: impl Into<String>,
        previous_content: Option<String>,
        metadata: serde_json::Value,
        now: Instant,
    ) -> Result<DocumentEdit, CollabError> {
        let document_id = self.document_id.clone().ok_or(CollabError::NotJoined)?;
        let edit = DocumentEdit {
            id: new_id(),
            document_id,
            author_id: self.author_id.clone(),
            author_name: self.author_name.clone(),
            kind,
            position,
            content: content.into(),
            previous_content,
            metadata,
            timestamp: unix_millis(),
            applied: false,
            conflict: false,
        };
        log::debug!("Local {:?} edit {}", edit.kind, edit.id);
        self.pending.push_back((edit.id.clone(), now));
        self.push(edit.clone(), EditStatus::Pending);
        Ok(edit)
    }

    /// Integrate an edit broadcast by another participant (or our echo).
    pub fn apply_remote<S: DocumentSubstrate + ?Sized>(
        &mut self,
        edit: DocumentEdit,
        substrate: &mut S,
        resolver: &mut ConflictResolver,
    ) -> EditOutcome {
        if self.document_id.as_deref() != Some(edit.document_id.as_str()) {
            log::debug!("Edit {} for document {} ignored", edit.id, edit.document_id);
            return EditOutcome::Ignored;
        }
        if self.index.contains_key(&edit.id) {
            if edit.author_id == self.author_id {
                return self
                    .acknowledge(&edit.id, substrate, resolver)
                    .unwrap_or(EditOutcome::Duplicate);
            }
            return EditOutcome::Duplicate;
        }

        let candidates: Vec<DocumentEdit> = self
            .log
            .iter()
            .filter(|e| {
                e.author_id != edit.author_id
                    && match self.status.get(&e.id) {
                        Some(EditStatus::Pending | EditStatus::Conflicted) => true,
                        Some(EditStatus::Applied) => self.undo.contains_key(&e.id),
                        _ => false,
                    }
                    && e.position.overlaps(&edit.position)
                    && e.within(&edit, self.conflict_window)
            })
            .cloned()
            .collect();

        if !candidates.is_empty() {
            return self.conflict(candidates, edit, substrate, resolver);
        }

        let id = edit.id.clone();
        let undo = substrate
            .text_at(&edit.position)
            .and_then(|removed| inverse(&edit, removed));
        match substrate.apply(&edit) {
            Ok(()) => {
                if let Some(undo) = undo {
                    self.undo.insert(id.clone(), undo);
                }
                let mut edit = edit;
                edit.applied = true;
                self.push(edit, EditStatus::Applied);
                EditOutcome::Applied(id)
            }
            Err(e) => {
                log::warn!("Edit {id} rejected by document: {e}");
                self.conflict(Vec::new(), edit, substrate, resolver)
            }
        }
    }

    fn conflict<S: DocumentSubstrate + ?Sized>(
        &mut self,
        candidates: Vec<DocumentEdit>,
        mut incoming: DocumentEdit,
        substrate: &mut S,
        resolver: &mut ConflictResolver,
    ) -> EditOutcome {
        let document_id = incoming.document_id.clone();
        incoming.conflict = true;
        incoming.applied = false;
        self.push(incoming.clone(), EditStatus::Conflicted);

        self.revert(candidates.iter().map(|c| c.id.as_str()), substrate);
        let mut flagged = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            self.mark(&candidate.id, EditStatus::Conflicted);
            if let Some(edit) = self.get(&candidate.id) {
                flagged.push(edit.clone());
            }
        }

        let (conflict, is_new) = resolver.detect(&document_id, flagged, incoming);
        EditOutcome::Conflicted { conflict, is_new }
    }

    /// Apply a pending local edit. `None` if it is not pending.
    pub fn acknowledge<S: DocumentSubstrate + ?Sized>(
        &mut self,
        id: &str,
        substrate: &mut S,
        resolver: &mut ConflictResolver,
    ) -> Option<EditOutcome> {
        if self.status.get(id) != Some(&EditStatus::Pending) {
            return None;
        }
        self.pending.retain(|(pending, _)| pending != id);
        let edit = self.get(id)?.clone();
        match substrate.apply(&edit) {
            Ok(()) => {
                self.mark(id, EditStatus::Applied);
                Some(EditOutcome::Acknowledged(id.to_string()))
            }
            Err(e) => {
                log::warn!("Local edit {id} rejected by document: {e}");
                self.mark(id, EditStatus::Conflicted);
                let Some(flagged) = self.get(id).cloned() else {
                    return None;
                };
                let document_id = flagged.document_id.clone();
                let (conflict, is_new) = resolver.detect(&document_id, Vec::new(), flagged);
                Some(EditOutcome::Conflicted { conflict, is_new })
            }
        }
    }

    /// Acknowledge local edits whose conflict window passed quietly.
    pub fn tick<S: DocumentSubstrate + ?Sized>(
        &mut self,
        now: Instant,
        substrate: &mut S,
        resolver: &mut ConflictResolver,
    ) -> Vec<EditOutcome> {
        let due: Vec<String> = self
            .pending
            .iter()
            .take_while(|(_, at)| now.saturating_duration_since(*at) >= self.conflict_window)
            .map(|(id, _)| id.clone())
            .collect();
        due.iter()
            .filter_map(|id| self.acknowledge(id, substrate, resolver))
            .collect()
    }

    /// Settle the edits of a resolved conflict and apply the final content.
    ///
    /// The resolution edit is only applied when this log still holds at
    /// least one of the conflicting edits unapplied.
    pub fn finalize<S: DocumentSubstrate + ?Sized>(
        &mut self,
        outcome: &ResolutionOutcome,
        substrate: &mut S,
    ) -> Result<(), SubstrateError> {
        let held = outcome
            .record
            .edit_ids()
            .any(|id| self.status.get(id) == Some(&EditStatus::Conflicted));

        for id in &outcome.applied {
            self.pending.retain(|(pending, _)| pending != id);
            self.mark(id, EditStatus::Applied);
        }
        for id in &outcome.discarded {
            self.pending.retain(|(pending, _)| pending != id);
            self.mark(id, EditStatus::Discarded);
        }

        let Some(apply) = &outcome.apply else {
            return Ok(());
        };
        if !held {
            log::debug!(
                "Conflict {} had nothing outstanding here",
                outcome.record.id
            );
            return Ok(());
        }
        substrate.apply(apply)?;
        if !self.index.contains_key(&apply.id) {
            let mut edit = apply.clone();
            edit.applied = true;
            self.push(edit, EditStatus::Applied);
        }
        Ok(())
    }

    /// Hold edits another participant put in a conflict: pending ones stop
    /// waiting for acknowledgment, applied ones are taken back out.
    pub fn hold<'a, S: DocumentSubstrate + ?Sized>(
        &mut self,
        ids: impl IntoIterator<Item = &'a str>,
        substrate: &mut S,
    ) -> usize {
        let ids: Vec<&str> = ids.into_iter().collect();
        self.revert(ids.iter().copied(), substrate);
        let mut held = 0;
        for id in ids {
            if self.status.get(id) == Some(&EditStatus::Pending) {
                self.pending.retain(|(pending, _)| pending != id);
                self.mark(id, EditStatus::Conflicted);
                held += 1;
            }
        }
        held
    }

    /// Undo applied edits among `ids`, newest first, and mark them conflicted.
    fn revert<'a, S: DocumentSubstrate + ?Sized>(&mut self, ids: impl IntoIterator<Item = &'a str>, substrate: &mut S) {
        let mut slots: Vec<usize> = ids
            .into_iter()
            .filter(|id| self.status.get(*id) == Some(&EditStatus::Applied) && self.undo.contains_key(*id))
            .filter_map(|id| self.index.get(id).copied())
            .collect();
        slots.sort_unstable_by(|a, b| b.cmp(a));
        slots.dedup();

        for slot in slots {
            let id = self.log[slot].id.clone();
            let Some(undo) = self.undo.remove(&id) else {
                continue;
            };
            match substrate.apply(&undo) {
                Ok(()) => {
                    log::debug!("Reverted edit {id} pending conflict resolution");
                    self.mark(&id, EditStatus::Conflicted);
                }
                Err(e) => log::warn!("Edit {id} could not be reverted: {e}"),
            }
        }
    }

    fn push(&mut self, edit: DocumentEdit, status: EditStatus) {
        self.index.insert(edit.id.clone(), self.log.len());
        self.status.insert(edit.id.clone(), status);
        self.log.push(edit);
    }

    fn mark(&mut self, id: &str, status: EditStatus) {
        let Some(&slot) = self.index.get(id) else {
            return;
        };
        self.status.insert(id.to_string(), status);
        let edit = &mut self.log[slot];
        match status {
            EditStatus::Pending => {}
            EditStatus::Conflicted => {
                edit.conflict = true;
                edit.applied = false;
            }
            EditStatus::Applied => edit.applied = true,
            EditStatus::Discarded => edit.applied = false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&DocumentEdit> {
        self.index.get(id).map(|&slot| &self.log[slot])
    }

    /// Every edit seen, in arrival order.
    pub fn log(&self) -> &[DocumentEdit] {
        &self.log
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_discarded(&self, id: &str) -> bool {
        self.status.get(id) == Some(&EditStatus::Discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::Resolution;

    const WINDOW: Duration = Duration::from_secs(5);

    fn coordinator() -> EditCoordinator {
        let mut c = EditCoordinator::new("alice", "Alice", WINDOW);
        c.reset(Some("doc".into()));
        c
    }

    fn remote(id: &str, author: &str, kind: EditKind, start: usize, end: usize, content: &str, timestamp: u64) -> DocumentEdit {
        DocumentEdit {
            id: id.into(),
            document_id: "doc".into(),
            author_id: author.into(),
            author_name: author.into(),
            kind,
            position: EditPosition::span(start, end),
            content: content.into(),
            previous_content: None,
            metadata: serde_json::Value::Null,
            timestamp,
            applied: false,
            conflict: false,
        }
    }

    fn local(c: &mut EditCoordinator, start: usize, end: usize, content: &str, now: Instant) -> DocumentEdit {
        c.record_local(
            EditKind::Replace,
            EditPosition::span(start, end),
            content,
            None,
            serde_json::json!({}),
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_plain_text_operations() {
        let mut doc = PlainTextDocument::new("héllo");
        doc.apply(&remote("1", "b", EditKind::Insert, 5, 5, " world", 0)).unwrap();
        assert_eq!(doc.text(), "héllo world");
        doc.apply(&remote("2", "b", EditKind::Replace, 0, 5, "Hi", 0)).unwrap();
        assert_eq!(doc.text(), "Hi world");
        doc.apply(&remote("3", "b", EditKind::Delete, 2, 8, "", 0)).unwrap();
        assert_eq!(doc.text(), "Hi");
        doc.apply(&remote("4", "b", EditKind::Format, 0, 2, "bold", 0)).unwrap();
        assert_eq!(doc.text(), "Hi");
    }

    #[test]
    fn test_plain_text_rejects_bad_ranges() {
        let mut doc = PlainTextDocument::new("abc");
        assert_eq!(
            doc.apply(&remote("1", "b", EditKind::Insert, 4, 4, "x", 0)),
            Err(SubstrateError::OutOfRange { position: 4, len: 3 })
        );
        assert_eq!(
            doc.apply(&remote("2", "b", EditKind::Delete, 2, 1, "", 0)),
            Err(SubstrateError::InvalidRange { start: 2, end: 1 })
        );
    }

    #[test]
    fn test_overlap_rules() {
        assert!(EditPosition::span(0, 10).overlaps(&EditPosition::span(5, 15)));
        assert!(EditPosition::span(0, 10).overlaps(&EditPosition::at(10)));
        assert!(!EditPosition::span(0, 4).overlaps(&EditPosition::span(5, 9)));
        let mut a = EditPosition::span(0, 10);
        let mut b = EditPosition::span(0, 10);
        a.page = Some(1);
        b.page = Some(2);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_record_local_requires_document() {
        let mut c = EditCoordinator::new("alice", "Alice", WINDOW);
        let err = c
            .record_local(EditKind::Insert, EditPosition::at(0), "x", None, serde_json::Value::Null, Instant::now())
            .unwrap_err();
        assert_eq!(err, CollabError::NotJoined);
    }

    #[test]
    fn test_non_overlapping_remote_applied() {
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("0123456789abcdef");
        let mut r = ConflictResolver::new(10);
        local(&mut c, 0, 2, "xx", Instant::now());

        let outcome = c.apply_remote(remote("r1", "bob", EditKind::Replace, 10, 12, "ZZ", unix_millis()), &mut doc, &mut r);
        assert_eq!(outcome, EditOutcome::Applied("r1".into()));
        assert!(c.get("r1").unwrap().applied);
        assert_eq!(doc.text(), "0123456789ZZcdef");
    }

    #[test]
    fn test_overlap_outside_window_is_sequenced() {
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("0123456789abcdef");
        let mut r = ConflictResolver::new(10);
        let mine = local(&mut c, 0, 10, "Hello", Instant::now());

        let late = remote("r1", "bob", EditKind::Replace, 5, 15, "World", mine.timestamp + 6_000);
        assert_eq!(c.apply_remote(late, &mut doc, &mut r), EditOutcome::Applied("r1".into()));
        assert_eq!(r.active_count(), 0);
    }

    #[test]
    fn test_overlapping_edits_conflict_and_choose_version() {
        let now = Instant::now();
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("0123456789abcdefghij");
        let mut r = ConflictResolver::new(10);

        let a = local(&mut c, 0, 10, "Hello", now);
        let b = remote("B", "bob", EditKind::Replace, 5, 15, "World", a.timestamp + 1);
        let outcome = c.apply_remote(b, &mut doc, &mut r);

        let conflict = match outcome {
            EditOutcome::Conflicted { conflict, is_new: true } => conflict,
            other => panic!("expected new conflict, got {other:?}"),
        };
        let ids: Vec<_> = conflict.edit_ids().collect();
        assert_eq!(ids, vec![a.id.as_str(), "B"]);
        assert!(!c.get(&a.id).unwrap().applied);
        assert!(!c.get("B").unwrap().applied);
        assert!(c.get("B").unwrap().conflict);
        assert_eq!(doc.text(), "0123456789abcdefghij");

        // the window elapsing does not sneak the local edit in
        assert!(c.tick(now + WINDOW, &mut doc, &mut r).is_empty());

        let resolution = r.resolve(&conflict.id, Resolution::ChooseVersion, "alice").unwrap();
        c.finalize(&resolution, &mut doc).unwrap();
        assert!(c.get("B").unwrap().applied);
        assert!(!c.get(&a.id).unwrap().applied);
        assert!(c.is_discarded(&a.id));
        assert_eq!(c.pending_count(), 0);
        assert_eq!(doc.text(), "01234Worldfghij");
    }

    #[test]
    fn test_merge_applies_concatenation() {
        let now = Instant::now();
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("0123456789abcdefghij");
        let mut r = ConflictResolver::new(10);

        let a = local(&mut c, 0, 10, "Hello", now);
        let b = remote("B", "bob", EditKind::Replace, 5, 15, "World", a.timestamp + 1);
        let EditOutcome::Conflicted { conflict, .. } = c.apply_remote(b, &mut doc, &mut r) else {
            panic!("expected conflict");
        };
        let resolution = r.resolve(&conflict.id, Resolution::Merge, "alice").unwrap();
        c.finalize(&resolution, &mut doc).unwrap();
        assert_eq!(doc.text(), "HelloWorldfghij");
        assert!(c.get(&a.id).unwrap().applied);
        assert!(c.get("B").unwrap().applied);
        assert_eq!(c.log().len(), 3);
    }

    #[test]
    fn test_third_author_joins_existing_conflict() {
        let now = Instant::now();
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("0123456789abcdefghij");
        let mut r = ConflictResolver::new(10);

        let a = local(&mut c, 0, 10, "Hello", now);
        c.apply_remote(remote("B", "bob", EditKind::Replace, 5, 15, "World", a.timestamp), &mut doc, &mut r);
        let outcome = c.apply_remote(
            remote("C", "carol", EditKind::Replace, 12, 14, "!", a.timestamp + 2),
            &mut doc,
            &mut r,
        );
        match outcome {
            EditOutcome::Conflicted { conflict, is_new } => {
                assert!(!is_new);
                assert_eq!(conflict.edits.len(), 3);
            }
            other => panic!("expected joined conflict, got {other:?}"),
        }
        assert_eq!(r.active_count(), 1);
    }

    #[test]
    fn test_echo_acknowledges_local_edit() {
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("abc");
        let mut r = ConflictResolver::new(10);
        let mine = c
            .record_local(EditKind::Insert, EditPosition::at(3), "d", None, serde_json::Value::Null, Instant::now())
            .unwrap();
        assert_eq!(c.pending_count(), 1);

        let outcome = c.apply_remote(mine.clone(), &mut doc, &mut r);
        assert_eq!(outcome, EditOutcome::Acknowledged(mine.id.clone()));
        assert_eq!(doc.text(), "abcd");
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.apply_remote(mine, &mut doc, &mut r), EditOutcome::Duplicate);
    }

    #[test]
    fn test_tick_acknowledges_after_window() {
        let now = Instant::now();
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("abc");
        let mut r = ConflictResolver::new(10);
        let mine = c
            .record_local(EditKind::Delete, EditPosition::span(0, 1), "", Some("a".into()), serde_json::Value::Null, now)
            .unwrap();

        assert!(c.tick(now + Duration::from_secs(4), &mut doc, &mut r).is_empty());
        let acked = c.tick(now + WINDOW, &mut doc, &mut r);
        assert_eq!(acked, vec![EditOutcome::Acknowledged(mine.id.clone())]);
        assert_eq!(doc.text(), "bc");
        assert!(c.get(&mine.id).unwrap().applied);
    }

    #[test]
    fn test_rejected_remote_becomes_conflict() {
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("abc");
        let mut r = ConflictResolver::new(10);
        let outcome = c.apply_remote(remote("R", "bob", EditKind::Replace, 10, 12, "x", 1), &mut doc, &mut r);
        match outcome {
            EditOutcome::Conflicted { conflict, is_new } => {
                assert!(is_new);
                assert_eq!(conflict.edits.len(), 1);
                assert!(conflict.edits[0].conflict);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(c.get("R").unwrap().conflict);
        assert!(!c.get("R").unwrap().applied);
    }

    #[test]
    fn test_hold_stops_acknowledgment() {
        let now = Instant::now();
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("abc");
        let mut r = ConflictResolver::new(10);
        let mine = local(&mut c, 0, 1, "z", now);
        assert_eq!(c.hold([mine.id.as_str(), "unknown"], &mut doc), 1);
        assert_eq!(c.pending_count(), 0);
        assert!(c.tick(now + WINDOW, &mut doc, &mut r).is_empty());
        assert_eq!(doc.text(), "abc");
        assert!(c.get(&mine.id).unwrap().conflict);
    }

    #[test]
    fn test_observer_takes_back_applied_edit_on_overlap() {
        let mut c = EditCoordinator::new("carol", "Carol", WINDOW);
        c.reset(Some("doc".into()));
        let mut doc = PlainTextDocument::new("0123456789abcdefghij");
        let mut r = ConflictResolver::new(10);

        let a = remote("A", "alice", EditKind::Replace, 0, 10, "Hello", 1_000);
        assert_eq!(c.apply_remote(a, &mut doc, &mut r), EditOutcome::Applied("A".into()));
        assert_eq!(doc.text(), "Helloabcdefghij");

        let b = remote("B", "bob", EditKind::Replace, 5, 15, "World", 1_000);
        let EditOutcome::Conflicted { conflict, is_new: true } = c.apply_remote(b, &mut doc, &mut r) else {
            panic!("expected new conflict");
        };
        assert_eq!(conflict.edit_ids().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(doc.text(), "0123456789abcdefghij");
        assert!(!c.get("A").unwrap().applied);

        let resolution = r.resolve(&conflict.id, Resolution::Merge, "alice").unwrap();
        c.finalize(&resolution, &mut doc).unwrap();
        assert_eq!(doc.text(), "HelloWorldfghij");
    }

    #[test]
    fn test_hold_takes_back_applied_edits_newest_first() {
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("abcdef");
        let mut r = ConflictResolver::new(10);
        c.apply_remote(remote("I", "bob", EditKind::Insert, 1, 1, "XY", 1), &mut doc, &mut r);
        c.apply_remote(remote("D", "bob", EditKind::Delete, 4, 6, "", 2), &mut doc, &mut r);
        assert_eq!(doc.text(), "aXYbef");

        assert_eq!(c.hold(["I", "D"], &mut doc), 0);
        assert_eq!(doc.text(), "abcdef");
        assert!(c.get("I").unwrap().conflict);
        assert!(c.get("D").unwrap().conflict);
    }

    #[test]
    fn test_sequenced_edit_is_not_revertible_twice() {
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("abc");
        let mut r = ConflictResolver::new(10);
        c.apply_remote(remote("R", "bob", EditKind::Replace, 0, 1, "z", 1), &mut doc, &mut r);
        c.hold(["R"], &mut doc);
        c.hold(["R"], &mut doc);
        assert_eq!(doc.text(), "abc");
    }

    #[test]
    fn test_other_document_ignored() {
        let mut c = coordinator();
        let mut doc = PlainTextDocument::new("abc");
        let mut r = ConflictResolver::new(10);
        let mut e = remote("R", "bob", EditKind::Insert, 0, 0, "x", 1);
        e.document_id = "other".into();
        assert_eq!(c.apply_remote(e, &mut doc, &mut r), EditOutcome::Ignored);
        assert!(c.log().is_empty());
    }

    #[test]
    fn test_edit_wire_shape() {
        let e = remote("R", "bob", EditKind::Annotation, 1, 2, "note", 7);
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["edit_type"], "annotation");
        assert_eq!(value["position"]["end"], 2);
        assert!(value["position"].get("page").is_none());
    }
}
