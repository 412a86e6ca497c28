//! Conflict detection records and user-driven resolution.
//!
//! A conflict groups overlapping edits from different authors that landed
//! within the conflict window. None of its edits touch the document until a
//! user picks a strategy:
//!
//! | Strategy | Final content | Applied | Discarded |
//! |----------|---------------|---------|-----------|
//! | `merge` | contents concatenated in arrival order | all | none |
//! | `choose_version` | latest-timestamp edit, named in `winner_id` | winner | the rest |
//! | `manual_resolve` | caller-supplied text | none | all |
//!
//! Merge is a shallow concatenation over the union range, not a three-way
//! text merge.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::edits::{DocumentEdit, EditKind, EditPosition};
use crate::error::ConflictError;
use crate::protocol::{new_id, unix_millis};

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Merge,
    ChooseVersion,
    ManualResolve,
}

/// A resolution request from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Merge,
    ChooseVersion,
    Manual(String),
}

impl Resolution {
    pub fn strategy(&self) -> ResolutionStrategy {
        match self {
            Resolution::Merge => ResolutionStrategy::Merge,
            Resolution::ChooseVersion => ResolutionStrategy::ChooseVersion,
            Resolution::Manual(_) => ResolutionStrategy::ManualResolve,
        }
    }
}

/// UI ordering hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn for_edit_count(count: usize) -> Self {
        match count {
            n if n >= 5 => Severity::High,
            n if n >= 3 => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

/// `conflict_detected` / `conflict_resolved` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub id: String,
    pub document_id: String,
    /// Conflicting edits in arrival order.
    pub edits: Vec<DocumentEdit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    /// Edit kept by `choose_version`, as picked by the resolving peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<String>,
    pub detected_at: u64,
}

impl ConflictResolution {
    pub fn severity(&self) -> Severity {
        Severity::for_edit_count(self.edits.len())
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn edit_ids(&self) -> impl Iterator<Item = &str> {
        self.edits.iter().map(|e| e.id.as_str())
    }

    pub fn contains_edit(&self, edit_id: &str) -> bool {
        self.edits.iter().any(|e| e.id == edit_id)
    }

    /// Smallest range covering every edit.
    pub fn union_range(&self) -> Option<(usize, usize)> {
        self.edits.iter().map(|e| e.position.range()).reduce(|(s1, e1), (s2, e2)| {
            (s1.min(s2), e1.max(e2))
        })
    }

    /// Latest timestamp; ties go to the later arrival.
    pub fn latest_edit(&self) -> Option<&DocumentEdit> {
        self.edits
            .iter()
            .fold(None, |best: Option<&DocumentEdit>, e| match best {
                Some(b) if b.timestamp > e.timestamp => Some(b),
                _ => Some(e),
            })
    }
}

/// What to do with the edits of a settled conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub record: ConflictResolution,
    pub applied: Vec<String>,
    pub discarded: Vec<String>,
    /// Edit that brings the document to the final content.
    pub apply: Option<DocumentEdit>,
}

impl ResolutionOutcome {
    /// Derive the outcome from a resolved record.
    pub fn from_record(record: ConflictResolution) -> Result<Self, ConflictError> {
        let (Some(strategy), Some(final_content)) = (record.strategy, record.final_content.clone()) else {
            return Err(ConflictError::NotActive(record.id.clone()));
        };
        let all: Vec<String> = record.edit_ids().map(String::from).collect();

        let (applied, discarded, apply) = match strategy {
            ResolutionStrategy::Merge => {
                let edit = synthetic_edit(&record, final_content)?;
                (all, Vec::new(), Some(edit))
            }
            ResolutionStrategy::ChooseVersion => {
                let winner = match &record.winner_id {
                    Some(id) => record.edits.iter().find(|e| e.id == *id),
                    None => record.latest_edit(),
                }
                .cloned()
                .ok_or_else(|| ConflictError::Empty(record.id.clone()))?;
                let discarded = all.into_iter().filter(|id| *id != winner.id).collect();
                (vec![winner.id.clone()], discarded, Some(winner))
            }
            ResolutionStrategy::ManualResolve => {
                let edit = synthetic_edit(&record, final_content)?;
                (Vec::new(), all, Some(edit))
            }
        };

        Ok(Self {
            record,
            applied,
            discarded,
            apply,
        })
    }
}

/// Replace the union range with `content`.
fn synthetic_edit(record: &ConflictResolution, content: String) -> Result<DocumentEdit, ConflictError> {
    let (start, end) = record
        .union_range()
        .ok_or_else(|| ConflictError::Empty(record.id.clone()))?;
    let first = &record.edits[0];
    let author = record.resolved_by.clone().unwrap_or_default();
    Ok(DocumentEdit {
        id: new_id(),
        document_id: record.document_id.clone(),
        author_id: author.clone(),
        author_name: author,
        kind: EditKind::Replace,
        position: EditPosition {
            start,
            end: Some(end),
            page: first.position.page,
            element_id: first.position.element_id.clone(),
        },
        content,
        previous_content: None,
        metadata: serde_json::json!({ "conflict_id": record.id }),
        timestamp: record.resolved_at.unwrap_or_else(unix_millis),
        applied: false,
        conflict: false,
    })
}

struct ActiveConflict {
    record: ConflictResolution,
    seq: u64,
}

/// Active conflicts plus a bounded history of settled ones.
pub struct ConflictResolver {
    active: HashMap<String, ActiveConflict>,
    /// edit id → conflict id
    by_edit: HashMap<String, String>,
    history: VecDeque<ConflictResolution>,
    history_limit: usize,
    next_seq: u64,
}

impl ConflictResolver {
    pub fn new(history_limit: usize) -> Self {
        Self {
            active: HashMap::new(),
            by_edit: HashMap::new(),
            history: VecDeque::new(),
            history_limit,
            next_seq: 0,
        }
    }

    /// Open a conflict over `edits` (arrival order).
    pub fn open(&mut self, document_id: impl Into<String>, edits: Vec<DocumentEdit>) -> ConflictResolution {
        let record = ConflictResolution {
            id: new_id(),
            document_id: document_id.into(),
            edits,
            strategy: None,
            resolved_by: None,
            resolved_at: None,
            final_content: None,
            winner_id: None,
            detected_at: unix_millis(),
        };
        log::info!(
            "Conflict {} opened over {} edit(s)",
            record.id,
            record.edits.len()
        );
        self.insert(record.clone());
        record
    }

    /// Add an edit to an active conflict.
    pub fn extend(&mut self, conflict_id: &str, edit: DocumentEdit) -> Result<ConflictResolution, ConflictError> {
        let active = self
            .active
            .get_mut(conflict_id)
            .ok_or_else(|| ConflictError::NotActive(conflict_id.to_string()))?;
        if !active.record.contains_edit(&edit.id) {
            self.by_edit.insert(edit.id.clone(), conflict_id.to_string());
            active.record.edits.push(edit);
            log::debug!(
                "Conflict {} grew to {} edit(s)",
                conflict_id,
                active.record.edits.len()
            );
        }
        Ok(active.record.clone())
    }

    /// Record that `incoming` collides with `candidates`.
    ///
    /// Joins the conflict one of the candidates already belongs to, otherwise
    /// opens a new one. Returns the record and whether it is new.
    pub fn detect(
        &mut self,
        document_id: &str,
        candidates: Vec<DocumentEdit>,
        incoming: DocumentEdit,
    ) -> (ConflictResolution, bool) {
        let mut edits = candidates;
        edits.push(incoming);
        let existing = edits
            .iter()
            .find_map(|e| self.by_edit.get(&e.id))
            .filter(|id| self.active.contains_key(id.as_str()))
            .cloned();
        if let Some(conflict_id) = existing {
            let mut record = None;
            for edit in edits.iter().cloned() {
                if let Ok(r) = self.extend(&conflict_id, edit) {
                    record = Some(r);
                }
            }
            if let Some(r) = record {
                return (r, false);
            }
        }
        (self.open(document_id, edits), true)
    }

    /// Settle an active conflict.
    pub fn resolve(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
        resolver: &str,
    ) -> Result<ResolutionOutcome, ConflictError> {
        let active = self
            .active
            .get(conflict_id)
            .ok_or_else(|| ConflictError::NotActive(conflict_id.to_string()))?;
        if active.record.edits.is_empty() {
            return Err(ConflictError::Empty(conflict_id.to_string()));
        }

        let mut winner_id = None;
        let final_content = match &resolution {
            Resolution::Merge => active
                .record
                .edits
                .iter()
                .map(|e| e.content.as_str())
                .collect::<String>(),
            Resolution::ChooseVersion => {
                let winner = active.record.latest_edit();
                winner_id = winner.map(|e| e.id.clone());
                winner.map(|e| e.content.clone()).unwrap_or_default()
            }
            Resolution::Manual(content) => content.clone(),
        };

        let mut record = self.remove(conflict_id).ok_or_else(|| ConflictError::NotActive(conflict_id.to_string()))?;
        record.strategy = Some(resolution.strategy());
        record.resolved_by = Some(resolver.to_string());
        record.resolved_at = Some(unix_millis());
        record.final_content = Some(final_content);
        record.winner_id = winner_id;
        log::info!(
            "Conflict {} resolved by {} ({:?})",
            record.id,
            resolver,
            resolution.strategy()
        );

        self.push_history(record.clone());
        ResolutionOutcome::from_record(record)
    }

    /// Mirror a conflict another participant detected.
    ///
    /// Merged into a local conflict sharing any edit, otherwise tracked as is.
    /// The flag is set when the conflict is new here or gained edits.
    pub fn apply_remote_detected(&mut self, record: ConflictResolution) -> (ConflictResolution, bool) {
        if let Some(local_id) = self.matching(&record) {
            let before = self.get(&local_id).map_or(0, |c| c.edits.len());
            let mut merged = None;
            for edit in record.edits.iter().cloned() {
                if let Ok(r) = self.extend(&local_id, edit) {
                    merged = Some(r);
                }
            }
            if let Some(merged) = merged {
                let grew = merged.edits.len() > before;
                return (merged, grew);
            }
        }
        log::info!("Tracking conflict {} detected remotely", record.id);
        self.insert(record.clone());
        (record, true)
    }

    /// Mirror a resolution made elsewhere.
    ///
    /// Returns the outcome when we held the conflict; otherwise the record is
    /// only kept in history. The resolver's `winner_id` and final content are
    /// taken as is, never recomputed from local arrival order.
    pub fn apply_remote_resolved(&mut self, record: ConflictResolution) -> Option<ResolutionOutcome> {
        if !record.is_resolved() {
            log::warn!("Ignoring unresolved conflict {} in resolution message", record.id);
            return None;
        }
        let Some(local_id) = self.matching(&record) else {
            if !self.history.iter().any(|h| h.id == record.id) {
                self.push_history(record);
            }
            return None;
        };
        let mut local = self.remove(&local_id)?;

        // local arrival order first, then anything only the resolver saw
        for edit in record.edits.iter() {
            if !local.contains_edit(&edit.id) {
                local.edits.push(edit.clone());
            }
        }
        local.strategy = record.strategy;
        local.resolved_by = record.resolved_by.clone();
        local.resolved_at = record.resolved_at;
        local.final_content = record.final_content.clone();
        local.winner_id = record.winner_id.clone();
        log::info!(
            "Conflict {} resolved remotely by {}",
            local.id,
            local.resolved_by.as_deref().unwrap_or("unknown")
        );

        self.push_history(local.clone());
        match ResolutionOutcome::from_record(local) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::warn!("Remote resolution unusable: {e}");
                None
            }
        }
    }

    fn matching(&self, record: &ConflictResolution) -> Option<String> {
        if self.active.contains_key(&record.id) {
            return Some(record.id.clone());
        }
        record
            .edit_ids()
            .find_map(|id| self.by_edit.get(id).cloned())
    }

    fn insert(&mut self, record: ConflictResolution) {
        for id in record.edit_ids() {
            self.by_edit.insert(id.to_string(), record.id.clone());
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.active
            .insert(record.id.clone(), ActiveConflict { record, seq });
    }

    fn remove(&mut self, conflict_id: &str) -> Option<ConflictResolution> {
        let active = self.active.remove(conflict_id)?;
        for id in active.record.edit_ids() {
            self.by_edit.remove(id);
        }
        Some(active.record)
    }

    fn push_history(&mut self, record: ConflictResolution) {
        self.history.push_back(record);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    /// Drop active conflicts (history survives).
    pub fn clear(&mut self) {
        self.active.clear();
        self.by_edit.clear();
    }

    pub fn conflict_for_edit(&self, edit_id: &str) -> Option<&str> {
        self.by_edit.get(edit_id).map(String::as_str)
    }

    pub fn get(&self, conflict_id: &str) -> Option<&ConflictResolution> {
        self.active.get(conflict_id).map(|a| &a.record)
    }

    /// Active conflicts, most severe first, then oldest first.
    pub fn active(&self) -> Vec<&ConflictResolution> {
        let mut active: Vec<&ActiveConflict> = self.active.values().collect();
        active.sort_by(|a, b| {
            b.record
                .severity()
                .cmp(&a.record.severity())
                .then(a.record.detected_at.cmp(&b.record.detected_at))
                .then(a.seq.cmp(&b.seq))
        });
        active.into_iter().map(|a| &a.record).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Settled conflicts, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ConflictResolution> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(id: &str, author: &str, start: usize, end: usize, content: &str, timestamp: u64) -> DocumentEdit {
        DocumentEdit {
            id: id.into(),
            document_id: "doc".into(),
            author_id: author.into(),
            author_name: author.into(),
            kind: EditKind::Replace,
            position: EditPosition::span(start, end),
            content: content.into(),
            previous_content: None,
            metadata: serde_json::Value::Null,
            timestamp,
            applied: false,
            conflict: true,
        }
    }

    fn scenario(resolver: &mut ConflictResolver) -> ConflictResolution {
        let a = edit("A", "alice", 0, 10, "Hello", 1_000);
        let b = edit("B", "bob", 5, 15, "World", 2_000);
        let (record, is_new) = resolver.detect("doc", vec![a], b);
        assert!(is_new);
        record
    }

    #[test]
    fn test_severity_thresholds() {
        assert_eq!(Severity::for_edit_count(2), Severity::Low);
        assert_eq!(Severity::for_edit_count(3), Severity::Medium);
        assert_eq!(Severity::for_edit_count(4), Severity::Medium);
        assert_eq!(Severity::for_edit_count(5), Severity::High);
    }

    #[test]
    fn test_detect_keeps_arrival_order() {
        let mut r = ConflictResolver::new(10);
        let record = scenario(&mut r);
        assert_eq!(record.edit_ids().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(record.union_range(), Some((0, 15)));
        assert_eq!(r.active_count(), 1);
        assert_eq!(r.conflict_for_edit("B"), Some(record.id.as_str()));
    }

    #[test]
    fn test_choose_version_keeps_latest() {
        let mut r = ConflictResolver::new(10);
        let record = scenario(&mut r);
        let outcome = r.resolve(&record.id, Resolution::ChooseVersion, "carol").unwrap();

        assert_eq!(outcome.applied, vec!["B".to_string()]);
        assert_eq!(outcome.discarded, vec!["A".to_string()]);
        assert_eq!(outcome.apply.as_ref().unwrap().id, "B");
        assert_eq!(outcome.record.final_content.as_deref(), Some("World"));
        assert_eq!(outcome.record.strategy, Some(ResolutionStrategy::ChooseVersion));
        assert_eq!(outcome.record.resolved_by.as_deref(), Some("carol"));
        assert_eq!(r.active_count(), 0);
        assert_eq!(r.history().count(), 1);
    }

    #[test]
    fn test_choose_version_tie_goes_to_later_arrival() {
        let mut r = ConflictResolver::new(10);
        let a = edit("A", "alice", 0, 4, "one", 5);
        let b = edit("B", "bob", 2, 6, "two", 5);
        let (record, _) = r.detect("doc", vec![a], b);
        let outcome = r.resolve(&record.id, Resolution::ChooseVersion, "alice").unwrap();
        assert_eq!(outcome.applied, vec!["B".to_string()]);
    }

    #[test]
    fn test_merge_concatenates_over_union_range() {
        let mut r = ConflictResolver::new(10);
        let record = scenario(&mut r);
        let outcome = r.resolve(&record.id, Resolution::Merge, "alice").unwrap();

        assert_eq!(outcome.record.final_content.as_deref(), Some("HelloWorld"));
        assert_eq!(outcome.applied.len(), 2);
        assert!(outcome.discarded.is_empty());
        let apply = outcome.apply.unwrap();
        assert_eq!(apply.kind, EditKind::Replace);
        assert_eq!(apply.position.range(), (0, 15));
        assert_eq!(apply.content, "HelloWorld");
    }

    #[test]
    fn test_manual_resolve_uses_content_verbatim() {
        let mut r = ConflictResolver::new(10);
        let record = scenario(&mut r);
        let outcome = r
            .resolve(&record.id, Resolution::Manual("  Hi there ".into()), "alice")
            .unwrap();
        assert_eq!(outcome.record.final_content.as_deref(), Some("  Hi there "));
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.discarded.len(), 2);
        assert_eq!(outcome.apply.unwrap().content, "  Hi there ");
    }

    #[test]
    fn test_resolve_unknown_or_twice() {
        let mut r = ConflictResolver::new(10);
        assert!(matches!(
            r.resolve("nope", Resolution::Merge, "a"),
            Err(ConflictError::NotActive(_))
        ));
        let record = scenario(&mut r);
        r.resolve(&record.id, Resolution::Merge, "a").unwrap();
        assert!(r.resolve(&record.id, Resolution::Merge, "a").is_err());
    }

    #[test]
    fn test_detect_joins_existing_conflict() {
        let mut r = ConflictResolver::new(10);
        let record = scenario(&mut r);
        let c = edit("C", "carol", 8, 9, "!", 2_500);
        let b = record.edits[1].clone();
        let (joined, is_new) = r.detect("doc", vec![b], c);
        assert!(!is_new);
        assert_eq!(joined.id, record.id);
        assert_eq!(joined.edits.len(), 3);
        assert_eq!(joined.severity(), Severity::Medium);
    }

    #[test]
    fn test_active_ordered_by_severity() {
        let mut r = ConflictResolver::new(10);
        let low = r.open("doc", vec![edit("1", "a", 0, 1, "", 1), edit("2", "b", 0, 1, "", 1)]);
        let high = r.open(
            "doc",
            (0..5)
                .map(|i| edit(&format!("h{i}"), &format!("u{i}"), 0, 1, "", 1))
                .collect(),
        );
        let ids: Vec<_> = r.active().iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    #[test]
    fn test_remote_detected_merges_with_local() {
        let mut r = ConflictResolver::new(10);
        let local = scenario(&mut r);
        let mut remote = local.clone();
        remote.id = "remote-conflict".into();
        remote.edits.reverse();
        let (merged, changed) = r.apply_remote_detected(remote);
        assert_eq!(merged.id, local.id);
        assert!(!changed);
        assert_eq!(r.active_count(), 1);
    }

    #[test]
    fn test_remote_detected_reports_growth() {
        let mut r = ConflictResolver::new(10);
        let local = scenario(&mut r);
        let mut remote = local.clone();
        remote.id = "remote-conflict".into();
        remote.edits.push(edit("C", "carol", 8, 9, "!", 2_500));

        let (merged, changed) = r.apply_remote_detected(remote);
        assert!(changed);
        assert_eq!(merged.id, local.id);
        assert_eq!(merged.edits.len(), 3);
        assert_eq!(r.conflict_for_edit("C"), Some(local.id.as_str()));
    }

    #[test]
    fn test_remote_detected_tracked_when_unknown() {
        let mut r = ConflictResolver::new(10);
        let (tracked, changed) = r.apply_remote_detected(edit_record());
        assert!(changed);
        assert_eq!(tracked.id, "c-remote");
        assert_eq!(r.conflict_for_edit("X"), Some("c-remote"));
        assert_eq!(r.active_count(), 1);
    }

    #[test]
    fn test_remote_resolved_settles_local_conflict() {
        let mut r = ConflictResolver::new(10);
        let local = scenario(&mut r);

        let mut remote = local.clone();
        remote.id = "theirs".into();
        remote.strategy = Some(ResolutionStrategy::ChooseVersion);
        remote.resolved_by = Some("bob".into());
        remote.resolved_at = Some(9_000);
        remote.final_content = Some("World".into());
        remote.winner_id = Some("B".into());

        let outcome = r.apply_remote_resolved(remote).unwrap();
        assert_eq!(outcome.record.id, local.id);
        assert_eq!(outcome.applied, vec!["B".to_string()]);
        assert_eq!(r.active_count(), 0);
    }

    #[test]
    fn test_remote_choose_version_follows_resolver_on_tie() {
        let a = edit("A", "alice", 0, 10, "Hello", 1_000);
        let b = edit("B", "bob", 5, 15, "World", 1_000);

        let mut alice = ConflictResolver::new(10);
        let (ours, _) = alice.detect("doc", vec![a.clone()], b.clone());
        let decided = alice.resolve(&ours.id, Resolution::ChooseVersion, "alice").unwrap();
        assert_eq!(decided.applied, vec!["B".to_string()]);
        assert_eq!(decided.record.winner_id.as_deref(), Some("B"));

        // bob saw the same edits in the opposite order
        let mut bob = ConflictResolver::new(10);
        let (theirs, _) = bob.detect("doc", vec![b], a);
        assert_eq!(theirs.edit_ids().collect::<Vec<_>>(), vec!["B", "A"]);

        let outcome = bob.apply_remote_resolved(decided.record).unwrap();
        assert_eq!(outcome.applied, vec!["B".to_string()]);
        assert_eq!(outcome.discarded, vec!["A".to_string()]);
        assert_eq!(outcome.apply.unwrap().id, "B");
    }

    #[test]
    fn test_winner_survives_the_wire() {
        let mut r = ConflictResolver::new(10);
        let record = scenario(&mut r);
        let outcome = r.resolve(&record.id, Resolution::ChooseVersion, "alice").unwrap();
        let json = serde_json::to_value(&outcome.record).unwrap();
        assert_eq!(json["winner_id"], "B");
        let back: ConflictResolution = serde_json::from_value(json).unwrap();
        assert_eq!(back.winner_id.as_deref(), Some("B"));
    }

    #[test]
    fn test_detect_never_opens_an_empty_conflict() {
        let mut r = ConflictResolver::new(10);
        // an index entry left pointing at a conflict that is gone
        r.by_edit.insert("A".into(), "gone".into());
        let a = edit("A", "alice", 0, 10, "Hello", 1_000);
        let b = edit("B", "bob", 5, 15, "World", 1_000);

        let (record, is_new) = r.detect("doc", vec![a], b);
        assert!(is_new);
        assert_eq!(record.edit_ids().collect::<Vec<_>>(), vec!["A", "B"]);
        assert!(r.resolve(&record.id, Resolution::Merge, "alice").is_ok());
    }

    #[test]
    fn test_detect_joins_conflict_of_incoming_edit() {
        let mut r = ConflictResolver::new(10);
        let tracked = edit_record();
        r.apply_remote_detected(tracked.clone());
        let (joined, is_new) = r.detect("doc", vec![edit("Y", "y", 0, 1, "y", 1)], tracked.edits[0].clone());
        assert!(!is_new);
        assert_eq!(joined.id, "c-remote");
        assert_eq!(joined.edits.len(), 2);
    }

    #[test]
    fn test_remote_resolved_unknown_goes_to_history() {
        let mut r = ConflictResolver::new(10);
        let mut record = edit_record();
        record.strategy = Some(ResolutionStrategy::Merge);
        record.resolved_at = Some(1);
        record.final_content = Some("x".into());
        assert!(r.apply_remote_resolved(record.clone()).is_none());
        assert!(r.apply_remote_resolved(record).is_none());
        assert_eq!(r.history().count(), 1);
    }

    #[test]
    fn test_history_bounded() {
        let mut r = ConflictResolver::new(2);
        for _ in 0..3 {
            let record = scenario(&mut r);
            r.resolve(&record.id, Resolution::Merge, "a").unwrap();
        }
        assert_eq!(r.history().count(), 2);
    }

    fn edit_record() -> ConflictResolution {
        ConflictResolution {
            id: "c-remote".into(),
            document_id: "doc".into(),
            edits: vec![edit("X", "x", 0, 1, "x", 1)],
            strategy: None,
            resolved_by: None,
            resolved_at: None,
            final_content: None,
            winner_id: None,
            detected_at: 0,
        }
    }
}
