//! Presence tracking: local status derivation and the remote roster.
//!
//! Presence is a lease, not a state machine. Every participant re-announces
//! itself periodically; entries that stop being renewed are dropped on the
//! next tick without any explicit departure message.
//!
//! ```text
//! local activity ──► Online (immediate if was Away) ──► broadcast
//!       │
//!       └── no activity for away_after ──► Away ──► broadcast
//!
//! remote update ──► roster upsert (last_seen = now)
//!       │
//!       └── not renewed within presence_timeout ──► expired
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::CollabConfig;
use crate::connection::SessionIdentity;
use crate::cursor::Point;
use crate::protocol::unix_millis;
use crate::throttle::FixedWindow;

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// Participant status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    /// Statuses chosen by the user that activity must not override.
    pub fn is_manual(&self) -> bool {
        matches!(self, PresenceStatus::Busy | PresenceStatus::Offline)
    }
}

/// Kind of local input that counts as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Pointer,
    Key,
    Scroll,
    Touch,
}

/// `user_presence_update` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub status: PresenceStatus,
    pub document_id: String,
    /// Area within the document (page, panel, element).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    /// Unix milliseconds of the sender's last activity.
    pub last_activity: u64,
}

/// `user_presence_left` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceLeft {
    pub user_id: String,
}

// ───────────────────────────────────────────────────────────────────
// Roster
// ───────────────────────────────────────────────────────────────────

/// A remote participant as last seen.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPresence {
    pub user_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub status: PresenceStatus,
    pub document_id: String,
    pub area: Option<String>,
    /// Last known pointer position, kept after the cursor fades.
    pub cursor: Option<Point>,
    pub last_activity: u64,
    last_seen: Instant,
}

impl UserPresence {
    fn from_update(update: PresenceUpdate, now: Instant) -> Self {
        Self {
            user_id: update.user_id,
            display_name: update.display_name,
            avatar: update.avatar,
            status: update.status,
            document_id: update.document_id,
            area: update.area,
            cursor: None,
            last_activity: update.last_activity,
            last_seen: now,
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Whether the lease lapsed at `now`.
    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// How the roster changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Joined(String),
    Updated(String),
    Left(String),
    Expired(String),
}

/// Result of a presence tick.
#[derive(Debug, Default, PartialEq)]
pub struct PresenceTick {
    /// Local presence to broadcast (away transition or lease refresh).
    pub broadcast: Option<PresenceUpdate>,
    /// Remote users whose lease lapsed.
    pub expired: Vec<String>,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Local presence plus the roster of remote participants in one document.
pub struct PresenceTracker {
    user_id: String,
    display_name: String,
    avatar: Option<String>,

    status: PresenceStatus,
    announced: bool,
    document_id: Option<String>,
    area: Option<String>,
    last_activity_at: Option<Instant>,
    last_activity_ms: u64,

    away_after: Duration,
    presence_timeout: Duration,
    activity_window: FixedWindow,
    refresh: FixedWindow,

    roster: HashMap<String, UserPresence>,
    /// User ids in join order.
    order: Vec<String>,
}

impl PresenceTracker {
    pub fn new(identity: &SessionIdentity, config: &CollabConfig) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            avatar: identity.avatar.clone(),
            status: PresenceStatus::Online,
            announced: false,
            document_id: None,
            area: None,
            last_activity_at: None,
            last_activity_ms: 0,
            away_after: config.away_after,
            presence_timeout: config.presence_timeout,
            activity_window: FixedWindow::new(config.activity_broadcast_interval),
            refresh: FixedWindow::new(config.presence_refresh_interval),
            roster: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Enter a document: empty roster, fresh timers, announcement to send.
    pub fn join_document(&mut self, document_id: impl Into<String>, now: Instant) -> PresenceUpdate {
        let document_id = document_id.into();
        log::info!("Presence joining document {document_id}");
        self.clear_roster();
        self.document_id = Some(document_id);
        self.area = None;
        if !self.status.is_manual() {
            self.status = PresenceStatus::Online;
        }
        self.touch(now);
        self.activity_window.reset();
        self.activity_window.mark(now);
        self.announce(now)
    }

    /// Leave the current document. Returns the departure notice, if joined.
    pub fn leave_document(&mut self) -> Option<PresenceLeft> {
        let document_id = self.document_id.take()?;
        log::info!("Presence leaving document {document_id}");
        self.clear_roster();
        self.area = None;
        self.announced = false;
        self.last_activity_at = None;
        self.activity_window.reset();
        self.refresh.reset();
        Some(PresenceLeft {
            user_id: self.user_id.clone(),
        })
    }

    /// Local input happened.
    pub fn record_activity(&mut self, kind: ActivityKind, now: Instant) -> Option<PresenceUpdate> {
        self.touch(now);
        self.document_id.as_ref()?;

        if !self.announced || self.status == PresenceStatus::Away {
            log::debug!("{kind:?} activity, announcing presence");
            if !self.status.is_manual() {
                self.status = PresenceStatus::Online;
            }
            self.activity_window.mark(now);
            return Some(self.announce(now));
        }
        if self.activity_window.try_acquire(now) {
            return Some(self.announce(now));
        }
        None
    }

    /// Manual status change, broadcast immediately.
    pub fn set_status(&mut self, status: PresenceStatus, now: Instant) -> Option<PresenceUpdate> {
        self.status = status;
        if status == PresenceStatus::Online {
            self.touch(now);
        }
        self.document_id.as_ref()?;
        self.activity_window.mark(now);
        Some(self.announce(now))
    }

    /// Local user moved to another area of the document.
    pub fn set_area(&mut self, area: Option<String>, now: Instant) -> Option<PresenceUpdate> {
        if self.area == area {
            return None;
        }
        self.area = area;
        self.touch(now);
        self.document_id.as_ref()?;
        if self.status == PresenceStatus::Away {
            self.status = PresenceStatus::Online;
        }
        self.activity_window.mark(now);
        Some(self.announce(now))
    }

    /// Re-announce the current local presence (e.g. after reconnecting).
    pub fn announcement(&mut self, now: Instant) -> Option<PresenceUpdate> {
        self.document_id.as_ref()?;
        Some(self.announce(now))
    }

    /// Away transition, lease refresh and remote expiry.
    pub fn tick(&mut self, now: Instant) -> PresenceTick {
        let mut result = PresenceTick::default();

        if self.document_id.is_some() {
            let idle = self
                .last_activity_at
                .is_some_and(|at| now.saturating_duration_since(at) >= self.away_after);
            if self.status == PresenceStatus::Online && idle {
                log::debug!("No activity for {:?}, going away", self.away_after);
                self.status = PresenceStatus::Away;
                result.broadcast = Some(self.announce(now));
            } else if self.announced && self.refresh.ready(now) {
                result.broadcast = Some(self.announce(now));
            }
        }

        let timeout = self.presence_timeout;
        result.expired = self
            .order
            .iter()
            .filter(|id| self.roster.get(*id).is_some_and(|p| p.is_expired(timeout, now)))
            .cloned()
            .collect();
        for id in &result.expired {
            log::info!("Presence lease of {id} expired");
            self.remove(id);
        }

        result
    }

    /// Upsert a remote participant.
    pub fn apply_remote(&mut self, update: PresenceUpdate, now: Instant) -> Option<RosterChange> {
        if update.user_id == self.user_id {
            return None;
        }
        if self.document_id.as_deref() != Some(update.document_id.as_str()) {
            log::debug!(
                "Presence of {} for document {} ignored",
                update.user_id,
                update.document_id
            );
            return None;
        }
        let user_id = update.user_id.clone();
        match self.roster.get_mut(&user_id) {
            Some(entry) => {
                let cursor = entry.cursor;
                *entry = UserPresence::from_update(update, now);
                entry.cursor = cursor;
                Some(RosterChange::Updated(user_id))
            }
            None => {
                log::info!("{} joined the document", update.display_name);
                self.order.push(user_id.clone());
                self.roster
                    .insert(user_id.clone(), UserPresence::from_update(update, now));
                Some(RosterChange::Joined(user_id))
            }
        }
    }

    /// Explicit departure.
    pub fn apply_left(&mut self, user_id: &str) -> Option<RosterChange> {
        if self.remove(user_id) {
            log::info!("{user_id} left the document");
            Some(RosterChange::Left(user_id.to_string()))
        } else {
            None
        }
    }

    /// Remember a participant's pointer position.
    pub fn set_cursor(&mut self, user_id: &str, position: Point) {
        if let Some(entry) = self.roster.get_mut(user_id) {
            entry.cursor = Some(position);
        }
    }

    fn announce(&mut self, now: Instant) -> PresenceUpdate {
        self.announced = true;
        self.refresh.mark(now);
        PresenceUpdate {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
            status: self.status,
            document_id: self.document_id.clone().unwrap_or_default(),
            area: self.area.clone(),
            last_activity: self.last_activity_ms,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity_at = Some(now);
        self.last_activity_ms = unix_millis();
    }

    fn remove(&mut self, user_id: &str) -> bool {
        if self.roster.remove(user_id).is_some() {
            self.order.retain(|id| id != user_id);
            true
        } else {
            false
        }
    }

    fn clear_roster(&mut self) {
        self.roster.clear();
        self.order.clear();
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Remote participants in join order.
    pub fn participants(&self) -> Vec<&UserPresence> {
        self.order.iter().filter_map(|id| self.roster.get(id)).collect()
    }

    pub fn participant(&self, user_id: &str) -> Option<&UserPresence> {
        self.roster.get(user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.roster.len()
    }

    pub fn online_count(&self) -> usize {
        self.roster
            .values()
            .filter(|p| p.status == PresenceStatus::Online)
            .count()
    }

    pub fn users_in_area(&self, area: &str) -> Vec<&UserPresence> {
        self.participants()
            .into_iter()
            .filter(|p| p.area.as_deref() == Some(area))
            .collect()
    }

    pub fn status(&self) -> PresenceStatus {
        self.status
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }
}
