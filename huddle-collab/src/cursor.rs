//! Live cursor broadcast with distance/time throttling and per-user fade.
//!
//! ```text
//! pointer move ──► MovementThrottle (≥5px AND ≥50ms) ──► cursor_position
//!
//! cursor_position ──► RemoteCursor { fade_at = now + 3s }
//!                            │
//!                     tick(now) ≥ fade_at ──► removed (visual only)
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::CollabConfig;
use crate::protocol::unix_millis;
use crate::throttle::MovementThrottle;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Pointer position in document pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Text selection attached to a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

/// `cursor_position` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub user_id: String,
    pub user_name: String,
    /// `#rrggbb`, stable per user id.
    pub color: String,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    pub timestamp: u64,
}

impl CursorUpdate {
    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable display color for a user id, as `#rrggbb`.
///
/// Hue comes from an FNV-1a hash of the id; saturation and lightness are
/// fixed so every cursor reads well on a light background.
pub fn cursor_color(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
        });
    let hue = (hash % 360) as f64 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f64, s: f64, l: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f64, q: f64, mut t: f64) -> f64 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Broadcaster
// ───────────────────────────────────────────────────────────────────

/// A remote user's last known cursor and its fade deadline.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub update: CursorUpdate,
    fade_at: Instant,
}

impl RemoteCursor {
    pub fn fade_at(&self) -> Instant {
        self.fade_at
    }
}

/// Sends the local cursor and keeps the remote ones.
pub struct CursorBroadcaster {
    user_id: String,
    user_name: String,
    color: String,
    throttle: MovementThrottle,
    fade: Duration,
    cursors: HashMap<String, RemoteCursor>,
    /// User ids in first-seen order.
    order: Vec<String>,
}

impl CursorBroadcaster {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>, config: &CollabConfig) -> Self {
        let user_id = user_id.into();
        Self {
            color: cursor_color(&user_id),
            user_id,
            user_name: user_name.into(),
            throttle: MovementThrottle::new(config.cursor_min_distance, config.cursor_min_interval),
            fade: config.cursor_fade,
            cursors: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Local pointer moved. Returns the update to transmit, if any.
    pub fn move_local(
        &mut self,
        x: f64,
        y: f64,
        selection: Option<SelectionRange>,
        now: Instant,
    ) -> Option<CursorUpdate> {
        if !self.throttle.admit(Point::new(x, y), now) {
            return None;
        }
        Some(CursorUpdate {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            color: self.color.clone(),
            x,
            y,
            selection,
            timestamp: unix_millis(),
        })
    }

    /// Store a remote cursor and restart that user's fade deadline.
    ///
    /// Returns `false` for our own echo or an out-of-date update.
    pub fn apply_remote(&mut self, update: CursorUpdate, now: Instant) -> bool {
        if update.user_id == self.user_id {
            return false;
        }
        let fade_at = now + self.fade;
        match self.cursors.get_mut(&update.user_id) {
            Some(existing) => {
                if update.timestamp < existing.update.timestamp {
                    log::trace!("Stale cursor from {} ignored", update.user_id);
                    return false;
                }
                existing.update = update;
                existing.fade_at = fade_at;
            }
            None => {
                self.order.push(update.user_id.clone());
                self.cursors
                    .insert(update.user_id.clone(), RemoteCursor { update, fade_at });
            }
        }
        true
    }

    /// Remove cursors whose fade deadline has passed.
    pub fn tick(&mut self, now: Instant) -> Vec<String> {
        let faded: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.cursors.get(*id).is_some_and(|c| now >= c.fade_at))
            .cloned()
            .collect();
        for id in &faded {
            self.remove(id);
        }
        faded
    }

    /// Drop a user's cursor immediately (e.g. they left).
    pub fn remove(&mut self, user_id: &str) -> bool {
        if self.cursors.remove(user_id).is_some() {
            self.order.retain(|id| id != user_id);
            true
        } else {
            false
        }
    }

    /// Forget everything, including local throttle history.
    pub fn reset(&mut self) {
        self.cursors.clear();
        self.order.clear();
        self.throttle.reset();
    }

    /// Visible remote cursors in first-seen order.
    pub fn cursors(&self) -> Vec<&CursorUpdate> {
        self.order
            .iter()
            .filter_map(|id| self.cursors.get(id))
            .map(|c| &c.update)
            .collect()
    }

    pub fn cursor(&self, user_id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(user_id)
    }

    pub fn count(&self) -> usize {
        self.cursors.len()
    }

    pub fn local_color(&self) -> &str {
        &self.color
    }
}
