//! Presence tracking: who is in the session and where their carets are.
//!
//! ## Architecture
//!
//! ```text
//! user_join / user_leave ──► PresenceRoster   (descriptors, keyed by id)
//!                                 │ leave also clears ▼
//! cursor_move ─────────────► CursorOverlay    (remote carets, self excluded)
//! ```
//!
//! Neither structure ever holds the local participant: the relay does not
//! announce a joiner to itself and the overlay drops our own id on entry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::CursorOwner;

// ───────────────────────────────────────────────────────────────────
// Participant descriptor
// ───────────────────────────────────────────────────────────────────

/// Identity and display metadata of one session member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    /// Cursor color as `#rrggbb`.
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub image_url: String,
}

impl Participant {
    /// Create a participant whose color is derived from `id`.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let color = color_for_id(&id);
        Self {
            id,
            name: name.into(),
            email: String::new(),
            color,
            image_url: String::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = url.into();
        self
    }

    /// Override the derived color.
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

/// Stable, visually distinct `#rrggbb` color for an identifier.
///
/// FNV-1a over the id bytes picks the hue; saturation and lightness are
/// fixed so every participant gets an equally vivid caret.
pub fn color_for_id(id: &str) -> String {
    let hue = (fnv1a(id.as_bytes()) % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        channel(r),
        channel(g),
        channel(b)
    )
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

fn channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
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

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
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
// Roster
// ───────────────────────────────────────────────────────────────────

/// Remote participants currently in the session, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    participants: HashMap<String, Participant>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a participant. A repeated join for a known id is a no-op
    /// and returns `false`.
    pub fn join(&mut self, participant: Participant) -> bool {
        if self.participants.contains_key(&participant.id) {
            return false;
        }
        self.participants.insert(participant.id.clone(), participant);
        true
    }

    /// Remove a participant. Unknown ids are a no-op.
    pub fn leave(&mut self, user_id: &str) -> Option<Participant> {
        self.participants.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Participants ordered by id, for stable presentation.
    pub fn participants(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = self.participants.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

// ───────────────────────────────────────────────────────────────────
// Cursor overlay
// ───────────────────────────────────────────────────────────────────

/// Last known caret of one remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub line: u32,
    pub column: u32,
    /// Display descriptor sent alongside the position, if any.
    pub owner: Option<CursorOwner>,
}

impl CursorState {
    /// Label to render next to the caret.
    pub fn label(&self) -> Option<&str> {
        self.owner.as_ref().and_then(|o| o.name.as_deref())
    }
}

/// Remote carets keyed by participant id. The local id is never stored.
#[derive(Debug, Clone)]
pub struct CursorOverlay {
    local_user_id: String,
    cursors: HashMap<String, CursorState>,
}

impl CursorOverlay {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            cursors: HashMap::new(),
        }
    }

    /// Replace the caret of `user_id`. Returns `false` for our own id.
    pub fn update(&mut self, user_id: &str, cursor: CursorState) -> bool {
        if user_id == self.local_user_id {
            return false;
        }
        self.cursors.insert(user_id.to_owned(), cursor);
        true
    }

    pub fn remove(&mut self, user_id: &str) -> Option<CursorState> {
        self.cursors.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&CursorState> {
        self.cursors.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Snapshot of every remote caret.
    pub fn cursors(&self) -> HashMap<String, CursorState> {
        self.cursors.clone()
    }
}
