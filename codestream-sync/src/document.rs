//! Local replica of the shared document.
//!
//! The document is replaced wholesale on every change; the last write the
//! relay delivers wins. Each replacement records where it came from so the
//! editor binding never re-broadcasts text it just received:
//!
//! ```text
//! editor keystroke ──► set_local()    origin = Local   ──► code_change out
//! relay code_change ─► apply_remote() origin = Remote  ──► (no echo)
//! ```

use chrono::Utc;

use crate::protocol::{CodeChange, LanguageChange};

/// Fallback text for a session whose stored code is empty.
pub const DEFAULT_CODE: &str = "// Start coding here...\n";

/// Fallback language for a session with no stored language.
pub const DEFAULT_LANGUAGE: &str = "javascript";

/// 1-based line/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Ordered range between two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub start: Position,
    pub end: Position,
}

/// Local caret with an optional selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caret {
    pub position: Position,
    pub selection: Option<Selection>,
}

impl Caret {
    pub fn at(line: u32, column: u32) -> Self {
        Self {
            position: Position::new(line, column),
            selection: None,
        }
    }
}

/// Where the current text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Initial bootstrap state.
    Snapshot,
    /// Produced by the local editor.
    Local,
    /// Received from the relay.
    Remote,
}

/// Text and language at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub text: String,
    pub language: String,
}

impl DocumentSnapshot {
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
        }
    }
}

impl Default for DocumentSnapshot {
    fn default() -> Self {
        Self::new(DEFAULT_CODE, DEFAULT_LANGUAGE)
    }
}

/// The client's replica of document text and language.
#[derive(Debug, Clone)]
pub struct DocumentState {
    text: String,
    language: String,
    origin: Origin,
    caret: Option<Caret>,
}

impl DocumentState {
    pub fn new(snapshot: DocumentSnapshot) -> Self {
        Self {
            text: snapshot.text,
            language: snapshot.language,
            origin: Origin::Snapshot,
            caret: None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn caret(&self) -> Option<Caret> {
        self.caret
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot::new(self.text.clone(), self.language.clone())
    }

    /// Record a local edit and produce the outbound payload.
    ///
    /// Always yields a payload, even when `text` equals the current text.
    pub fn set_local(&mut self, text: impl Into<String>) -> CodeChange {
        self.text = text.into();
        self.origin = Origin::Local;
        CodeChange {
            code: self.text.clone(),
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    /// Apply text received from the relay.
    ///
    /// Returns `false` and leaves the replica untouched when the text is
    /// identical. Otherwise replaces it and re-clamps the caret against the
    /// new text.
    pub fn apply_remote(&mut self, text: &str) -> bool {
        if self.text == text {
            return false;
        }
        self.text = text.to_owned();
        self.origin = Origin::Remote;
        self.caret = self.caret.map(|caret| clamp_caret(&self.text, caret));
        true
    }

    /// Record a local language switch and produce the outbound payload.
    pub fn set_local_language(&mut self, language: impl Into<String>) -> LanguageChange {
        self.language = language.into();
        LanguageChange {
            language: self.language.clone(),
        }
    }

    /// Apply a language received from the relay. No-op when unchanged or
    /// empty.
    pub fn apply_remote_language(&mut self, language: &str) -> bool {
        if language.is_empty() || self.language == language {
            return false;
        }
        self.language = language.to_owned();
        true
    }

    /// Record where the local caret is, clamped to the current text.
    pub fn set_caret(&mut self, caret: Caret) -> Caret {
        let clamped = clamp_caret(&self.text, caret);
        self.caret = Some(clamped);
        clamped
    }
}

/// Number of lines in `text`. Empty text has one line.
pub fn line_count(text: &str) -> u32 {
    u32::try_from(text.split('\n').count()).unwrap_or(u32::MAX)
}

/// Largest valid column on `line`: its length plus one.
pub fn max_column(text: &str, line: u32) -> u32 {
    let index = line.saturating_sub(1) as usize;
    text.split('\n')
        .nth(index)
        .map(|l| {
            let len = l.strip_suffix('\r').unwrap_or(l).chars().count();
            u32::try_from(len).unwrap_or(u32::MAX - 1) + 1
        })
        .unwrap_or(1)
}

/// Clamp a position into the bounds of `text`.
pub fn clamp_position(text: &str, position: Position) -> Position {
    let line = position.line.clamp(1, line_count(text));
    let column = position.column.clamp(1, max_column(text, line));
    Position { line, column }
}

fn clamp_caret(text: &str, caret: Caret) -> Caret {
    Caret {
        position: clamp_position(text, caret.position),
        selection: caret.selection.map(|s| Selection {
            start: clamp_position(text, s.start),
            end: clamp_position(text, s.end),
        }),
    }
}
