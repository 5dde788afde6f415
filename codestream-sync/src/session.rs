//! Session-scoped state and the inbound dispatcher.
//!
//! One [`SessionState`] exists per session membership and is owned by that
//! membership's session task. Inbound frames are routed by message variant:
//!
//! | message           | target                      | applied when                  |
//! |-------------------|-----------------------------|-------------------------------|
//! | `user_join`       | roster                      | id not yet present            |
//! | `user_leave`      | roster + cursor overlay     | id present in either          |
//! | `code_change`     | document                    | text differs from replica     |
//! | `language_change` | document                    | language differs              |
//! | `cursor_move`     | cursor overlay              | sender is not us              |
//! | `ping` / `pong`   | nothing                     | never                         |
//!
//! Each applied message yields exactly one [`SyncEvent`]; no-ops yield none.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::document::{Caret, DocumentSnapshot, DocumentState, Origin};
use crate::presence::{CursorOverlay, CursorState, Participant, PresenceRoster};
use crate::protocol::{Envelope, Message, ProtocolError};

/// Events delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Transport opened.
    Connected,
    /// Transport lost; the next attempt starts after `retry_in`.
    Disconnected { retry_in: Duration },
    /// Queued messages replayed after (re)connecting.
    Flushed { count: usize },
    /// A participant entered the roster.
    ParticipantJoined(Participant),
    /// A participant left. `participant` is `None` when only a cursor was known.
    ParticipantLeft {
        user_id: String,
        participant: Option<Participant>,
    },
    /// Remote text replaced the replica. `caret` is the re-clamped local caret.
    CodeChanged { code: String, caret: Option<Caret> },
    /// Remote language replaced the replica's.
    LanguageChanged(String),
    /// A remote caret moved.
    CursorMoved { user_id: String, cursor: CursorState },
}

/// Consistent snapshot of one session, taken inside the session task.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: String,
    pub local: Participant,
    pub document: DocumentSnapshot,
    pub origin: Origin,
    pub caret: Option<Caret>,
    /// Remote participants, ordered by id.
    pub participants: Vec<Participant>,
    pub cursors: HashMap<String, CursorState>,
    pub connection: ConnectionState,
    /// Messages waiting for a connection.
    pub pending: usize,
    /// Consecutive failed connection attempts.
    pub attempts: u32,
}

/// Document, roster and cursors of one session membership.
#[derive(Debug)]
pub struct SessionState {
    session_id: String,
    local: Participant,
    document: DocumentState,
    roster: PresenceRoster,
    cursors: CursorOverlay,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, local: Participant, snapshot: DocumentSnapshot) -> Self {
        let cursors = CursorOverlay::new(local.id.clone());
        Self {
            session_id: session_id.into(),
            local,
            document: DocumentState::new(snapshot),
            roster: PresenceRoster::new(),
            cursors,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn document(&self) -> &DocumentState {
        &self.document
    }

    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    pub fn cursors(&self) -> &CursorOverlay {
        &self.cursors
    }

    // ── Local operations ─────────────────────────────────────────

    /// Apply a local edit and build its outbound message.
    pub fn edit(&mut self, text: impl Into<String>) -> Envelope {
        let change = self.document.set_local(text);
        self.outbound(Message::CodeChange(change))
    }

    /// Apply a local language switch and build its outbound message.
    pub fn change_language(&mut self, language: impl Into<String>) -> Envelope {
        let change = self.document.set_local_language(language);
        self.outbound(Message::LanguageChange(change))
    }

    /// Record the local caret and build the cursor update for peers.
    pub fn move_cursor(&mut self, caret: Caret) -> Envelope {
        let caret = self.document.set_caret(caret);
        Envelope::cursor_move(
            self.session_id.clone(),
            &self.local,
            caret.position.line,
            caret.position.column,
        )
    }

    pub fn ping(&self) -> Envelope {
        Envelope::ping(self.session_id.clone(), self.local.id.clone())
    }

    fn outbound(&self, message: Message) -> Envelope {
        Envelope::new(self.session_id.clone(), Some(self.local.id.clone()), message)
    }

    // ── Inbound dispatch ─────────────────────────────────────────

    /// Decode and route every envelope in one text frame. Undecodable
    /// envelopes are logged and discarded; the rest still apply.
    pub fn dispatch_frame(&mut self, frame: &str) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        for decoded in Envelope::decode_frame(frame) {
            match decoded {
                Ok(envelope) => events.extend(self.dispatch(envelope)),
                Err(ProtocolError::UnknownType(tag)) => {
                    debug!("Ignoring message of unknown type `{tag}`");
                }
                Err(e) => warn!("Discarding frame: {e}"),
            }
        }
        events
    }

    /// Route one decoded envelope.
    pub fn dispatch(&mut self, envelope: Envelope) -> Option<SyncEvent> {
        if !envelope.session_id.is_empty() && envelope.session_id != self.session_id {
            warn!(
                "Discarding {} for session {} (joined {})",
                envelope.kind(),
                envelope.session_id,
                self.session_id
            );
            return None;
        }

        let Envelope {
            user_id, message, ..
        } = envelope;

        match message {
            Message::UserJoin(participant) => {
                if !self.roster.join(participant.clone()) {
                    return None;
                }
                debug!("{} ({}) joined", participant.name, participant.id);
                Some(SyncEvent::ParticipantJoined(participant))
            }

            Message::UserLeave => {
                let Some(user_id) = user_id else {
                    debug!("user_leave without user_id");
                    return None;
                };
                let participant = self.roster.leave(&user_id);
                let cursor = self.cursors.remove(&user_id);
                if participant.is_none() && cursor.is_none() {
                    return None;
                }
                debug!("{user_id} left");
                Some(SyncEvent::ParticipantLeft {
                    user_id,
                    participant,
                })
            }

            Message::CodeChange(change) => {
                if !self.document.apply_remote(&change.code) {
                    trace!("code_change matches replica");
                    return None;
                }
                Some(SyncEvent::CodeChanged {
                    code: change.code,
                    caret: self.document.caret(),
                })
            }

            Message::LanguageChange(change) => {
                if !self.document.apply_remote_language(&change.language) {
                    return None;
                }
                Some(SyncEvent::LanguageChanged(change.language))
            }

            Message::CursorMove(movement) => {
                let sender = user_id.or_else(|| movement.user.as_ref().and_then(|u| u.id.clone()));
                let Some(sender) = sender else {
                    debug!("cursor_move without a sender id");
                    return None;
                };
                let cursor = CursorState {
                    line: movement.line,
                    column: movement.column,
                    owner: movement.user,
                };
                if self.cursors.get(&sender) == Some(&cursor) {
                    return None;
                }
                if !self.cursors.update(&sender, cursor.clone()) {
                    trace!("Dropping own cursor echo");
                    return None;
                }
                Some(SyncEvent::CursorMoved {
                    user_id: sender,
                    cursor,
                })
            }

            Message::Ping | Message::Pong => None,
        }
    }

    /// Snapshot for the application.
    pub fn view(&self, connection: &ConnectionManager) -> SessionView {
        SessionView {
            session_id: self.session_id.clone(),
            local: self.local.clone(),
            document: self.document.snapshot(),
            origin: self.document.origin(),
            caret: self.document.caret(),
            participants: self.roster.participants(),
            cursors: self.cursors.cursors(),
            connection: connection.state(),
            pending: connection.pending(),
            attempts: connection.attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::protocol::{CodeChange, CursorMove, CursorOwner, LanguageChange};

    fn session() -> SessionState {
        SessionState::new(
            "S",
            Participant::new("me", "Me"),
            DocumentSnapshot::new("", "javascript"),
        )
    }

    fn from(user: &str, message: Message) -> Envelope {
        Envelope::new("S", Some(user.to_owned()), message)
    }

    fn code(text: &str) -> Message {
        Message::CodeChange(CodeChange {
            code: text.into(),
            timestamp: None,
        })
    }

    fn cursor(line: u32, column: u32) -> Message {
        Message::CursorMove(CursorMove {
            line,
            column,
            user: None,
        })
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut s = session();
        let bob = Participant::new("bob", "Bob");

        let event = s.dispatch(Envelope::user_join("S", bob.clone()));
        assert_eq!(event, Some(SyncEvent::ParticipantJoined(bob.clone())));
        assert_eq!(s.dispatch(Envelope::user_join("S", bob)), None);
        assert_eq!(s.roster().len(), 1);
    }

    #[test]
    fn test_leave_clears_roster_and_cursor() {
        let mut s = session();
        s.dispatch(Envelope::user_join("S", Participant::new("bob", "Bob")));
        s.dispatch(from("bob", cursor(2, 2)));
        assert_eq!(s.cursors().len(), 1);

        match s.dispatch(Envelope::user_leave("S", "bob")) {
            Some(SyncEvent::ParticipantLeft {
                user_id,
                participant,
            }) => {
                assert_eq!(user_id, "bob");
                assert_eq!(participant.unwrap().name, "Bob");
            }
            other => panic!("expected ParticipantLeft, got {other:?}"),
        }
        assert!(s.roster().is_empty());
        assert!(s.cursors().is_empty());
    }

    #[test]
    fn test_leave_of_cursor_only_participant() {
        let mut s = session();
        s.dispatch(from("carol", cursor(1, 1)));

        let event = s.dispatch(Envelope::user_leave("S", "carol"));
        assert_eq!(
            event,
            Some(SyncEvent::ParticipantLeft {
                user_id: "carol".into(),
                participant: None,
            })
        );
    }

    #[test]
    fn test_leave_unknown_is_noop() {
        let mut s = session();
        s.dispatch(Envelope::user_join("S", Participant::new("bob", "Bob")));
        assert_eq!(s.dispatch(Envelope::user_leave("S", "nobody")), None);
        assert_eq!(s.roster().len(), 1);
    }

    #[test]
    fn test_code_change_applies_once() {
        let mut s = session();
        let event = s.dispatch(from("bob", code("x=1")));
        assert_eq!(
            event,
            Some(SyncEvent::CodeChanged {
                code: "x=1".into(),
                caret: None,
            })
        );
        assert_eq!(s.dispatch(from("bob", code("x=1"))), None);
        assert_eq!(s.document().text(), "x=1");
        assert_eq!(s.document().origin(), Origin::Remote);
    }

    #[test]
    fn test_code_change_reports_clamped_caret() {
        let mut s = session();
        s.dispatch(from("bob", code("first\nsecond line")));
        s.move_cursor(Caret::at(2, 12));

        match s.dispatch(from("bob", code("x"))) {
            Some(SyncEvent::CodeChanged { caret, .. }) => {
                assert_eq!(caret, Some(Caret::at(1, 2)));
            }
            other => panic!("expected CodeChanged, got {other:?}"),
        }
    }

    #[test]
    fn test_language_change_idempotent() {
        let mut s = session();
        let python = || {
            Message::LanguageChange(LanguageChange {
                language: "python".into(),
            })
        };
        assert_eq!(
            s.dispatch(from("bob", python())),
            Some(SyncEvent::LanguageChanged("python".into()))
        );
        assert_eq!(s.dispatch(from("bob", python())), None);
        assert_eq!(s.document().language(), "python");
    }

    #[test]
    fn test_empty_language_change_ignored() {
        let mut s = session();
        let blank = Message::LanguageChange(LanguageChange {
            language: String::new(),
        });
        assert_eq!(s.dispatch(from("bob", blank)), None);
        assert_eq!(s.document().language(), "javascript");
    }

    #[test]
    fn test_own_cursor_never_stored() {
        let mut s = session();
        assert_eq!(s.dispatch(from("me", cursor(3, 3))), None);
        assert!(s.cursors().is_empty());
    }

    #[test]
    fn test_cursor_move_stores_owner() {
        let mut s = session();
        let owner = CursorOwner {
            id: None,
            name: Some("Bob".into()),
            color: Some("#00ff00".into()),
        };
        let message = Message::CursorMove(CursorMove {
            line: 4,
            column: 2,
            user: Some(owner.clone()),
        });

        match s.dispatch(from("bob", message.clone())) {
            Some(SyncEvent::CursorMoved { user_id, cursor }) => {
                assert_eq!(user_id, "bob");
                assert_eq!((cursor.line, cursor.column), (4, 2));
                assert_eq!(cursor.owner, Some(owner));
            }
            other => panic!("expected CursorMoved, got {other:?}"),
        }
        // Same position again changes nothing.
        assert_eq!(s.dispatch(from("bob", message)), None);
    }

    #[test]
    fn test_cursor_sender_falls_back_to_owner_id() {
        let mut s = session();
        let message = Message::CursorMove(CursorMove {
            line: 1,
            column: 5,
            user: Some(CursorOwner {
                id: Some("dan".into()),
                ..Default::default()
            }),
        });
        assert!(s.dispatch(Envelope::new("S", None, message)).is_some());
        assert!(s.cursors().get("dan").is_some());
    }

    #[test]
    fn test_keepalive_ignored() {
        let mut s = session();
        assert_eq!(s.dispatch(from("bob", Message::Ping)), None);
        assert_eq!(s.dispatch(Envelope::pong("S")), None);
    }

    #[test]
    fn test_foreign_session_discarded() {
        let mut s = session();
        let envelope = Envelope::new("OTHER", Some("bob".into()), code("x"));
        assert_eq!(s.dispatch(envelope), None);
        assert_eq!(s.document().text(), "");
    }

    #[test]
    fn test_dispatch_frame_fails_closed() {
        let mut s = session();
        assert!(s.dispatch_frame("{{{").is_empty());
        assert!(s
            .dispatch_frame(r#"{"type":"selection_change","session_id":"S"}"#)
            .is_empty());
        assert!(s
            .dispatch_frame(r#"{"type":"code_change","session_id":"S","data":{"code":7}}"#)
            .is_empty());
        assert_eq!(s.document().text(), "");

        let events = s.dispatch_frame(
            r#"{"type":"code_change","session_id":"S","user_id":"bob","data":{"code":"ok"}}"#,
        );
        assert!(matches!(events.as_slice(), [SyncEvent::CodeChanged { .. }]));
    }

    #[test]
    fn test_dispatch_frame_applies_relay_batch() {
        // Registration push: stored code and language in one frame.
        let mut s = session();
        let frame = concat!(
            r#"{"type":"code_change","session_id":"S","user_id":"","data":{"code":"stored"}}"#,
            "\n",
            r#"{"type":"language_change","session_id":"S","user_id":"","data":{"language":"python"}}"#,
            "\n",
        );

        let events = s.dispatch_frame(frame);
        assert_eq!(
            events,
            vec![
                SyncEvent::CodeChanged {
                    code: "stored".into(),
                    caret: None,
                },
                SyncEvent::LanguageChanged("python".into()),
            ]
        );
        assert_eq!(s.document().text(), "stored");
        assert_eq!(s.document().language(), "python");
    }

    #[test]
    fn test_dispatch_frame_keeps_batch_order() {
        let mut s = session();
        let frame = [
            Envelope::code_change("S", "bob", "x=1", Some(1)),
            Envelope::code_change("S", "bob", "x=1;y=2", Some(2)),
        ]
        .iter()
        .map(|e| e.encode().unwrap())
        .collect::<Vec<_>>()
        .join("\n");

        let codes: Vec<String> = s
            .dispatch_frame(&frame)
            .into_iter()
            .map(|e| match e {
                SyncEvent::CodeChanged { code, .. } => code,
                other => panic!("expected CodeChanged, got {other:?}"),
            })
            .collect();
        assert_eq!(codes, vec!["x=1", "x=1;y=2"]);
        assert_eq!(s.document().text(), "x=1;y=2");
    }

    #[test]
    fn test_local_operations_build_envelopes() {
        let mut s = session();

        let edit = s.edit("x=1");
        assert_eq!(edit.user_id.as_deref(), Some("me"));
        assert!(matches!(edit.message, Message::CodeChange(ref c) if c.code == "x=1"));
        assert_eq!(s.document().origin(), Origin::Local);

        let lang = s.change_language("go");
        assert!(matches!(lang.message, Message::LanguageChange(ref l) if l.language == "go"));

        let moved = s.move_cursor(Caret::at(1, 99));
        match moved.message {
            Message::CursorMove(c) => {
                assert_eq!((c.line, c.column), (1, 4));
                assert_eq!(c.user.unwrap().name.as_deref(), Some("Me"));
            }
            other => panic!("expected CursorMove, got {other:?}"),
        }

        assert_eq!(s.ping().kind(), crate::protocol::MessageType::Ping);
    }

    #[test]
    fn test_view_reflects_state() {
        let mut s = session();
        s.dispatch(Envelope::user_join("S", Participant::new("bob", "Bob")));
        s.dispatch(from("bob", cursor(1, 1)));
        s.edit("hello");

        let mut connection = ConnectionManager::new(BackoffConfig::default());
        connection.submit(s.edit("hello world"));

        let view = s.view(&connection);
        assert_eq!(view.session_id, "S");
        assert_eq!(view.document.text, "hello world");
        assert_eq!(view.participants.len(), 1);
        assert_eq!(view.cursors.len(), 1);
        assert_eq!(view.connection, ConnectionState::Disconnected);
        assert_eq!(view.pending, 1);
        assert_eq!(view.attempts, 0);
    }
}
