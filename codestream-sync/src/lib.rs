//! # codestream-sync: realtime session sync for collaborative code editing
//!
//! Keeps a client's copy of a shared session (document text, language,
//! participants and their carets) in step with every other participant
//! through a relay that fans JSON envelopes out over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   REST (once)    ┌──────────────┐
//! │ SessionApi  │ ───────────────► │ session API  │
//! └──────┬──────┘                  └──────────────┘
//!        │ DocumentSnapshot
//!        ▼
//! ┌─────────────┐  JSON envelopes  ┌──────────────┐
//! │ SyncClient  │ ◄──────────────► │ relay        │ ◄──► other participants
//! │ (per user)  │    WebSocket     │ (per session)│
//! └──────┬──────┘                  └──────────────┘
//!        │ owns, inside one task
//!        ▼
//! ┌──────────────────┬──────────────┬──────────────┬───────────────┐
//! │ConnectionManager │ DocumentState│PresenceRoster│ CursorOverlay │
//! │ + OutboundQueue  │  (LWW text)  │              │               │
//! └──────────────────┴──────────────┴──────────────┴───────────────┘
//! ```
//!
//! Conflict policy is whole-document last-writer-wins: the most recently
//! received `code_change` replaces the replica. There is no merge.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope and closed message set
//! - [`presence`]: participants, colors, roster, cursor overlay
//! - [`document`]: text/language replica with echo suppression
//! - [`queue`]: outbound FIFO replayed on reconnect
//! - [`connection`]: state machine, backoff, reconnect timer
//! - [`session`]: session state and inbound dispatcher
//! - [`client`]: session task and application handle
//! - [`bootstrap`]: REST snapshot fetch and session creation

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod session;

// Re-exports for convenience
pub use bootstrap::{Session, SessionApi};
pub use client::SyncClient;
pub use config::{BackoffConfig, SyncConfig};
pub use connection::{Backoff, ConnectionManager, ConnectionState, ReconnectTimer};
pub use document::{Caret, DocumentSnapshot, DocumentState, Origin, Position, Selection};
pub use error::{SyncError, SyncResult};
pub use presence::{color_for_id, CursorOverlay, CursorState, Participant, PresenceRoster};
pub use protocol::{
    CodeChange, CursorMove, CursorOwner, Envelope, LanguageChange, Message, MessageType,
    ProtocolError,
};
pub use queue::{FrameSink, OutboundQueue};
pub use session::{SessionState, SessionView, SyncEvent};
