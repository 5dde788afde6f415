//! CodeStream Watch: headless session participant.
//!
//! Joins a session, logs everything that happens in it, and leaves cleanly
//! on Ctrl-C. Useful for watching a relay from a terminal or smoke-testing a
//! deployment.
//!
//! ```text
//! RUST_LOG=info codestream-watch --session abc123 --name Watcher
//! RUST_LOG=debug codestream-watch --create --language rust
//! ```

use std::error::Error;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use uuid::Uuid;

use codestream_sync::config::{DEFAULT_API_URL, DEFAULT_SERVER_URL};
use codestream_sync::document::line_count;
use codestream_sync::{BackoffConfig, Participant, SessionApi, SyncClient, SyncConfig, SyncEvent};

#[derive(Parser, Debug)]
#[command(name = "codestream-watch")]
#[command(about = "Join a CodeStream session and log its activity")]
#[command(version)]
struct Args {
    /// Session to join
    #[arg(short, long, required_unless_present = "create")]
    session: Option<String>,

    /// Create a new session instead of joining an existing one
    #[arg(long, conflicts_with = "session")]
    create: bool,

    /// Language for a newly created session
    #[arg(long, default_value = "javascript")]
    language: String,

    /// Relay WebSocket endpoint
    #[arg(long, env = "CODESTREAM_WS_URL", default_value = DEFAULT_SERVER_URL)]
    ws_url: String,

    /// Session REST API base
    #[arg(long, env = "CODESTREAM_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// First reconnect delay in milliseconds
    #[arg(long, env = "CODESTREAM_BACKOFF_INITIAL_MS", default_value_t = 1000)]
    backoff_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[arg(long, env = "CODESTREAM_BACKOFF_MAX_MS", default_value_t = 10_000)]
    backoff_max_ms: u64,

    /// Participant id (random when omitted)
    #[arg(long)]
    user_id: Option<String>,

    /// Display name
    #[arg(short, long, default_value = "Watcher")]
    name: String,

    /// Contact email
    #[arg(long, default_value = "")]
    email: String,
}

impl Args {
    fn config(&self) -> SyncConfig {
        SyncConfig::new(&self.ws_url, &self.api_url).with_backoff(BackoffConfig::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        ))
    }

    fn participant(&self) -> Participant {
        let id = self
            .user_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Participant::new(id, &self.name).with_email(&self.email)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = args.config();
    let api = SessionApi::new(&config)?;

    let session = match &args.session {
        Some(id) => api.fetch_session(id).await?,
        None => api.create_session(&args.language, "").await?,
    };
    info!(
        "Session {} ({}, {} stored participant(s))",
        session.id,
        session.language,
        session.users.len()
    );

    let participant = args.participant();
    let mut client = SyncClient::connect(&config, &session.id, participant, session.snapshot())?;
    let mut events = client
        .take_event_rx()
        .ok_or("event receiver already taken")?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => {
                    error!("Session task ended unexpectedly");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving session");
                break;
            }
        }
    }

    if let Ok(view) = client.view().await {
        info!(
            "Final state: {} line(s) of {}, {} participant(s), {} unsent",
            line_count(&view.document.text),
            view.document.language,
            view.participants.len(),
            view.pending
        );
    }
    client.shutdown().await?;
    Ok(())
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Connected => info!("Connected"),
        SyncEvent::Disconnected { retry_in } => {
            warn!("Disconnected, retrying in {}ms", retry_in.as_millis())
        }
        SyncEvent::Flushed { count } => info!("Replayed {count} queued message(s)"),
        SyncEvent::ParticipantJoined(p) => info!("{} <{}> joined ({})", p.name, p.id, p.color),
        SyncEvent::ParticipantLeft {
            user_id,
            participant,
        } => match participant {
            Some(p) => info!("{} <{user_id}> left", p.name),
            None => info!("<{user_id}> left"),
        },
        SyncEvent::CodeChanged { code, .. } => info!(
            "Document replaced: {} byte(s), {} line(s)",
            code.len(),
            line_count(code)
        ),
        SyncEvent::LanguageChanged(language) => info!("Language is now {language}"),
        SyncEvent::CursorMoved { user_id, cursor } => info!(
            "{} at {}:{}",
            cursor.label().unwrap_or(user_id.as_str()),
            cursor.line,
            cursor.column
        ),
    }
}
