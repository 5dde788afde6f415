//! WebSocket sync client for one session membership.
//!
//! Provides:
//! - Connection lifecycle with exponential-backoff reconnect
//! - Full-text edits, language switches and caret updates
//! - Outbound queue replay after every reconnect
//! - Inbound dispatch into document, roster and cursor overlay
//!
//! All session state lives in one spawned task. The [`SyncClient`] handle
//! talks to it over a command channel and the application reads
//! [`SyncEvent`]s from the event channel:
//!
//! ```text
//!  SyncClient ──commands──► ┌──────────── session task ────────────┐
//!                           │ select! {                            │
//!                           │   command      → edit / view / ...   │
//!                           │   connect done → open + flush queue  │ ◄──► relay
//!                           │   frame        → dispatch            │
//!                           │   timer fired  → reconnect           │
//!                           │ }                                    │
//!  event_rx  ◄──events───── └──────────────────────────────────────┘
//! ```

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::SyncConfig;
use crate::connection::{ConnectFuture, ConnectionManager, ConnectionState, ReconnectTimer};
use crate::document::{Caret, DocumentSnapshot};
use crate::error::{SyncError, SyncResult};
use crate::presence::Participant;
use crate::protocol::Envelope;
use crate::queue::FrameSink;
use crate::session::{SessionState, SessionView, SyncEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl FrameSink for WsStream {
    async fn send_frame(&mut self, frame: String) -> SyncResult<()> {
        self.send(WsMessage::text(frame)).await?;
        Ok(())
    }
}

/// Requests from the handle to the session task.
#[derive(Debug)]
enum Command {
    Edit(String),
    SetLanguage(String),
    MoveCursor(Caret),
    Ping,
    View(oneshot::Sender<SessionView>),
}

/// Handle to a running session.
///
/// Dropping the handle tears the session down just like [`SyncClient::shutdown`],
/// without waiting for it.
pub struct SyncClient {
    session_id: String,
    participant: Participant,
    commands: mpsc::UnboundedSender<Command>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Join `session_id` as `participant`, starting from `snapshot`.
    ///
    /// Spawns the session task on the current tokio runtime; the first
    /// connection attempt starts immediately.
    pub fn connect(
        config: &SyncConfig,
        session_id: impl Into<String>,
        participant: Participant,
        snapshot: DocumentSnapshot,
    ) -> SyncResult<Self> {
        let session_id = session_id.into();
        let url = config.session_url(&session_id, &participant)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = SessionTask {
            url,
            session: SessionState::new(session_id.clone(), participant.clone(), snapshot),
            connection: ConnectionManager::new(config.backoff),
            timer: ReconnectTimer::new(),
            events: event_tx,
        };
        info!("Joining session {session_id} as {}", participant.id);
        let task = tokio::spawn(task.run(command_rx));

        Ok(Self {
            session_id,
            participant,
            commands: command_tx,
            event_rx: Some(event_rx),
            task,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Replace the document text with a local edit.
    pub fn edit(&self, text: impl Into<String>) -> SyncResult<()> {
        self.send(Command::Edit(text.into()))
    }

    /// Switch the session language.
    pub fn set_language(&self, language: impl Into<String>) -> SyncResult<()> {
        self.send(Command::SetLanguage(language.into()))
    }

    /// Move the local caret (1-based) and tell peers.
    pub fn move_cursor(&self, line: u32, column: u32) -> SyncResult<()> {
        self.set_caret(Caret::at(line, column))
    }

    /// Move the local caret with an optional selection.
    pub fn set_caret(&self, caret: Caret) -> SyncResult<()> {
        self.send(Command::MoveCursor(caret))
    }

    /// Ping the relay. Dropped silently while offline.
    pub fn send_ping(&self) -> SyncResult<()> {
        self.send(Command::Ping)
    }

    /// Consistent snapshot of the session.
    pub async fn view(&self) -> SyncResult<SessionView> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::View(tx))?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> SyncResult<ConnectionState> {
        Ok(self.view().await?.connection)
    }

    /// Cancel any pending reconnect, close the transport and wait for the
    /// session task to finish.
    pub async fn shutdown(self) -> SyncResult<()> {
        let Self {
            commands,
            task,
            session_id,
            ..
        } = self;
        drop(commands);
        task.await?;
        debug!("Session {session_id} shut down");
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::SessionClosed)
    }
}

/// State owned by the spawned session task.
struct SessionTask {
    url: Url,
    session: SessionState,
    connection: ConnectionManager,
    timer: ReconnectTimer,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl SessionTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut connecting: Option<ConnectFuture<WsStream, WsError>> = None;
        let mut link: Option<WsStream> = None;
        self.begin_connect(&mut connecting);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &mut link).await,
                    None => break,
                },

                result = in_flight(&mut connecting) => {
                    connecting = None;
                    match result {
                        Ok(ws) => {
                            link = Some(ws);
                            self.on_open(&mut link).await;
                        }
                        Err(e) => {
                            self.connection.on_error(&e);
                            self.on_close();
                        }
                    }
                }

                frame = next_frame(&mut link) => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        for event in self.session.dispatch_frame(text.as_str()) {
                            self.emit(event);
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!("Relay closed the connection: {frame:?}");
                        link = None;
                        self.on_close();
                    }
                    Some(Ok(WsMessage::Binary(_))) => debug!("Ignoring binary frame"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.connection.on_error(&e);
                        link = None;
                        self.on_close();
                    }
                    None => {
                        link = None;
                        self.on_close();
                    }
                },

                () = self.timer.fired() => self.begin_connect(&mut connecting),
            }
        }

        self.teardown(link).await;
    }

    async fn handle_command<S: FrameSink + Send>(&mut self, command: Command, link: &mut Option<S>) {
        match command {
            Command::Edit(text) => {
                let envelope = self.session.edit(text);
                self.transmit(envelope, link).await;
            }
            Command::SetLanguage(language) => {
                let envelope = self.session.change_language(language);
                self.transmit(envelope, link).await;
            }
            Command::MoveCursor(caret) => {
                let envelope = self.session.move_cursor(caret);
                self.transmit(envelope, link).await;
            }
            Command::Ping => {
                let Some(ping) = self.connection.submit(self.session.ping()) else {
                    return;
                };
                if let Some(sink) = link.as_mut() {
                    if let Err(e) = send_envelope(sink, &ping).await {
                        debug!("Ping not sent: {e}");
                    }
                }
            }
            Command::View(reply) => {
                let _ = reply.send(self.session.view(&self.connection));
            }
        }
    }

    /// Send now if connected and nothing older is waiting, otherwise queue.
    async fn transmit<S: FrameSink + Send>(&mut self, envelope: Envelope, link: &mut Option<S>) {
        let Some(envelope) = self.connection.submit(envelope) else {
            // Queued behind an unfinished replay: push the backlog out first.
            if self.connection.is_connected() {
                self.replay(link).await;
            }
            return;
        };
        let Some(sink) = link.as_mut() else {
            self.connection.requeue(envelope);
            return;
        };
        if let Err(e) = send_envelope(sink, &envelope).await {
            warn!("Send failed, queueing {}: {e}", envelope.kind());
            self.connection.requeue(envelope);
        }
    }

    async fn on_open<S: FrameSink + Send>(&mut self, link: &mut Option<S>) {
        self.connection.on_open();
        self.timer.disarm();
        self.emit(SyncEvent::Connected);
        self.replay(link).await;
    }

    /// Flush the outbound queue over the live link.
    async fn replay<S: FrameSink + Send>(&mut self, link: &mut Option<S>) {
        let Some(sink) = link.as_mut() else {
            return;
        };
        match self.connection.queue_mut().flush(sink).await {
            Ok(0) => {}
            Ok(count) => {
                info!("Replayed {count} queued message(s)");
                self.emit(SyncEvent::Flushed { count });
            }
            Err(e) => warn!(
                "Replay interrupted with {} message(s) still queued: {e}",
                self.connection.pending()
            ),
        }
    }

    fn on_close(&mut self) {
        if let Some(retry_in) = self.connection.on_close() {
            self.timer.arm(retry_in);
            self.emit(SyncEvent::Disconnected { retry_in });
        }
    }

    fn begin_connect(&mut self, connecting: &mut Option<ConnectFuture<WsStream, WsError>>) {
        if !self.connection.begin_connect() {
            return;
        }
        debug!(
            "Connecting to {} for session {}",
            self.url.host_str().unwrap_or("relay"),
            self.session.session_id()
        );
        let url = self.url.to_string();
        *connecting = Some(Box::pin(async move {
            tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws)
        }));
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    async fn teardown(mut self, link: Option<WsStream>) {
        let timer_cancelled = self.timer.disarm();
        if let Some(mut ws) = link {
            if let Err(e) = ws.close(None).await {
                debug!("Close handshake failed: {e}");
            }
        }
        self.connection.shutdown();
        info!(
            "Left session {} (reconnect cancelled: {timer_cancelled}, {} unsent message(s) dropped)",
            self.session.session_id(),
            self.connection.pending()
        );
    }
}

async fn send_envelope<S: FrameSink>(sink: &mut S, envelope: &Envelope) -> SyncResult<()> {
    let frame = envelope.encode()?;
    sink.send_frame(frame).await
}

/// Pends forever when no attempt is in flight.
async fn in_flight(connecting: &mut Option<ConnectFuture<WsStream, WsError>>) -> Result<WsStream, WsError> {
    match connecting.as_mut() {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

/// Pends forever when there is no live link.
async fn next_frame(link: &mut Option<WsStream>) -> Option<Result<WsMessage, WsError>> {
    match link.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}
