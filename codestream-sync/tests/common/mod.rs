//! In-process session relay and client helpers shared by integration tests.
//!
//! The relay behaves like the production one: on registration it pushes the
//! session's current code and language to the newcomer, announces the
//! newcomer to everyone else, fans every edit/cursor/language message out to
//! the other members of the session, answers `ping` with `pong`, and
//! announces `user_leave` when a member goes away cleanly.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use codestream_sync::{
    BackoffConfig, CodeChange, DocumentSnapshot, Envelope, LanguageChange, Message, Participant,
    SyncClient, SyncConfig, SyncEvent,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as Frame;

#[derive(Clone)]
struct Relayed {
    from: u64,
    frame: String,
}

struct Room {
    code: String,
    language: String,
    members: usize,
    tx: broadcast::Sender<Relayed>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            code: String::new(),
            language: "javascript".into(),
            members: 0,
            tx,
        }
    }
}

#[derive(Clone, Default)]
struct RelayState {
    rooms: Arc<Mutex<HashMap<String, Room>>>,
    blocked: Arc<Mutex<HashSet<String>>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayState {
    fn register(&self, session: &str) -> (broadcast::Receiver<Relayed>, String, String) {
        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms.entry(session.to_owned()).or_insert_with(Room::new);
        room.members += 1;
        (room.tx.subscribe(), room.code.clone(), room.language.clone())
    }

    fn unregister(&self, session: &str) {
        if let Some(room) = self.rooms.lock().unwrap().get_mut(session) {
            room.members = room.members.saturating_sub(1);
        }
    }

    fn publish(&self, session: &str, from: u64, frame: String) {
        if let Some(room) = self.rooms.lock().unwrap().get(session) {
            let _ = room.tx.send(Relayed { from, frame });
        }
    }

    fn record(&self, session: &str, message: &Message) {
        let mut rooms = self.rooms.lock().unwrap();
        let Some(room) = rooms.get_mut(session) else {
            return;
        };
        match message {
            Message::CodeChange(change) => room.code = change.code.clone(),
            Message::LanguageChange(change) => room.language = change.language.clone(),
            _ => {}
        }
    }
}

/// A relay listening on a random loopback port.
pub struct TestRelay {
    addr: SocketAddr,
    state: RelayState,
    accept_task: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = RelayState::default();

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_state = accept_state.clone();
                let handle = tokio::spawn(serve_connection(stream, conn_state));
                accept_state.connections.lock().unwrap().push(handle);
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Refuse the handshake for `user_id` until unblocked.
    pub fn block(&self, user_id: &str) {
        self.state.blocked.lock().unwrap().insert(user_id.to_owned());
    }

    pub fn unblock(&self, user_id: &str) {
        self.state.blocked.lock().unwrap().remove(user_id);
    }

    /// Current relay-side text of a session.
    pub fn code(&self, session: &str) -> Option<String> {
        self.state
            .rooms
            .lock()
            .unwrap()
            .get(session)
            .map(|room| room.code.clone())
    }

    pub fn members(&self, session: &str) -> usize {
        self.state
            .rooms
            .lock()
            .unwrap()
            .get(session)
            .map_or(0, |room| room.members)
    }

    /// Wait until `n` members are registered in `session`.
    pub async fn wait_for_members(&self, session: &str, n: usize) {
        let reached = timeout(Duration::from_secs(5), async {
            while self.members(session) != n {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "session {session} never reached {n} members (has {})",
            self.members(session)
        );
    }

    /// Drop every live connection without a close handshake.
    pub fn kill_connections(&self) {
        for handle in self.state.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
        for room in self.state.rooms.lock().unwrap().values_mut() {
            room.members = 0;
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kill_connections();
    }
}

async fn serve_connection(stream: TcpStream, state: RelayState) {
    let blocked = state.blocked.clone();
    let mut params: HashMap<String, String> = HashMap::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let query = request.uri().query().unwrap_or_default();
        let parsed: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let user_id = parsed.get("user_id").cloned().unwrap_or_default();
        if blocked.lock().unwrap().contains(&user_id) {
            let mut reject = ErrorResponse::new(Some("blocked".to_owned()));
            *reject.status_mut() = StatusCode::FORBIDDEN;
            return Err(reject);
        }
        params = parsed;
        Ok(response)
    };

    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let param = |key: &str| params.get(key).cloned().unwrap_or_default();
    let session = param("session");
    let user = Participant {
        id: param("user_id"),
        name: param("user_name"),
        email: param("user_email"),
        color: param("user_color"),
        image_url: param("user_image"),
    };
    let conn_id = state.next_id.fetch_add(1, Ordering::SeqCst);

    let (mut rx, code, language) = state.register(&session);
    let (mut sink, mut source) = ws.split();

    let push = [
        Envelope::new(
            session.clone(),
            None,
            Message::CodeChange(CodeChange {
                code,
                timestamp: None,
            }),
        ),
        Envelope::new(
            session.clone(),
            None,
            Message::LanguageChange(LanguageChange { language }),
        ),
    ];
    // Coalesced into one newline-separated frame, as the production relay
    // does with whatever is waiting in a connection's send buffer.
    let push = push
        .iter()
        .map(|envelope| envelope.encode().unwrap())
        .collect::<Vec<_>>()
        .join("\n");
    if sink.send(Frame::text(push)).await.is_err() {
        state.unregister(&session);
        return;
    }
    state.publish(
        &session,
        conn_id,
        Envelope::user_join(session.clone(), user.clone()).encode().unwrap(),
    );

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    let Ok(envelope) = Envelope::decode(text.as_str()) else {
                        continue;
                    };
                    match envelope.message {
                        Message::Ping => {
                            let pong = Envelope::pong(session.clone()).encode().unwrap();
                            if sink.send(Frame::text(pong)).await.is_err() {
                                break;
                            }
                        }
                        Message::CodeChange(_) | Message::LanguageChange(_) | Message::CursorMove(_) => {
                            state.record(&session, &envelope.message);
                            state.publish(&session, conn_id, text.as_str().to_owned());
                        }
                        _ => {}
                    }
                }
                Some(Ok(Frame::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            relayed = rx.recv() => match relayed {
                Ok(relayed) if relayed.from == conn_id => {}
                Ok(relayed) => {
                    if sink.send(Frame::text(relayed.frame)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    state.unregister(&session);
    state.publish(
        &session,
        conn_id,
        Envelope::user_leave(session.clone(), user.id).encode().unwrap(),
    );
}

// ── Client helpers ───────────────────────────────────────────────

pub fn test_config(relay: &TestRelay) -> SyncConfig {
    SyncConfig::default()
        .with_server_url(relay.ws_url())
        .with_backoff(BackoffConfig::new(
            Duration::from_millis(20),
            Duration::from_millis(200),
        ))
}

/// Join `session` as a fresh participant starting from an empty document.
pub fn join(
    relay: &TestRelay,
    session: &str,
    user_id: &str,
    name: &str,
) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    let mut client = SyncClient::connect(
        &test_config(relay),
        session,
        Participant::new(user_id, name),
        DocumentSnapshot::new("", "javascript"),
    )
    .unwrap();
    let events = client.take_event_rx().unwrap();
    (client, events)
}

pub async fn next_event(events: &mut UnboundedReceiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches.
pub async fn wait_for(
    events: &mut UnboundedReceiver<SyncEvent>,
    mut matches: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Everything that arrives within `window`.
pub async fn collect_for(
    events: &mut UnboundedReceiver<SyncEvent>,
    window: Duration,
) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout(window, events.recv()).await {
        seen.push(event);
    }
    seen
}

pub async fn connected(events: &mut UnboundedReceiver<SyncEvent>) {
    wait_for(events, |e| matches!(e, SyncEvent::Connected)).await;
}
