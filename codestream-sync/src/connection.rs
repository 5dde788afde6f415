//! Connection lifecycle: state machine, backoff and reconnect timer.
//!
//! ```text
//!              begin_connect()              on_open()
//! Disconnected ──────────────► Connecting ─────────────► Connected
//!      ▲                           │                         │
//!      │      on_close() → delay   │                         │
//!      └───────────────────────────┴─────────────────────────┘
//!                   timer fires → begin_connect()
//! ```
//!
//! [`ConnectionManager`] performs no I/O. The session task owns the socket
//! and the timer and reports transport events here; the manager decides
//! whether a message goes out now or waits in the [`OutboundQueue`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Sleep;

use crate::config::BackoffConfig;
use crate::protocol::Envelope;
use crate::queue::OutboundQueue;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no attempt in flight.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Transport open; messages go out immediately.
    Connected,
}

/// Exponential backoff counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay for the next retry. Advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Sans-IO connection state machine plus the outbound queue.
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    backoff: Backoff,
    queue: OutboundQueue,
}

impl ConnectionManager {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(backoff),
            queue: OutboundQueue::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    /// Messages waiting for a connection.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut OutboundQueue {
        &mut self.queue
    }

    /// Start an attempt. Returns `false` if one is in flight or the link is up.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            debug!("Connect requested while {:?}; ignoring", self.state);
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// The transport opened. Resets backoff; the caller flushes next.
    pub fn on_open(&mut self) {
        info!(
            "Connected after {} failed attempt(s), {} queued message(s)",
            self.backoff.attempts(),
            self.queue.len()
        );
        self.state = ConnectionState::Connected;
        self.backoff.reset();
    }

    /// Transport error. Only logged; the close that follows drives recovery.
    pub fn on_error(&self, error: &dyn std::fmt::Display) {
        warn!("Transport error: {error}");
    }

    /// The transport closed or an attempt failed.
    ///
    /// Returns the delay before the next attempt, or `None` if already
    /// disconnected (no second timer may be armed).
    pub fn on_close(&mut self) -> Option<Duration> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        let delay = self.backoff.next_delay();
        info!(
            "Disconnected; retry #{} in {}ms",
            self.backoff.attempts(),
            delay.as_millis()
        );
        Some(delay)
    }

    /// Route an outbound message.
    ///
    /// Returns the envelope back when it should be sent now. Otherwise it
    /// has been queued, or dropped if it is keepalive traffic.
    ///
    /// While connected, a non-empty queue means a replay was cut short; the
    /// message joins the tail so it cannot overtake older ones, and the
    /// caller should flush.
    pub fn submit(&mut self, envelope: Envelope) -> Option<Envelope> {
        let transient = envelope.message.is_transient();
        if self.is_connected() && (transient || self.queue.is_empty()) {
            return Some(envelope);
        }
        if transient {
            debug!("Offline; dropping {}", envelope.kind());
            return None;
        }
        if self.is_connected() {
            debug!(
                "Queueing {} behind {} unsent message(s)",
                envelope.kind(),
                self.queue.len()
            );
        } else {
            debug!("Offline; queueing {} message", envelope.kind());
        }
        self.queue.enqueue(envelope);
        None
    }

    /// Queue a message whose immediate send failed.
    pub fn requeue(&mut self, envelope: Envelope) {
        self.queue.enqueue(envelope);
    }

    /// Final teardown. Queued messages are kept but never sent.
    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

/// At most one pending reconnect.
#[derive(Default)]
pub struct ReconnectTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending deadline.
    pub fn arm(&mut self, delay: Duration) {
        self.sleep = Some(Box::pin(tokio::time::sleep(delay)));
    }

    /// Cancel the pending deadline. Returns whether one was armed.
    pub fn disarm(&mut self) -> bool {
        self.sleep.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves when the armed deadline passes; pends forever when disarmed.
    ///
    /// Cancel-safe: dropping the future keeps the deadline armed.
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending::<()>().await,
        }
        self.sleep = None;
    }
}

impl std::fmt::Debug for ReconnectTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectTimer")
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Boxed in-flight connect, so the session loop can hold any transport.
pub type ConnectFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
