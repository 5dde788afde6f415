//! Outbound queue for messages produced while the transport is down.
//!
//! Messages are replayed strictly in production order. A message leaves
//! the queue only after the transport accepted it, so an interrupted flush
//! resumes from the first unsent message on the next connection.

use std::collections::VecDeque;
use std::future::Future;

use log::warn;

use crate::error::SyncResult;
use crate::protocol::Envelope;

/// Anything that can carry one encoded text frame.
pub trait FrameSink {
    /// Hand one frame to the transport.
    fn send_frame(&mut self, frame: String) -> impl Future<Output = SyncResult<()>> + Send;
}

/// FIFO of envelopes awaiting a connection.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: VecDeque<Envelope>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message for later replay.
    pub fn enqueue(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Oldest queued message.
    pub fn peek(&self) -> Option<&Envelope> {
        self.queue.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.queue.iter()
    }

    /// Drop everything without sending.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Replay queued messages into `sink` in order.
    ///
    /// Stops at the first send failure and leaves that message at the head.
    /// Returns the number of messages delivered.
    pub async fn flush<S: FrameSink + Send>(&mut self, sink: &mut S) -> SyncResult<usize> {
        let mut sent = 0;
        while let Some(envelope) = self.queue.front() {
            let frame = match envelope.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping unencodable {} message: {e}", envelope.kind());
                    self.queue.pop_front();
                    continue;
                }
            };
            sink.send_frame(frame).await?;
            self.queue.pop_front();
            sent += 1;
        }
        Ok(sent)
    }
}
