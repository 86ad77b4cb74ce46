//! Per-connection outbound queue.
//!
//! Producers (local broadcast, the bridge listener, the heartbeat reaper)
//! push without blocking; the connection's writer task drains the queue and
//! waits on a [`Notify`] when it is empty.
//!
//! Overflow policy at capacity:
//!
//! 1. drop the oldest droppable envelope (typing, presence) and queue the new one
//! 2. otherwise drop the new envelope if it is droppable
//! 3. otherwise close the connection with `ResourceExhausted`

#![allow(clippy::disallowed_types, reason = "Queue lock is never held across an await")]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use switchyard_proto::{CloseCode, Envelope};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Envelopes a connection may have queued.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Result of [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued with room to spare
    Queued,
    /// Queued after discarding an older droppable envelope
    DroppedOldest,
    /// Queue full; the new droppable envelope was discarded
    DroppedNew,
    /// Queue full of critical envelopes; the connection is being closed
    Overflowed,
    /// The connection is already closing
    Closed,
}

/// Next thing the writer task should send.
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    /// A queued envelope
    Envelope(Arc<Envelope>),
    /// A heartbeat ping
    Ping,
    /// Close the socket with this code and stop
    Close(CloseCode),
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<Envelope>>,
    ping: bool,
    close: Option<CloseCode>,
    dropped: u64,
}

/// Bounded queue between producers and one writer task.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    closing: CancellationToken,
}

impl OutboundQueue {
    /// Empty queue holding at most `capacity` envelopes (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState { items: VecDeque::with_capacity(capacity), ..QueueState::default() }),
            notify: Notify::new(),
            closing: CancellationToken::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking, applying the overflow policy.
    pub fn push(&self, envelope: Arc<Envelope>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.close.is_some() {
                return PushOutcome::Closed;
            }

            if state.items.len() < self.capacity {
                state.items.push_back(envelope);
                PushOutcome::Queued
            } else if let Some(pos) = state.items.iter().position(|e| e.kind().is_droppable()) {
                state.items.remove(pos);
                state.items.push_back(envelope);
                state.dropped += 1;
                PushOutcome::DroppedOldest
            } else if envelope.kind().is_droppable() {
                state.dropped += 1;
                return PushOutcome::DroppedNew;
            } else {
                state.dropped += state.items.len() as u64 + 1;
                state.items.clear();
                state.close = Some(CloseCode::ResourceExhausted);
                PushOutcome::Overflowed
            }
        };

        if outcome == PushOutcome::Overflowed {
            self.closing.cancel();
        }
        self.notify.notify_one();
        outcome
    }

    /// Ask the writer to send a heartbeat ping.
    pub fn request_ping(&self) {
        {
            let mut state = self.lock();
            if state.close.is_some() {
                return;
            }
            state.ping = true;
        }
        self.notify.notify_one();
    }

    /// Close after the envelopes already queued are sent.
    ///
    /// The first close code wins.
    pub fn close(&self, code: CloseCode) {
        {
            let mut state = self.lock();
            if state.close.is_some() {
                return;
            }
            state.close = Some(code);
        }
        self.closing.cancel();
        self.notify.notify_one();
    }

    /// Wait for the next item to send.
    pub async fn next(&self) -> Next {
        loop {
            {
                let mut state = self.lock();
                if let Some(envelope) = state.items.pop_front() {
                    return Next::Envelope(envelope);
                }
                if state.ping {
                    state.ping = false;
                    return Next::Ping;
                }
                if let Some(code) = state.close {
                    return Next::Close(code);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Cancelled once the queue starts closing.
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Close code, if closing.
    pub fn close_code(&self) -> Option<CloseCode> {
        self.lock().close
    }

    /// Whether the queue is closing.
    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Envelopes discarded by the overflow policy.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}
