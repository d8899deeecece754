//! Bounded per-session outbound event queue.
//!
//! Producers never block: when the queue is full the oldest event is
//! discarded to make room. A single consumer drains it into the socket.

use filebro_protocol::ServerEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    events: VecDeque<ServerEvent>,
    closed: bool,
    dropped: u64,
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue `event`, evicting the oldest entry when full.
    ///
    /// Returns `false` once the queue is closed.
    pub fn push(&self, event: ServerEvent) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            if state.events.len() >= self.capacity {
                state.events.pop_front();
                state.dropped += 1;
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    /// Next event, or `None` after [`close`](Self::close) once drained.
    pub async fn pop(&self) -> Option<ServerEvent> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting events and discard anything still queued.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.events.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}
