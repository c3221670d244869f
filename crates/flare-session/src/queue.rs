//! Bounded per-attachment outbound queues.
//!
//! Single producer (the session coordinator), single consumer (the
//! attachment's writer task). The producer side never blocks: a full queue
//! evicts its oldest droppable frame, because location updates are
//! self-correcting: the next fix supersedes whatever was lost. Lifecycle
//! frames (`participant_joined`, `participant_left`, `session_ended`) are
//! priority class and are never evicted; a queue that cannot place one marks
//! the attachment unhealthy.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use flare_core::ServerFrame;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The frame was accepted without loss.
    Delivered,
    /// The frame was accepted after evicting the oldest droppable frame.
    Evicted,
    /// The queue is saturated with priority frames; the attachment is not
    /// draining and should be detached.
    Unhealthy,
    /// The consumer is gone; the push was a no-op.
    Closed,
}

#[derive(Debug)]
struct State {
    frames: VecDeque<ServerFrame>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a bounded queue pair with the given capacity in frames.
#[must_use]
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            frames: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        notify: Notify::new(),
        capacity,
    });
    (
        OutboundSender {
            shared: Arc::clone(&shared),
        },
        OutboundReceiver { shared },
    )
}

/// Producer half, held by the coordinator through the registry.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    shared: Arc<Shared>,
}

impl OutboundSender {
    /// Enqueue a frame without blocking.
    ///
    /// When the queue is full, the oldest non-priority frame is evicted to
    /// make room. If every queued frame is priority class the queue is not
    /// being drained at all and the push reports [`Enqueue::Unhealthy`].
    pub fn try_push(&self, frame: ServerFrame) -> Enqueue {
        let mut state = self.shared.lock();
        if state.closed {
            return Enqueue::Closed;
        }
        if state.frames.len() < self.shared.capacity {
            state.frames.push_back(frame);
            drop(state);
            self.shared.notify.notify_one();
            return Enqueue::Delivered;
        }
        if let Some(idx) = state.frames.iter().position(|f| !f.is_priority()) {
            state.frames.remove(idx);
            state.frames.push_back(frame);
            drop(state);
            self.shared.notify.notify_one();
            return Enqueue::Evicted;
        }
        Enqueue::Unhealthy
    }

    /// Stop accepting frames. Already-queued frames remain readable so the
    /// consumer can flush, then sees end-of-queue.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Whether the queue has been closed from either side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of frames currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().frames.len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.lock().frames.is_empty()
    }
}

/// Consumer half, owned by the attachment's writer task.
#[derive(Debug)]
pub struct OutboundReceiver {
    shared: Arc<Shared>,
}

impl OutboundReceiver {
    /// Receive the next frame, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        loop {
            {
                let mut state = self.shared.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Receive the next frame if one is immediately available.
    pub fn try_recv(&mut self) -> Option<ServerFrame> {
        self.shared.lock().frames.pop_front()
    }

    /// Close the queue from the consumer side; subsequent pushes are no-ops.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        // A dropped writer must not let the producer queue frames forever.
        self.close();
    }
}
