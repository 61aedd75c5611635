//! The run event stream: a bounded multi-producer/single-consumer queue
//! of [`StreamEvent`]s with token-aware overflow.
//!
//! When the buffer is full, the oldest *token* event is dropped to make
//! room; non-token events are never dropped (the buffer grows past its
//! capacity for them instead). Producers never block, so a slow consumer
//! cannot back-pressure the worker loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use cf_domain::stream::StreamEvent;

struct Shared {
    queue: Mutex<VecDeque<StreamEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// Producer half: the worker and processors push through this.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<Shared>,
}

/// Consumer half, held by the run handle.
pub struct EventStream {
    shared: Arc<Shared>,
}

/// Create a connected sink/stream pair.
pub fn channel(capacity: usize) -> (EventSink, EventStream) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        capacity: capacity.max(1),
    });
    (
        EventSink {
            shared: shared.clone(),
        },
        EventStream { shared },
    )
}

impl EventSink {
    /// Push an event. Never blocks; returns `false` when the stream is
    /// closed (consumer gone) and the event was discarded.
    pub fn emit(&self, event: StreamEvent) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity && event.is_token() {
                // Drop the oldest token to bound memory; non-token
                // events may overflow the capacity instead.
                if let Some(pos) = queue.iter().position(StreamEvent::is_token) {
                    queue.remove(pos);
                } else {
                    // Buffer full of lossless events; this token loses.
                    return true;
                }
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
        true
    }

    /// Signal end-of-stream. Buffered events remain readable.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl EventStream {
    /// Receive the next event; `None` once the stream is closed and
    /// drained.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.shared.queue.lock().pop_front() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // Re-check: close may have raced a final push.
                return self.shared.queue.lock().pop_front();
            }
            notified.await;
        }
    }

    /// Drain whatever is buffered right now without waiting.
    pub fn drain_ready(&mut self) -> Vec<StreamEvent> {
        let mut queue = self.shared.queue.lock();
        queue.drain(..).collect()
    }

    /// Close from the consumer side (cancellation).
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fan-out over every subscriber attached to a worker. Processors emit
/// through this; closed subscribers are pruned on the fly.
#[derive(Clone, Default)]
pub struct EventFanout {
    sinks: Arc<Mutex<Vec<EventSink>>>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sink: EventSink) {
        self.sinks.lock().push(sink);
    }

    pub fn emit(&self, event: StreamEvent) {
        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| !sink.is_closed());
        match sinks.len() {
            0 => {}
            1 => {
                sinks[0].emit(event);
            }
            _ => {
                for sink in sinks.iter() {
                    sink.emit(event.clone());
                }
            }
        }
    }

    pub fn close_all(&self) {
        for sink in self.sinks.lock().drain(..) {
            sink.close();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().len()
    }
}
