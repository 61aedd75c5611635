//! In-process worker registry.
//!
//! One worker task per `(thread_id, namespace)` in this process; the
//! database lease handles exclusivity across processes. A `run()` that
//! lands on a thread with an active worker joins its stream instead of
//! spawning a second task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cancel::{CancelSet, CancelToken};
use crate::registry::ProcessorRegistry;
use crate::state::RuntimeDeps;
use crate::stream::{EventFanout, EventSink};
use crate::worker;

pub(crate) type WorkerKey = (String, Option<String>);

/// `None` while running; `Some(result)` once the worker drained or
/// failed fatally.
pub(crate) type DoneState = Option<Result<(), String>>;

struct ActiveWorker {
    worker_token: u64,
    cancel: CancelSet,
    subscribers: EventFanout,
    done: watch::Receiver<DoneState>,
}

/// What a run gets back from [`WorkerRegistry::attach`].
pub(crate) struct Attachment {
    pub cancel: CancelSet,
    pub done: watch::Receiver<DoneState>,
}

impl Attachment {
    pub fn finished(&self) -> bool {
        self.done.borrow().is_some()
    }
}

#[derive(Default)]
pub(crate) struct WorkerRegistry {
    active: Mutex<HashMap<WorkerKey, ActiveWorker>>,
    next_token: Mutex<u64>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the thread's worker, spawning one if none is running.
    ///
    /// The sink starts receiving events immediately; `signal` (when
    /// present) is added to the worker's composite cancel.
    pub fn attach(
        self: &Arc<Self>,
        key: WorkerKey,
        deps: Arc<RuntimeDeps>,
        registry: Arc<ProcessorRegistry>,
        sink: EventSink,
        signal: Option<CancelToken>,
    ) -> Attachment {
        let mut active = self.active.lock();

        if let Some(existing) = active.get(&key) {
            if existing.done.borrow().is_none() {
                existing.subscribers.add(sink);
                if let Some(signal) = signal {
                    existing.cancel.add_signal(signal);
                }
                return Attachment {
                    cancel: existing.cancel.clone(),
                    done: existing.done.clone(),
                };
            }
        }

        // Spawn a fresh worker.
        let worker_token = {
            let mut t = self.next_token.lock();
            *t += 1;
            *t
        };
        let cancel = CancelSet::new();
        if let Some(signal) = signal {
            cancel.add_signal(signal);
        }
        let subscribers = EventFanout::new();
        subscribers.add(sink);
        let (done_tx, done_rx) = watch::channel::<DoneState>(None);

        active.insert(
            key.clone(),
            ActiveWorker {
                worker_token,
                cancel: cancel.clone(),
                subscribers: subscribers.clone(),
                done: done_rx.clone(),
            },
        );

        let registry_ref = self.clone();
        let worker_cancel = cancel.clone();
        let worker_subs = subscribers.clone();
        tokio::spawn(async move {
            let ctx = worker::WorkerContext {
                deps,
                processors: registry,
                workers: registry_ref,
                worker_token,
                thread_id: key.0.clone(),
                namespace: key.1.clone(),
                worker_id: cf_domain::new_opaque_id(),
                cancel: worker_cancel,
                subscribers: worker_subs.clone(),
            };
            let key_for_cleanup = key;
            let workers = ctx.workers.clone();
            let result = worker::run_worker(ctx).await;
            // Normally removed at DRAINING; crash paths land here.
            workers.remove_if_current(&key_for_cleanup, worker_token);
            let _ = done_tx.send(Some(result));
            worker_subs.close_all();
        });

        Attachment {
            cancel,
            done: done_rx,
        }
    }

    /// Remove the registry entry if it still belongs to this worker.
    /// Later workers for the same key are left alone.
    pub fn remove_if_current(&self, key: &WorkerKey, worker_token: u64) {
        let mut active = self.active.lock();
        if active
            .get(key)
            .is_some_and(|w| w.worker_token == worker_token)
        {
            active.remove(key);
        }
    }

    /// Cancel every active worker (shutdown).
    pub fn cancel_all(&self) -> Vec<watch::Receiver<DoneState>> {
        let active = self.active.lock();
        active
            .values()
            .map(|w| {
                w.cancel.cancel();
                w.done.clone()
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
