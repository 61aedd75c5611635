//! The per-thread worker: lease, dequeue, dispatch, drain.
//!
//! State machine: IDLE → LEASING → RUNNING → DRAINING → RELEASED.
//! Leasing polls until the lease is acquired (covers stealing an
//! expired lease from a crashed worker). Running dispatches one event
//! at a time; produced events commit atomically with the ack. Draining
//! de-registers first, then clears any events that raced the final
//! empty dequeue, then releases the lease.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use cf_domain::error::{Error, ErrorCategory};
use cf_domain::event::{Event, EventPayload};
use cf_domain::stream::StreamEvent;

use crate::cancel::CancelSet;
use crate::registry::{ProcessorContext, ProcessorRegistry};
use crate::state::RuntimeDeps;
use crate::stream::EventFanout;
use crate::workers::{WorkerKey, WorkerRegistry};

pub(crate) struct WorkerContext {
    pub deps: Arc<RuntimeDeps>,
    pub processors: Arc<ProcessorRegistry>,
    pub workers: Arc<WorkerRegistry>,
    pub worker_token: u64,
    pub thread_id: String,
    pub namespace: Option<String>,
    pub worker_id: String,
    pub cancel: CancelSet,
    pub subscribers: EventFanout,
}

pub(crate) async fn run_worker(ctx: WorkerContext) -> Result<(), String> {
    let span = tracing::info_span!(
        "thread_worker",
        thread_id = %ctx.thread_id,
        worker_id = %ctx.worker_id,
    );
    run_worker_inner(ctx).instrument(span).await
}

async fn run_worker_inner(ctx: WorkerContext) -> Result<(), String> {
    let store = ctx.deps.store.clone();
    let lease_ttl = ctx.deps.config.lease.ttl();
    let poll = Duration::from_millis(ctx.deps.config.queue.poll_interval_ms);
    let ns = ctx.namespace.as_deref();

    // ── LEASING: poll until the lease is ours ─────────────────────────
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        match store
            .acquire_lease(&ctx.thread_id, ns, &ctx.worker_id, lease_ttl)
            .await
        {
            Ok(true) => break,
            Ok(false) => tokio::time::sleep(poll).await,
            Err(e) => return Err(format!("lease acquisition failed: {e}")),
        }
    }
    tracing::debug!("lease acquired");

    // ── Heartbeat: renew at ttl/3; a rejected renewal means another
    //    worker stole the lease after expiry — hard stop. ─────────────
    let heartbeat = {
        let store = store.clone();
        let thread_id = ctx.thread_id.clone();
        let worker_id = ctx.worker_id.clone();
        let cancel = ctx.cancel.clone();
        let interval = ctx.deps.config.lease.renew_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if cancel.is_cancelled() {
                    return;
                }
                match store.renew_lease(&thread_id, &worker_id, lease_ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(%thread_id, %worker_id, "lease stolen; stopping worker");
                        cancel.cancel();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "lease renewal error");
                    }
                }
            }
        })
    };

    // ── RUNNING ───────────────────────────────────────────────────────
    let mut fatal: Option<String> = None;
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if let Err(e) = store.expire_pending(&ctx.thread_id, ns).await {
            tracing::warn!(error = %e, "expire sweep failed");
        }
        match store.dequeue(&ctx.thread_id, ns).await {
            Ok(Some(event)) => {
                if let Err(stop) = dispatch_one(&ctx, &event).await {
                    fatal = stop;
                    break;
                }
            }
            Ok(None) => break, // queue empty → DRAINING
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "transient dequeue failure");
                tokio::time::sleep(poll).await;
            }
            Err(e) => {
                fatal = Some(format!("dequeue failed: {e}"));
                break;
            }
        }
    }

    // ── DRAINING ──────────────────────────────────────────────────────
    // De-register first so new runs spawn a fresh worker, then clear
    // anything enqueued between our last empty dequeue and now.
    let key: WorkerKey = (ctx.thread_id.clone(), ctx.namespace.clone());
    ctx.workers.remove_if_current(&key, ctx.worker_token);

    if fatal.is_none() && !ctx.cancel.is_cancelled() {
        loop {
            match store.dequeue(&ctx.thread_id, ns).await {
                Ok(Some(event)) => {
                    if let Err(stop) = dispatch_one(&ctx, &event).await {
                        fatal = stop;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "drain dequeue failed");
                    break;
                }
            }
        }
    }

    // ── RELEASED ──────────────────────────────────────────────────────
    heartbeat.abort();
    if let Err(e) = store.release_lease(&ctx.thread_id, &ctx.worker_id).await {
        tracing::warn!(error = %e, "lease release failed");
    }
    tracing::debug!("worker released");

    match fatal {
        Some(message) => Err(message),
        None => Ok(()),
    }
}

/// Dispatch one event. `Err(Some(msg))` stops the worker fatally;
/// `Err(None)` stops it quietly (cancellation). Processor failures are
/// recorded on the event and the loop continues.
async fn dispatch_one(ctx: &WorkerContext, event: &Event) -> Result<(), Option<String>> {
    let store = &ctx.deps.store;
    let ns = ctx.namespace.as_deref();

    ctx.subscribers.emit(stream_event_for(event));

    let proc_ctx = ProcessorContext {
        deps: ctx.deps.clone(),
        sink: ctx.subscribers.clone(),
        cancel: ctx.cancel.clone(),
        thread_id: ctx.thread_id.clone(),
        namespace: ctx.namespace.clone(),
    };

    let Some(processor) = ctx.processors.select(event, &proc_ctx).await else {
        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type(),
            "no processor accepts this event"
        );
        store.ack(&event.id).await.map_err(|e| Some(e.to_string()))?;
        return Ok(());
    };

    let span = tracing::info_span!(
        "process_event",
        event_id = %event.id,
        event_type = %event.event_type(),
        processor = processor.name(),
    );
    let result = processor.process(event, &proc_ctx).instrument(span).await;

    match result {
        Ok(produced) => {
            let produced_events = store
                .complete_and_enqueue(&event.id, &ctx.thread_id, ns, produced)
                .await
                .map_err(|e| Some(format!("ack failed: {e}")))?;
            tracing::debug!(
                event_id = %event.id,
                produced = produced_events.len(),
                "event completed"
            );
            Ok(())
        }
        Err(Error::Cancelled) => {
            // Leave the event in `processing`; the next lease holder
            // reopens it. Stop quietly.
            tracing::debug!(event_id = %event.id, "event cancelled mid-dispatch");
            Err(None)
        }
        Err(e) => {
            let category = e.category();
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                category = category.as_str(),
                "processor failed; event marked failed"
            );
            store
                .fail(&event.id, &e.to_string(), category.as_str())
                .await
                .map_err(|e| Some(format!("failure record failed: {e}")))?;
            if category == ErrorCategory::Fatal {
                return Err(Some(format!("fatal processor error: {e}")));
            }
            Ok(())
        }
    }
}

/// Map a queue event to the stream notification emitted at dispatch.
fn stream_event_for(event: &Event) -> StreamEvent {
    match &event.payload {
        EventPayload::NewMessage(message) => StreamEvent::NewMessage {
            event_id: event.id.clone(),
            thread_id: event.thread_id.clone(),
            message: message.clone(),
            metadata: event.metadata.clone(),
        },
        EventPayload::LlmCall(payload) => StreamEvent::LlmCall {
            event_id: event.id.clone(),
            thread_id: event.thread_id.clone(),
            payload: payload.clone(),
        },
        EventPayload::ToolCall(payload) => StreamEvent::ToolCall {
            event_id: event.id.clone(),
            thread_id: event.thread_id.clone(),
            call: payload.call.clone(),
            batch_id: payload.batch_id.clone(),
            batch_size: payload.batch_size,
            batch_index: payload.batch_index,
        },
        EventPayload::EntityExtract(_) => StreamEvent::EntityExtract {
            event_id: event.id.clone(),
            thread_id: event.thread_id.clone(),
        },
        EventPayload::RagIngest(_) => StreamEvent::RagIngest {
            event_id: event.id.clone(),
            thread_id: event.thread_id.clone(),
        },
    }
}
