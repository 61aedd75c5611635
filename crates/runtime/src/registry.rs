//! The processor registry: named, prioritized processors keyed by event
//! type.
//!
//! Dispatch picks the first processor (highest priority first) whose
//! `should_process` accepts the event. Built-ins register at priority 0;
//! callers override by registering the same event type higher.

use std::collections::HashMap;
use std::sync::Arc;

use cf_domain::error::Result;
use cf_domain::event::{Event, EventDraft, EventType};

use crate::cancel::CancelSet;
use crate::state::RuntimeDeps;
use crate::stream::EventFanout;

/// Per-dispatch context handed to processors.
pub struct ProcessorContext {
    pub deps: Arc<RuntimeDeps>,
    /// Live stream to the run's subscribers.
    pub sink: EventFanout,
    pub cancel: CancelSet,
    pub thread_id: String,
    pub namespace: Option<String>,
}

impl ProcessorContext {
    pub fn namespace_or_default(&self) -> String {
        self.namespace.clone().unwrap_or_else(|| "global:default".into())
    }
}

/// A processor consumes one event and may produce follow-up events.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn event_type(&self) -> EventType;

    /// Higher wins; built-ins are 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether this processor wants the event. The first accepting
    /// processor (in priority order) gets it.
    async fn should_process(&self, event: &Event, ctx: &ProcessorContext) -> bool {
        let _ = (event, ctx);
        true
    }

    /// Handle the event; returned drafts are enqueued atomically with
    /// the event's acknowledgement.
    async fn process(&self, event: &Event, ctx: &ProcessorContext) -> Result<Vec<EventDraft>>;
}

#[derive(Default)]
pub struct ProcessorRegistry {
    by_type: HashMap<EventType, Vec<Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor; the per-type list stays sorted by
    /// descending priority (stable for equal priorities).
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        let list = self.by_type.entry(processor.event_type()).or_default();
        list.push(processor);
        list.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    /// The first processor accepting this event, in priority order.
    pub async fn select(
        &self,
        event: &Event,
        ctx: &ProcessorContext,
    ) -> Option<Arc<dyn Processor>> {
        let list = self.by_type.get(&event.event_type())?;
        for processor in list {
            if processor.should_process(event, ctx).await {
                return Some(processor.clone());
            }
        }
        None
    }

    pub fn registered_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.by_type.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}
