//! Built-in event processors.
//!
//! Registration order is irrelevant (dispatch is by event type +
//! priority); all built-ins run at priority 0 so callers can shadow any
//! of them with a higher-priority processor for the same event type.

pub mod chunk;
pub mod entity;
pub mod history;
pub mod llm;
pub mod message;
pub mod rag;
pub mod tool;

use std::sync::Arc;

use crate::registry::ProcessorRegistry;

pub fn register_builtins(registry: &mut ProcessorRegistry) {
    registry.register(Arc::new(message::MessageProcessor));
    registry.register(Arc::new(llm::LlmProcessor));
    registry.register(Arc::new(tool::ToolProcessor));
    registry.register(Arc::new(rag::RagIngestProcessor::new()));
    registry.register(Arc::new(entity::EntityExtractProcessor));
}
