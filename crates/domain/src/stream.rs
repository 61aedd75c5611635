use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::chat::ToolCall;
use crate::event::LlmCallPayload;
use crate::message::MessagePayload;

/// A boxed async stream, used for provider token streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events pushed to a run's live consumer, in dispatch order.
///
/// `Token` events may be dropped under backpressure; every other variant
/// is delivered losslessly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A message was persisted (user, agent, system, or tool).
    #[serde(rename = "NEW_MESSAGE")]
    NewMessage {
        event_id: String,
        thread_id: String,
        message: MessagePayload,
        #[serde(default)]
        metadata: serde_json::Value,
    },

    /// An agent turn is being dispatched to its provider.
    #[serde(rename = "LLM_CALL")]
    LlmCall {
        event_id: String,
        thread_id: String,
        payload: LlmCallPayload,
    },

    /// One streamed token; the final token of a call carries
    /// `is_complete = true` and empty text.
    #[serde(rename = "TOKEN")]
    Token {
        thread_id: String,
        agent_name: String,
        token: String,
        is_complete: bool,
    },

    /// A tool invocation is being executed.
    #[serde(rename = "TOOL_CALL")]
    ToolCall {
        event_id: String,
        thread_id: String,
        call: ToolCall,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_index: Option<u32>,
    },

    /// A binary asset was stored (ephemeral; never persisted).
    #[serde(rename = "ASSET_CREATED")]
    AssetCreated {
        thread_id: String,
        asset_ref: String,
        mime_type: String,
        size: u64,
        kind: String,
    },

    /// Internal processing triggers, surfaced for observability.
    #[serde(rename = "ENTITY_EXTRACT")]
    EntityExtract { event_id: String, thread_id: String },

    #[serde(rename = "RAG_INGEST")]
    RagIngest { event_id: String, thread_id: String },
}

impl StreamEvent {
    /// Tokens are droppable under backpressure; nothing else is.
    pub fn is_token(&self) -> bool {
        matches!(self, StreamEvent::Token { .. })
    }
}
