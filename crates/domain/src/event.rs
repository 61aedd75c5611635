use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, ToolCall, ToolDefinition};
use crate::error::{Error, Result};
use crate::message::MessagePayload;

/// The event types the core dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "NEW_MESSAGE")]
    NewMessage,
    #[serde(rename = "LLM_CALL")]
    LlmCall,
    #[serde(rename = "TOOL_CALL")]
    ToolCall,
    #[serde(rename = "ENTITY_EXTRACT")]
    EntityExtract,
    #[serde(rename = "RAG_INGEST")]
    RagIngest,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NewMessage => "NEW_MESSAGE",
            EventType::LlmCall => "LLM_CALL",
            EventType::ToolCall => "TOOL_CALL",
            EventType::EntityExtract => "ENTITY_EXTRACT",
            EventType::RagIngest => "RAG_INGEST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW_MESSAGE" => Some(EventType::NewMessage),
            "LLM_CALL" => Some(EventType::LlmCall),
            "TOOL_CALL" => Some(EventType::ToolCall),
            "ENTITY_EXTRACT" => Some(EventType::EntityExtract),
            "RAG_INGEST" => Some(EventType::RagIngest),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "completed" => Some(EventStatus::Completed),
            "failed" => Some(EventStatus::Failed),
            "expired" => Some(EventStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Expired
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Model parameters for one LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmCallConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Payload of an `LLM_CALL` event: everything the LLM processor needs to
/// invoke the provider without re-reading the thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallPayload {
    pub agent_id: String,
    pub agent_name: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub config: LlmCallConfig,
    /// Sender of the message that triggered this call (reply fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sender_id: Option<String>,
    /// Remaining multi-agent hops inherited from the source message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_queue: Vec<String>,
}

/// Payload of a `TOOL_CALL` event: one call, plus its batch coordinates
/// when the model issued several calls at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub call: ToolCall,
    /// The agent that issued the call (receives the follow-up LLM_CALL).
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u32>,
}

/// Payload of an `ENTITY_EXTRACT` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityExtractPayload {
    pub message_id: String,
    /// Graph node of the source message (MENTIONS edges attach here).
    pub node_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

/// Chunking strategy for document ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Sentences,
    Fixed,
}

/// Payload of a `RAG_INGEST` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// `text:<inline>`, `http(s)://…`, `file://…`, or a bare path.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ChunkStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<usize>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// The typed payload of an event, discriminated by [`EventType`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    NewMessage(MessagePayload),
    LlmCall(LlmCallPayload),
    ToolCall(ToolCallPayload),
    EntityExtract(EntityExtractPayload),
    RagIngest(IngestRequest),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::NewMessage(_) => EventType::NewMessage,
            EventPayload::LlmCall(_) => EventType::LlmCall,
            EventPayload::ToolCall(_) => EventType::ToolCall,
            EventPayload::EntityExtract(_) => EventType::EntityExtract,
            EventPayload::RagIngest(_) => EventType::RagIngest,
        }
    }

    /// Serialize to the JSONB column value.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            EventPayload::NewMessage(p) => serde_json::to_value(p)?,
            EventPayload::LlmCall(p) => serde_json::to_value(p)?,
            EventPayload::ToolCall(p) => serde_json::to_value(p)?,
            EventPayload::EntityExtract(p) => serde_json::to_value(p)?,
            EventPayload::RagIngest(p) => serde_json::to_value(p)?,
        })
    }

    /// Deserialize from the stored `(type, payload)` pair.
    pub fn from_parts(event_type: EventType, payload: serde_json::Value) -> Result<Self> {
        Ok(match event_type {
            EventType::NewMessage => EventPayload::NewMessage(serde_json::from_value(payload)?),
            EventType::LlmCall => EventPayload::LlmCall(serde_json::from_value(payload)?),
            EventType::ToolCall => EventPayload::ToolCall(serde_json::from_value(payload)?),
            EventType::EntityExtract => {
                EventPayload::EntityExtract(serde_json::from_value(payload)?)
            }
            EventType::RagIngest => EventPayload::RagIngest(serde_json::from_value(payload)?),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event + EventDraft
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A persisted unit of work in the queue.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub thread_id: String,
    pub namespace: Option<String>,
    pub payload: EventPayload,
    pub parent_event_id: Option<String>,
    pub trace_id: Option<String>,
    pub priority: i32,
    pub ttl_ms: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Typed accessor; errors with the expected/actual types.
    pub fn new_message(&self) -> Result<&MessagePayload> {
        match &self.payload {
            EventPayload::NewMessage(p) => Ok(p),
            other => Err(type_mismatch(EventType::NewMessage, other)),
        }
    }

    pub fn llm_call(&self) -> Result<&LlmCallPayload> {
        match &self.payload {
            EventPayload::LlmCall(p) => Ok(p),
            other => Err(type_mismatch(EventType::LlmCall, other)),
        }
    }

    pub fn tool_call(&self) -> Result<&ToolCallPayload> {
        match &self.payload {
            EventPayload::ToolCall(p) => Ok(p),
            other => Err(type_mismatch(EventType::ToolCall, other)),
        }
    }
}

fn type_mismatch(expected: EventType, got: &EventPayload) -> Error {
    Error::Validation(format!(
        "expected {} payload, got {}",
        expected,
        got.event_type()
    ))
}

/// An event a processor (or the run API) wants enqueued. The store
/// assigns id, status, and timestamps at insert time.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub payload: EventPayload,
    pub priority: i32,
    pub ttl_ms: Option<i64>,
    pub parent_event_id: Option<String>,
    pub trace_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl EventDraft {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            priority: 0,
            ttl_ms: None,
            parent_event_id: None,
            trace_id: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_parent(mut self, parent_event_id: impl Into<String>) -> Self {
        self.parent_event_id = Some(parent_event_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Sender;

    #[test]
    fn event_type_round_trips() {
        for t in [
            EventType::NewMessage,
            EventType::LlmCall,
            EventType::ToolCall,
            EventType::EntityExtract,
            EventType::RagIngest,
        ] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("UNKNOWN"), None);
    }

    #[test]
    fn payload_round_trips_through_parts() {
        let payload = EventPayload::NewMessage(MessagePayload::text(Sender::user("Alex"), "hi"));
        let json = payload.to_json().unwrap();
        let back = EventPayload::from_parts(EventType::NewMessage, json).unwrap();
        match back {
            EventPayload::NewMessage(p) => assert_eq!(p.content, "hi"),
            other => panic!("wrong variant: {:?}", other.event_type()),
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(EventStatus::Completed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(EventStatus::Expired.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
    }

    #[test]
    fn typed_accessor_rejects_wrong_variant() {
        let evt = Event {
            id: "e1".into(),
            thread_id: "t1".into(),
            namespace: None,
            payload: EventPayload::NewMessage(MessagePayload::text(Sender::user("A"), "x")),
            parent_event_id: None,
            trace_id: None,
            priority: 0,
            ttl_ms: None,
            expires_at: None,
            status: EventStatus::Pending,
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(evt.new_message().is_ok());
        assert!(evt.llm_call().is_err());
    }
}
