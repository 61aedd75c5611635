use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::ToolCall;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Agent,
    System,
    Tool,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Agent => "agent",
            SenderType::System => "system",
            SenderType::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(SenderType::User),
            "agent" => Some(SenderType::Agent),
            "system" => Some(SenderType::System),
            "tool" => Some(SenderType::Tool),
            _ => None,
        }
    }
}

/// The sender of an incoming or produced message.
///
/// `external_id` is the caller-stable key (e.g. a chat platform user id);
/// `id` is the internal id once known. Unknown fields ride in `metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(rename = "type", default)]
    pub sender_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Default for SenderType {
    fn default() -> Self {
        SenderType::User
    }
}

impl Sender {
    pub fn user(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: None,
            external_id: Some(name.clone()),
            sender_type: SenderType::User,
            name: Some(name),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn agent(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            external_id: None,
            sender_type: SenderType::Agent,
            name: Some(name.into()),
            metadata: serde_json::Value::Null,
        }
    }

    /// The best available identifier: name, then id, then external id.
    pub fn display_id(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .or(self.external_id.as_deref())
            .unwrap_or("unknown")
    }
}

/// A binary or referenced attachment on a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Open vocabulary: image, audio, video, file...
    pub kind: String,
    pub mime_type: String,
    /// `asset://` reference, set once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ref: Option<String>,
    /// Inline base64 payload (pre-storage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// External URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// The payload of a `NEW_MESSAGE` event and of the stream event that
/// mirrors it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub content: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool-result messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl MessagePayload {
    pub fn text(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender,
            tool_calls: Vec::new(),
            tool_call_id: None,
            attachments: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// A persisted row in the `messages` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub sender_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Routing metadata carried on messages and events
/// (`metadata.target_id` / `metadata.target_queue`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_queue: Vec<String>,
}

impl RoutingMeta {
    /// Read routing fields out of a metadata object; absent fields default.
    pub fn from_metadata(metadata: &serde_json::Value) -> Self {
        serde_json::from_value(metadata.clone()).unwrap_or_default()
    }

    /// Merge routing fields into an existing metadata object.
    pub fn apply_to(&self, metadata: &mut serde_json::Value) {
        if !metadata.is_object() {
            *metadata = serde_json::json!({});
        }
        let obj = metadata.as_object_mut().expect("object ensured above");
        match &self.target_id {
            Some(t) => {
                obj.insert("target_id".into(), serde_json::json!(t));
            }
            None => {
                obj.remove("target_id");
            }
        }
        if self.target_queue.is_empty() {
            obj.remove("target_queue");
        } else {
            obj.insert("target_queue".into(), serde_json::json!(self.target_queue));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_meta_round_trips_through_metadata() {
        let routing = RoutingMeta {
            target_id: Some("Writer".into()),
            target_queue: vec!["Reviewer".into()],
        };
        let mut meta = serde_json::json!({ "trace": "t1" });
        routing.apply_to(&mut meta);

        let parsed = RoutingMeta::from_metadata(&meta);
        assert_eq!(parsed, routing);
        // Unrelated fields survive.
        assert_eq!(meta["trace"], "t1");
    }

    #[test]
    fn routing_meta_defaults_when_absent() {
        let parsed = RoutingMeta::from_metadata(&serde_json::json!({ "x": 1 }));
        assert_eq!(parsed, RoutingMeta::default());
    }

    #[test]
    fn sender_display_id_prefers_name() {
        let s = Sender::user("Alex");
        assert_eq!(s.display_id(), "Alex");
        let s = Sender {
            id: Some("a-1".into()),
            ..Default::default()
        };
        assert_eq!(s.display_id(), "a-1");
    }
}
