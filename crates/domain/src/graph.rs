use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known node types. The vocabulary is open: these are the ones the
/// core reads and writes itself.
pub mod node_type {
    pub const CHUNK: &str = "chunk";
    pub const ENTITY: &str = "entity";
    pub const MESSAGE: &str = "message";
    pub const USER: &str = "user";
}

/// Well-known edge types (open vocabulary, same rule as node types).
pub mod edge_type {
    pub const REPLIED_BY: &str = "REPLIED_BY";
    pub const NEXT_CHUNK: &str = "NEXT_CHUNK";
    pub const MENTIONS: &str = "MENTIONS";
    pub const RELATED_TO: &str = "RELATED_TO";
    pub const SAME_AS: &str = "SAME_AS";
}

/// A node in the knowledge graph: chunks, entities, messages, users,
/// decisions. Namespace-scoped and independent of threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Present when the node is embedded for similarity search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A typed, weighted connection between two nodes. Deleted with either
/// endpoint (cascade).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEdge {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "default_weight")]
    pub weight: f32,
    pub created_at: DateTime<Utc>,
}

fn default_weight() -> f32 {
    1.0
}

/// A search hit: node plus cosine similarity in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct NodeMatch {
    pub node: KnowledgeNode,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Ingesting,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Ingesting => "ingesting",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "ingesting" => Some(DocumentStatus::Ingesting),
            "ready" => Some(DocumentStatus::Ready),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// An ingested source document. `(namespace, content_hash)` is the
/// idempotency key: re-ingesting identical content is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub namespace: String,
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    pub content_hash: String,
    pub status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One chunk of a document; unique on `(document_id, chunk_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub token_count: i32,
}

/// A chunk search hit with its combined relevance score.
#[derive(Debug, Clone)]
pub struct ChunkMatch {
    pub chunk: DocumentChunk,
    pub score: f32,
}
