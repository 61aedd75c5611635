//! Tool definitions and execution context.
//!
//! Tools are the runtime's extension surface: the LLM invokes them by
//! name, the tool processor executes them against a [`ToolContext`]
//! that is already scoped to the run's thread and namespace — tools
//! never specify a namespace themselves.

use std::collections::HashMap;
use std::sync::Arc;

use cf_domain::agent::{AgentDefinition, AgentRoster};
use cf_domain::chat::ToolDefinition;
use cf_domain::error::Result;
use cf_domain::graph::{ChunkMatch, NodeMatch};
use cf_store::documents::ChunkSearch;
use cf_store::graph::NodeDraft;
use cf_store::Store;

use cf_assets::AssetStore;

/// One callable tool.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Schema advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute with parsed JSON arguments; the returned value is
    /// serialized into the tool-result message.
    async fn execute(
        &self,
        ctx: &ToolContext<'_>,
        args: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Named tool registry; definitions can be filtered per agent.
#[derive(Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions visible to an agent: its allowlist, or everything
    /// when the allowlist is empty.
    pub fn definitions_for(&self, agent: &AgentDefinition) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| t.definition())
            .filter(|d| agent.tools.is_empty() || agent.tools.iter().any(|n| n == &d.name))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

/// Everything a tool gets to work with. Collections are pre-scoped to
/// the run's namespace.
pub struct ToolContext<'a> {
    pub store: &'a Store,
    pub thread_id: &'a str,
    /// The agent that issued the call.
    pub sender_id: &'a str,
    pub agents: &'a AgentRoster,
    pub tools: &'a ToolSet,
    pub assets: Option<&'a dyn AssetStore>,
    pub collections: Collections,
    /// Run-level metadata (trace ids, caller extensions).
    pub metadata: &'a serde_json::Value,
}

/// A namespace-scoped view over the knowledge collections.
#[derive(Clone)]
pub struct Collections {
    store: Store,
    namespace: String,
}

impl Collections {
    pub fn new(store: Store, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Re-scope to another namespace (cross-scope tools).
    pub fn with_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            store: self.store.clone(),
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn search_nodes(
        &self,
        embedding: &[f32],
        types: Option<&[String]>,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<NodeMatch>> {
        self.store
            .search_nodes(
                embedding,
                std::slice::from_ref(&self.namespace),
                types,
                limit,
                min_similarity,
            )
            .await
    }

    pub async fn search_chunks(
        &self,
        embedding: &[f32],
        search: &ChunkSearch,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<ChunkMatch>> {
        self.store
            .search_chunks(
                std::slice::from_ref(&self.namespace),
                embedding,
                search,
                limit,
                threshold,
            )
            .await
    }

    pub async fn create_node(
        &self,
        node_type: impl Into<String>,
        name: impl Into<String>,
        content: Option<String>,
        embedding: Option<Vec<f32>>,
        data: serde_json::Value,
    ) -> Result<cf_domain::graph::KnowledgeNode> {
        self.store
            .create_node(NodeDraft {
                namespace: self.namespace.clone(),
                node_type: node_type.into(),
                name: name.into(),
                content,
                embedding,
                data,
                source_type: None,
                source_id: None,
            })
            .await
    }
}
