use serde::{Deserialize, Serialize};

/// How an agent consumes the knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RagMode {
    /// Relevant chunks are fetched and injected before every LLM call.
    Auto,
    /// The agent queries explicitly through tools.
    #[default]
    Manual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRagOptions {
    #[serde(default)]
    pub mode: RagMode,
    /// Namespaces to search; empty = the run's effective namespace.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_similarity: Option<f32>,
}

/// One conversational agent: persona, model selection, and capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// System prompt.
    #[serde(default)]
    pub instructions: String,
    /// Provider id in the registry; `None` = registry default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag: Option<AgentRagOptions>,
    /// Tool names this agent may call; empty = all registered tools.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            instructions: String::new(),
            provider: None,
            model: None,
            temperature: None,
            max_tokens: None,
            rag: None,
            tools: Vec::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

/// The agents participating in a run, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct AgentRoster {
    agents: Vec<AgentDefinition>,
}

impl AgentRoster {
    pub fn new(agents: Vec<AgentDefinition>) -> Self {
        Self { agents }
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// The default recipient when nothing else resolves.
    pub fn first(&self) -> Option<&AgentDefinition> {
        self.agents.first()
    }

    /// Case-insensitive lookup by name or id.
    pub fn find(&self, key: &str) -> Option<&AgentDefinition> {
        self.agents
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(key) || a.id.eq_ignore_ascii_case(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter()
    }
}
