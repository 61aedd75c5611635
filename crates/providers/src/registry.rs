//! Provider registry.
//!
//! Holds the chat and embedding provider instances a runtime was built
//! with, keyed by provider id, with role defaults (`chat` for agent
//! turns, `extraction` for entity extraction, `embedding` for vectors).

use std::collections::HashMap;
use std::sync::Arc;

use cf_domain::error::{Error, Result};

use crate::traits::{ChatProvider, EmbeddingProvider};

/// Role names the runtime resolves through the registry.
pub mod role {
    pub const CHAT: &str = "chat";
    pub const EXTRACTION: &str = "extraction";
    pub const EMBEDDING: &str = "embedding";
}

#[derive(Default)]
pub struct ProviderRegistry {
    chat: HashMap<String, Arc<dyn ChatProvider>>,
    embedding: HashMap<String, Arc<dyn EmbeddingProvider>>,
    /// role name → provider id.
    roles: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chat provider. The first registration becomes the
    /// default `chat` role unless a role is assigned explicitly.
    pub fn register_chat(&mut self, provider: Arc<dyn ChatProvider>) {
        let id = provider.provider_id().to_string();
        if self.chat.is_empty() {
            self.roles.entry(role::CHAT.into()).or_insert(id.clone());
        }
        tracing::info!(provider_id = %id, "registered chat provider");
        self.chat.insert(id, provider);
    }

    pub fn register_embedding(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        let id = provider.provider_id().to_string();
        if self.embedding.is_empty() {
            self.roles
                .entry(role::EMBEDDING.into())
                .or_insert(id.clone());
        }
        tracing::info!(provider_id = %id, "registered embedding provider");
        self.embedding.insert(id, provider);
    }

    /// Assign a role (e.g. `extraction`) to a provider id.
    pub fn assign_role(&mut self, role: impl Into<String>, provider_id: impl Into<String>) {
        self.roles.insert(role.into(), provider_id.into());
    }

    pub fn chat(&self, provider_id: &str) -> Option<Arc<dyn ChatProvider>> {
        self.chat.get(provider_id).cloned()
    }

    pub fn embedding_by_id(&self, provider_id: &str) -> Option<Arc<dyn EmbeddingProvider>> {
        self.embedding.get(provider_id).cloned()
    }

    /// Resolve a chat provider: explicit id first, then role default.
    pub fn chat_for(&self, provider_id: Option<&str>) -> Result<Arc<dyn ChatProvider>> {
        if let Some(id) = provider_id {
            return self
                .chat(id)
                .ok_or_else(|| Error::NotFound(format!("chat provider '{id}'")));
        }
        self.chat_for_role(role::CHAT)
    }

    /// The chat provider assigned to a role, falling back to the `chat`
    /// role, then to any registered provider.
    pub fn chat_for_role(&self, role_name: &str) -> Result<Arc<dyn ChatProvider>> {
        let by_role = self
            .roles
            .get(role_name)
            .or_else(|| self.roles.get(role::CHAT))
            .and_then(|id| self.chat.get(id));
        if let Some(p) = by_role {
            return Ok(p.clone());
        }
        self.chat
            .values()
            .next()
            .cloned()
            .ok_or_else(|| Error::Config("no chat providers registered".into()))
    }

    /// The default embedding provider, if any is registered.
    pub fn embedding(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.roles
            .get(role::EMBEDDING)
            .and_then(|id| self.embedding.get(id))
            .or_else(|| self.embedding.values().next())
            .cloned()
    }

    pub fn has_chat(&self) -> bool {
        !self.chat.is_empty()
    }

    pub fn list_chat(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chat.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEmbeddingProvider, ScriptedChatProvider};

    #[test]
    fn first_chat_provider_becomes_default() {
        let mut reg = ProviderRegistry::new();
        reg.register_chat(Arc::new(ScriptedChatProvider::always_text("hi").named("a")));
        reg.register_chat(Arc::new(ScriptedChatProvider::always_text("yo").named("b")));

        let p = reg.chat_for(None).unwrap();
        assert_eq!(p.provider_id(), "a");
        let p = reg.chat_for(Some("b")).unwrap();
        assert_eq!(p.provider_id(), "b");
        assert!(reg.chat_for(Some("missing")).is_err());
    }

    #[test]
    fn role_assignment_overrides_default() {
        let mut reg = ProviderRegistry::new();
        reg.register_chat(Arc::new(ScriptedChatProvider::always_text("hi").named("a")));
        reg.register_chat(Arc::new(ScriptedChatProvider::always_text("yo").named("b")));
        reg.assign_role(role::EXTRACTION, "b");

        let p = reg.chat_for_role(role::EXTRACTION).unwrap();
        assert_eq!(p.provider_id(), "b");
        // Unassigned roles fall back to the chat default.
        let p = reg.chat_for_role("summarizer").unwrap();
        assert_eq!(p.provider_id(), "a");
    }

    #[test]
    fn embedding_default_is_first_registered() {
        let mut reg = ProviderRegistry::new();
        assert!(reg.embedding().is_none());
        reg.register_embedding(Arc::new(MockEmbeddingProvider::new(8)));
        assert!(reg.embedding().is_some());
    }
}
