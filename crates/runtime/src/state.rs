//! Shared runtime state.
//!
//! One [`RuntimeDeps`] is built per runtime (and re-derived per run when
//! options override agents, tools, schema, or namespace). Everything is
//! cheaply cloneable: `Arc`s and a pooled store handle.

use std::sync::Arc;

use cf_assets::AssetStore;
use cf_domain::agent::AgentRoster;
use cf_domain::config::RuntimeConfig;
use cf_providers::ProviderRegistry;
use cf_store::Store;

use crate::debounce::DebounceMap;
use crate::tools::ToolSet;

/// Dependencies shared by the worker loop and every processor.
pub struct RuntimeDeps {
    pub store: Store,
    pub providers: Arc<ProviderRegistry>,
    pub assets: Option<Arc<dyn AssetStore>>,
    pub agents: AgentRoster,
    pub tools: Arc<ToolSet>,
    pub config: Arc<RuntimeConfig>,
    /// Debounce state for best-effort user upserts (process-wide).
    pub upsert_debounce: Arc<DebounceMap>,
}

impl RuntimeDeps {
    /// Derive a per-run view with overridden pieces. Shared state
    /// (debounce, config, providers) stays shared.
    pub fn derive(
        &self,
        store: Option<Store>,
        agents: Option<AgentRoster>,
        tools: Option<Arc<ToolSet>>,
    ) -> Self {
        Self {
            store: store.unwrap_or_else(|| self.store.clone()),
            providers: self.providers.clone(),
            assets: self.assets.clone(),
            agents: agents.unwrap_or_else(|| self.agents.clone()),
            tools: tools.unwrap_or_else(|| self.tools.clone()),
            config: self.config.clone(),
            upsert_debounce: self.upsert_debounce.clone(),
        }
    }
}
