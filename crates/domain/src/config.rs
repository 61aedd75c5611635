use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level runtime config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub entity_extraction: EntityExtractionConfig,
    #[serde(default)]
    pub assets: AssetConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    /// Per-sender debounce window for user upserts, seconds.
    #[serde(default = "d_60")]
    pub user_upsert_debounce_secs: u64,
    /// Ceiling on chained LLM calls per originating message (agent
    /// hand-offs and tool round-trips both count). Prevents runaway
    /// reply-to-sender loops between agents.
    #[serde(default = "d_25u32")]
    pub max_chain_depth: u32,
    /// Embed message nodes at write time (needs an embedding provider).
    #[serde(default)]
    pub embed_messages: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lease: LeaseConfig::default(),
            queue: QueueConfig::default(),
            rag: RagConfig::default(),
            entity_extraction: EntityExtractionConfig::default(),
            assets: AssetConfig::default(),
            history: HistoryConfig::default(),
            stream: StreamConfig::default(),
            user_upsert_debounce_secs: 60,
            max_chain_depth: 25,
            embed_messages: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lease / queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease TTL in seconds. Floor of 30 recommended.
    #[serde(default = "d_30")]
    pub ttl_secs: u64,
}

impl LeaseConfig {
    /// Renewal interval: TTL / 3, at least one second.
    pub fn renew_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs((self.ttl_secs / 3).max(1))
    }

    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default event TTL in ms; `None` = events never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl_ms: Option<i64>,
    /// Poll interval when waiting to steal an expired lease, ms.
    #[serde(default = "d_1000")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: None,
            poll_interval_ms: 1_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RAG
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Target chunk size in characters.
    #[serde(default = "d_1000us")]
    pub chunk_size: usize,
    /// Overlap between consecutive chunks, characters.
    #[serde(default = "d_200us")]
    pub overlap: usize,
    /// Chunks fetched for auto-RAG preambles.
    #[serde(default = "d_5us")]
    pub top_k: usize,
    #[serde(default = "d_0_7")]
    pub min_similarity: f32,
    /// Hybrid search weights (`semantic + keyword` should sum to 1).
    #[serde(default = "d_0_7")]
    pub semantic_weight: f32,
    #[serde(default = "d_0_3")]
    pub keyword_weight: f32,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            overlap: 200,
            top_k: 5,
            min_similarity: 0.7,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityExtractionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Below this, a candidate is a new entity outright.
    #[serde(default = "d_0_95")]
    pub similarity_threshold: f32,
    /// At or above this, merge without asking the LLM.
    #[serde(default = "d_0_99")]
    pub auto_merge_threshold: f32,
    #[serde(default = "d_5us")]
    pub search_limit: usize,
}

impl Default for EntityExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: 0.95,
            auto_merge_threshold: 0.99,
            search_limit: 5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assets / history / stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Resolve `asset://` refs to inline data before provider calls.
    /// When off, multimodal parts are stripped and the agent must fetch
    /// assets through a tool.
    #[serde(default = "d_true")]
    pub resolve_in_llm: bool,
    /// Store inline base64 attachments in the asset store at intake.
    #[serde(default = "d_true")]
    pub store_inline_attachments: bool,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            resolve_in_llm: true,
            store_inline_attachments: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Append "(addressed to: <name>)" on messages aimed at others.
    #[serde(default = "d_true")]
    pub include_target_context: bool,
    /// Most recent messages included per LLM call.
    #[serde(default = "d_100us")]
    pub max_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            include_target_context: true,
            max_messages: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Bounded run-stream capacity; overflowing tokens drop oldest-first.
    #[serde(default = "d_256us")]
    pub buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl RuntimeConfig {
    /// Sanity-check the configuration. Errors make the runtime refuse to
    /// start; warnings are logged.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.lease.ttl_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "lease.ttl_secs must be > 0".into(),
            });
        } else if self.lease.ttl_secs < 30 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "lease.ttl_secs = {} is below the recommended floor of 30",
                    self.lease.ttl_secs
                ),
            });
        }

        if self.rag.chunk_size == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "rag.chunk_size must be > 0".into(),
            });
        }
        if self.rag.overlap >= self.rag.chunk_size && self.rag.chunk_size > 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "rag.overlap must be smaller than rag.chunk_size".into(),
            });
        }
        let weight_sum = self.rag.semantic_weight + self.rag.keyword_weight;
        if (weight_sum - 1.0).abs() > 0.01 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "rag weights sum to {weight_sum:.2}; hybrid scores will not be normalized"
                ),
            });
        }

        if self.entity_extraction.auto_merge_threshold < self.entity_extraction.similarity_threshold
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "entity_extraction.auto_merge_threshold must be >= similarity_threshold"
                    .into(),
            });
        }

        if self.max_chain_depth == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "max_chain_depth must be > 0".into(),
            });
        }

        if self.stream.buffer == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "stream.buffer must be > 0".into(),
            });
        }

        issues
    }

    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}

// serde default helpers
fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_25u32() -> u32 {
    25
}
fn d_1000() -> u64 {
    1_000
}
fn d_1000us() -> usize {
    1_000
}
fn d_200us() -> usize {
    200
}
fn d_100us() -> usize {
    100
}
fn d_256us() -> usize {
    256
}
fn d_5us() -> usize {
    5
}
fn d_true() -> bool {
    true
}
fn d_0_7() -> f32 {
    0.7
}
fn d_0_3() -> f32 {
    0.3
}
fn d_0_95() -> f32 {
    0.95
}
fn d_0_99() -> f32 {
    0.99
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        let issues = config.validate();
        assert!(!RuntimeConfig::has_errors(&issues), "{issues:?}");
    }

    #[test]
    fn zero_chunk_size_is_an_error() {
        let mut config = RuntimeConfig::default();
        config.rag.chunk_size = 0;
        assert!(RuntimeConfig::has_errors(&config.validate()));
    }

    #[test]
    fn short_lease_warns() {
        let mut config = RuntimeConfig::default();
        config.lease.ttl_secs = 2;
        let issues = config.validate();
        assert!(!RuntimeConfig::has_errors(&issues));
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning && i.message.contains("floor")));
    }

    #[test]
    fn loads_from_toml() {
        let toml = r#"
            [lease]
            ttl_secs = 45

            [rag]
            chunk_size = 800
            overlap = 100
        "#;
        let config: RuntimeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.lease.ttl_secs, 45);
        assert_eq!(config.rag.chunk_size, 800);
        // Untouched sections keep defaults.
        assert_eq!(config.stream.buffer, 256);
    }

    #[test]
    fn renew_interval_is_a_third_of_ttl() {
        let lease = LeaseConfig { ttl_secs: 30 };
        assert_eq!(lease.renew_interval(), std::time::Duration::from_secs(10));
    }
}
