//! Shared fixtures for runtime tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cf_domain::agent::AgentRoster;
use cf_domain::chat::ToolDefinition;
use cf_domain::config::RuntimeConfig;
use cf_domain::error::Result;
use cf_domain::event::{Event, EventPayload, EventStatus};
use cf_providers::ProviderRegistry;
use cf_runtime::debounce::DebounceMap;
use cf_runtime::state::RuntimeDeps;
use cf_runtime::stream::{channel, EventFanout, EventStream};
use cf_runtime::{CancelSet, ProcessorContext, Tool, ToolContext, ToolSet};
use cf_store::Store;

/// A store over a lazy pool: constructible without Postgres, usable by
/// code paths that never touch the database.
pub fn lazy_store() -> Store {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://localhost/confab_never_connected")
        .expect("lazy pool");
    Store::from_pool(pool)
}

/// A Postgres-backed store for end-to-end tests, or `None` when
/// `CONFAB_TEST_DATABASE_URL` is unset (the test should return early).
pub async fn pg_store() -> Option<Store> {
    init_tracing();
    let Ok(url) = std::env::var("CONFAB_TEST_DATABASE_URL") else {
        eprintln!("skipping: CONFAB_TEST_DATABASE_URL is not set");
        return None;
    };
    Some(
        Store::connect(&url)
            .await
            .expect("connect to the test database"),
    )
}

/// Idempotent tracing setup; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub struct TestContext {
    pub ctx: ProcessorContext,
    pub stream: EventStream,
}

/// Build a `ProcessorContext` around the given pieces. The returned
/// stream receives everything processors emit.
pub fn processor_context(
    store: Store,
    providers: ProviderRegistry,
    agents: AgentRoster,
    tools: ToolSet,
    config: RuntimeConfig,
) -> TestContext {
    let (sink, stream) = channel(config.stream.buffer);
    let fanout = EventFanout::new();
    fanout.add(sink);
    let deps = Arc::new(RuntimeDeps {
        store,
        providers: Arc::new(providers),
        assets: None,
        agents,
        tools: Arc::new(tools),
        config: Arc::new(config),
        upsert_debounce: Arc::new(DebounceMap::new(Duration::from_secs(60))),
    });
    TestContext {
        ctx: ProcessorContext {
            deps,
            sink: fanout,
            cancel: CancelSet::new(),
            thread_id: "t-test".into(),
            namespace: None,
        },
        stream,
    }
}

/// A pending event wrapping the payload, for direct processor calls.
pub fn event_with(payload: EventPayload) -> Event {
    let now = chrono::Utc::now();
    Event {
        id: ulid::Ulid::new().to_string(),
        thread_id: "t-test".into(),
        namespace: None,
        payload,
        parent_event_id: None,
        trace_id: None,
        priority: 0,
        ttl_ms: None,
        expires_at: None,
        status: EventStatus::Processing,
        metadata: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    }
}

/// Echoes its arguments back; the simplest possible tool.
pub struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".into(),
            description: "Echo the arguments back as the result.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } }
            }),
        }
    }

    async fn execute(
        &self,
        _ctx: &ToolContext<'_>,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "echoed": args }))
    }
}

/// Always fails; exercises the error path.
pub struct FailingTool;

#[async_trait::async_trait]
impl Tool for FailingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "always_fails".into(),
            description: "Fails unconditionally.".into(),
            parameters: serde_json::json!({ "type": "object" }),
        }
    }

    async fn execute(
        &self,
        _ctx: &ToolContext<'_>,
        _args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(cf_domain::Error::Other("tool exploded".into()))
    }
}
