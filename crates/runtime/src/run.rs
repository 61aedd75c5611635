//! The public entry point: build a [`Runtime`], submit messages with
//! [`Runtime::run`], consume the handle's live event stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use cf_assets::AssetStore;
use cf_domain::agent::{AgentDefinition, AgentRoster};
use cf_domain::chat::ToolCall;
use cf_domain::config::RuntimeConfig;
use cf_domain::error::{Error, Result};
use cf_domain::event::{EventDraft, EventPayload, IngestRequest};
use cf_domain::message::{Attachment, MessagePayload, Sender};
use cf_domain::stream::StreamEvent;
use cf_domain::thread::{ThreadMode, ThreadSpec};
use cf_providers::ProviderRegistry;
use cf_store::Store;

use crate::cancel::{CancelSet, CancelToken};
use crate::debounce::DebounceMap;
use crate::processors;
use crate::registry::{Processor, ProcessorRegistry};
use crate::state::RuntimeDeps;
use crate::stream::{channel, EventStream};
use crate::tools::ToolSet;
use crate::workers::{DoneState, WorkerRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One submitted message.
#[derive(Debug, Clone)]
pub struct RunMessage {
    pub content: String,
    pub sender: Sender,
    pub thread: ThreadSpec,
    pub tool_calls: Vec<ToolCall>,
    pub attachments: Vec<Attachment>,
    /// Extension fields; `target_id` / `target_queue` are honored for
    /// routing.
    pub metadata: serde_json::Value,
}

impl RunMessage {
    pub fn text(sender: Sender, thread: ThreadSpec, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender,
            thread,
            tool_calls: Vec::new(),
            attachments: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// When `run()` returns relative to processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Return as soon as the enqueue commits (default).
    #[default]
    Immediate,
    /// Wait for the worker to drain before returning the handle.
    OnComplete,
}

#[derive(Default)]
pub struct RunOptions {
    pub ack_mode: AckMode,
    /// Event TTL; overrides the configured queue default.
    pub queue_ttl_ms: Option<i64>,
    /// Effective namespace for everything this run creates.
    pub namespace: Option<String>,
    /// Tenant schema; auto-provisioned when missing.
    pub schema: Option<String>,
    /// Caller abort signal.
    pub signal: Option<CancelToken>,
    /// Per-run agent roster override.
    pub agents: Option<Vec<AgentDefinition>>,
    /// Per-run tool set override.
    pub tools: Option<Arc<ToolSet>>,
    pub priority: i32,
    pub trace_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum DoneWaiter {
    Resolved(Option<std::result::Result<(), String>>),
    Watch(watch::Receiver<DoneState>),
}

/// Lifecycle of a submitted run, as seen at handle creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Enqueued; the worker picks it up in dispatch order.
    Queued,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
        }
    }
}

/// A live run: the enqueued event's id, the event stream, a completion
/// future, and cancellation.
pub struct RunHandle {
    pub queue_id: String,
    pub thread_id: String,
    pub status: RunStatus,
    events: EventStream,
    done: DoneWaiter,
    cancel: CancelSet,
}

impl RunHandle {
    /// Next stream event; `None` after the worker drains and closes.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.next().await
    }

    /// Collect every remaining event until the stream closes.
    pub async fn collect_events(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.next().await {
            events.push(event);
        }
        events
    }

    /// Resolves when the worker has drained the thread's queue (or
    /// rejects on fatal infrastructure failure).
    pub async fn done(&mut self) -> Result<()> {
        match &mut self.done {
            DoneWaiter::Resolved(result) => match result.take() {
                None | Some(Ok(())) => Ok(()),
                Some(Err(message)) => Err(Error::Other(message)),
            },
            DoneWaiter::Watch(rx) => {
                loop {
                    if let Some(result) = rx.borrow().clone() {
                        return result.map_err(Error::Other);
                    }
                    if rx.changed().await.is_err() {
                        // Worker task dropped without reporting.
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop processing: closes this handle's stream and signals the
    /// worker, which releases the lease at the next quiescent point.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.events.close();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime + builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Runtime {
    deps: Arc<RuntimeDeps>,
    processors: Arc<ProcessorRegistry>,
    workers: Arc<WorkerRegistry>,
}

pub struct RuntimeBuilder {
    store: Store,
    providers: ProviderRegistry,
    assets: Option<Arc<dyn AssetStore>>,
    agents: Vec<AgentDefinition>,
    tools: ToolSet,
    config: RuntimeConfig,
    custom_processors: Vec<Arc<dyn Processor>>,
}

impl Runtime {
    pub fn builder(store: Store) -> RuntimeBuilder {
        RuntimeBuilder {
            store,
            providers: ProviderRegistry::new(),
            assets: None,
            agents: Vec::new(),
            tools: ToolSet::new(),
            config: RuntimeConfig::default(),
            custom_processors: Vec::new(),
        }
    }

    /// Submit a message: enqueue `NEW_MESSAGE`, start or join the
    /// thread's worker, return the live handle.
    pub async fn run(&self, message: RunMessage, options: RunOptions) -> Result<RunHandle> {
        let deps = self.derive_deps(&options).await?;
        let namespace = options.namespace.clone();

        let thread = deps
            .store
            .find_or_create_thread(&message.thread, namespace.as_deref())
            .await?;

        let mut metadata = if message.metadata.is_null() {
            serde_json::json!({})
        } else {
            message.metadata.clone()
        };
        if let Some(obj) = metadata.as_object_mut() {
            obj.entry("source").or_insert(serde_json::json!("run"));
        }

        let payload = MessagePayload {
            content: message.content,
            sender: message.sender,
            tool_calls: message.tool_calls,
            tool_call_id: None,
            attachments: message.attachments,
            metadata,
        };
        let ttl = options
            .queue_ttl_ms
            .or(deps.config.queue.default_ttl_ms);
        let mut draft = EventDraft::new(EventPayload::NewMessage(payload))
            .with_priority(options.priority)
            .with_trace(options.trace_id.clone());
        if let Some(ttl_ms) = ttl {
            draft = draft.with_ttl_ms(ttl_ms);
        }

        let event = deps
            .store
            .add_to_queue(&thread.id, namespace.as_deref(), draft)
            .await?;

        // Deferred threads only accumulate events.
        if thread.mode == ThreadMode::Deferred {
            let (sink, events) = channel(deps.config.stream.buffer);
            sink.close();
            return Ok(RunHandle {
                queue_id: event.id,
                thread_id: thread.id,
                status: RunStatus::Queued,
                events,
                done: DoneWaiter::Resolved(Some(Ok(()))),
                cancel: CancelSet::new(),
            });
        }

        let mut handle = self.attach_worker(
            deps,
            thread.id.clone(),
            namespace,
            event.id.clone(),
            options.signal.clone(),
        );

        if options.ack_mode == AckMode::OnComplete {
            handle.done().await?;
        }
        Ok(handle)
    }

    /// Enqueue a document ingestion on a thread and drive it like a run.
    pub async fn ingest(
        &self,
        thread_spec: ThreadSpec,
        request: IngestRequest,
        options: RunOptions,
    ) -> Result<RunHandle> {
        let deps = self.derive_deps(&options).await?;
        let namespace = options.namespace.clone();
        let thread = deps
            .store
            .find_or_create_thread(&thread_spec, namespace.as_deref())
            .await?;

        let draft = EventDraft::new(EventPayload::RagIngest(request))
            .with_priority(options.priority)
            .with_trace(options.trace_id.clone());
        let event = deps
            .store
            .add_to_queue(&thread.id, namespace.as_deref(), draft)
            .await?;

        let mut handle = self.attach_worker(
            deps,
            thread.id.clone(),
            namespace,
            event.id.clone(),
            options.signal.clone(),
        );
        if options.ack_mode == AckMode::OnComplete {
            handle.done().await?;
        }
        Ok(handle)
    }

    /// Cancel all workers and wait for their leases to release.
    pub async fn shutdown(&self) {
        let receivers = self.workers.cancel_all();
        for mut rx in receivers {
            while rx.borrow().is_none() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub fn active_workers(&self) -> usize {
        self.workers.active_count()
    }

    fn attach_worker(
        &self,
        deps: Arc<RuntimeDeps>,
        thread_id: String,
        namespace: Option<String>,
        queue_id: String,
        signal: Option<CancelToken>,
    ) -> RunHandle {
        let (sink, events) = channel(deps.config.stream.buffer);
        let key = (thread_id.clone(), namespace);

        // A worker observed mid-drain may finish without seeing our
        // event; attach again so a fresh worker picks it up.
        let attachment = loop {
            let attachment = self.workers.attach(
                key.clone(),
                deps.clone(),
                self.processors.clone(),
                sink.clone(),
                signal.clone(),
            );
            if !attachment.finished() {
                break attachment;
            }
        };

        RunHandle {
            queue_id,
            thread_id,
            status: RunStatus::Queued,
            events,
            done: DoneWaiter::Watch(attachment.done),
            cancel: attachment.cancel,
        }
    }

    /// Per-run dependency view: schema scoping and agent/tool overrides.
    async fn derive_deps(&self, options: &RunOptions) -> Result<Arc<RuntimeDeps>> {
        let needs_derive =
            options.schema.is_some() || options.agents.is_some() || options.tools.is_some();
        if !needs_derive {
            return Ok(self.deps.clone());
        }

        let store = match &options.schema {
            Some(schema) => {
                self.deps.store.ensure_schema(schema).await?;
                Some(self.deps.store.with_schema(schema.clone())?)
            }
            None => None,
        };
        let agents = options.agents.clone().map(AgentRoster::new);
        Ok(Arc::new(self.deps.derive(store, agents, options.tools.clone())))
    }
}

impl RuntimeBuilder {
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn assets(mut self, assets: Arc<dyn AssetStore>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn agents(mut self, agents: Vec<AgentDefinition>) -> Self {
        self.agents = agents;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn crate::tools::Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a custom processor (override built-ins by using the
    /// same event type at a higher priority).
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.custom_processors.push(processor);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let issues = self.config.validate();
        for issue in &issues {
            match issue.severity {
                cf_domain::config::ConfigSeverity::Warning => {
                    tracing::warn!(message = %issue.message, "config warning");
                }
                cf_domain::config::ConfigSeverity::Error => {
                    tracing::error!(message = %issue.message, "config error");
                }
            }
        }
        if RuntimeConfig::has_errors(&issues) {
            return Err(Error::Config(
                issues
                    .iter()
                    .map(|i| i.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            ));
        }

        let mut registry = ProcessorRegistry::new();
        processors::register_builtins(&mut registry);
        for processor in self.custom_processors {
            registry.register(processor);
        }

        let deps = RuntimeDeps {
            store: self.store,
            providers: Arc::new(self.providers),
            assets: self.assets,
            agents: AgentRoster::new(self.agents),
            tools: Arc::new(self.tools),
            config: Arc::new(self.config.clone()),
            upsert_debounce: Arc::new(DebounceMap::new(Duration::from_secs(
                self.config.user_upsert_debounce_secs,
            ))),
        };

        Ok(Runtime {
            deps: Arc::new(deps),
            processors: Arc::new(registry),
            workers: Arc::new(WorkerRegistry::new()),
        })
    }
}
