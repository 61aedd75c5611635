//! End-to-end scenarios against a real Postgres (with pgvector).
//!
//! Set `CONFAB_TEST_DATABASE_URL` to run; without it every test logs a
//! skip notice and passes. Each scenario uses its own thread (fresh
//! external id) so the suite can run in parallel against one database.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cf_domain::agent::AgentDefinition;
use cf_domain::event::{EventDraft, EventPayload, IngestRequest};
use cf_domain::message::{MessagePayload, Sender};
use cf_domain::stream::StreamEvent;
use cf_domain::thread::ThreadSpec;
use cf_providers::mock::{MockEmbeddingProvider, ScriptedChatProvider};
use cf_providers::ProviderRegistry;
use cf_runtime::{RunMessage, RunOptions, Runtime};

use common::{pg_store, EchoTool, FailingTool};

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", cf_domain::new_id())
}

fn user_payload(name: &str, content: &str) -> MessagePayload {
    MessagePayload::text(Sender::user(name), content)
}

async fn collect_run(
    runtime: &Runtime,
    message: RunMessage,
) -> (Vec<StreamEvent>, String) {
    let mut handle = runtime
        .run(message, RunOptions::default())
        .await
        .expect("run submits");
    let thread_id = handle.thread_id.clone();
    let events = handle.collect_events().await;
    handle.done().await.expect("run completes");
    (events, thread_id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single agent, plain reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn single_agent_plain_reply() {
    let Some(store) = pg_store().await else { return };

    let mut providers = ProviderRegistry::new();
    providers.register_chat(Arc::new(ScriptedChatProvider::always_text("Hi Alex!")));
    let runtime = Runtime::builder(store.clone())
        .providers(providers)
        .agent(AgentDefinition::new("a1", "Assistant"))
        .build()
        .unwrap();

    let (events, thread_id) = collect_run(
        &runtime,
        RunMessage::text(
            Sender::user("Alex"),
            ThreadSpec::by_external_id(unique("plain-reply")),
            "Hi",
        ),
    )
    .await;

    // Stream order: NEW_MESSAGE(user), LLM_CALL, TOKEN*, TOKEN(done),
    // NEW_MESSAGE(agent targeted back at Alex).
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            StreamEvent::NewMessage { .. } => "msg",
            StreamEvent::LlmCall { .. } => "llm",
            StreamEvent::Token { is_complete, .. } => {
                if *is_complete {
                    "eot"
                } else {
                    "tok"
                }
            }
            _ => "other",
        })
        .collect();
    assert_eq!(kinds.first(), Some(&"msg"));
    assert!(kinds.contains(&"llm"));
    assert!(kinds.contains(&"tok"));
    assert_eq!(kinds.iter().filter(|k| **k == "eot").count(), 1);
    assert_eq!(kinds.last(), Some(&"msg"));

    let Some(StreamEvent::NewMessage { message, metadata, .. }) = events.last() else {
        panic!("expected trailing NEW_MESSAGE");
    };
    assert_eq!(message.content, "Hi Alex!");
    assert_eq!(metadata["target_id"], "Alex");

    assert_eq!(store.message_count(&thread_id).await.unwrap(), 2);

    // Dual-write: — both messages have graph nodes, linked REPLIED_BY.
    let records = store.list_messages(&thread_id, 10).await.unwrap();
    assert_eq!(records.len(), 2);
    let first_node = store
        .message_node_id(&records[0].id)
        .await
        .unwrap()
        .expect("user message node");
    let second_node = store
        .message_node_id(&records[1].id)
        .await
        .unwrap()
        .expect("agent message node");
    let edges = store
        .edges_from(&first_node, Some("REPLIED_BY"))
        .await
        .unwrap();
    assert!(edges.iter().any(|e| e.target_node_id == second_node));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// @mention routing selects exactly one agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn mention_routes_to_named_agent_only() {
    let Some(store) = pg_store().await else { return };

    let researcher_provider = Arc::new(
        ScriptedChatProvider::always_text("unused").named("researcher-p"),
    );
    let writer_provider =
        Arc::new(ScriptedChatProvider::always_text("Hello from Writer").named("writer-p"));
    let mut providers = ProviderRegistry::new();
    providers.register_chat(researcher_provider.clone());
    providers.register_chat(writer_provider.clone());

    let mut researcher = AgentDefinition::new("a-res", "Researcher");
    researcher.provider = Some("researcher-p".into());
    let mut writer = AgentDefinition::new("a-wri", "Writer");
    writer.provider = Some("writer-p".into());

    let runtime = Runtime::builder(store.clone())
        .providers(providers)
        .agents(vec![researcher, writer])
        .build()
        .unwrap();

    let (events, _) = collect_run(
        &runtime,
        RunMessage::text(
            Sender::user("Alex"),
            ThreadSpec::by_external_id(unique("mention-route")),
            "@Writer, hello",
        ),
    )
    .await;

    let llm_calls: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::LlmCall { .. }))
        .collect();
    assert_eq!(llm_calls.len(), 1);
    let StreamEvent::LlmCall { payload, .. } = llm_calls[0] else {
        unreachable!()
    };
    assert_eq!(payload.agent_name, "Writer");
    assert_eq!(*writer_provider.calls.lock(), 1);
    assert_eq!(*researcher_provider.calls.lock(), 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Multi-agent chain via the target queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn multi_agent_chain_hands_off_via_target_queue() {
    let Some(store) = pg_store().await else { return };

    let researcher_provider = Arc::new(
        ScriptedChatProvider::new(vec![ScriptedChatProvider::text_script(
            "Findings ready for handoff.",
        )])
        .named("researcher-p"),
    );
    let writer_provider = Arc::new(
        ScriptedChatProvider::new(vec![ScriptedChatProvider::text_script(
            "@Alex here is the final draft.",
        )])
        .named("writer-p"),
    );
    let mut providers = ProviderRegistry::new();
    providers.register_chat(researcher_provider.clone());
    providers.register_chat(writer_provider.clone());

    let mut researcher = AgentDefinition::new("a-res", "Researcher");
    researcher.provider = Some("researcher-p".into());
    let mut writer = AgentDefinition::new("a-wri", "Writer");
    writer.provider = Some("writer-p".into());

    let runtime = Runtime::builder(store.clone())
        .providers(providers)
        .agents(vec![researcher, writer])
        .build()
        .unwrap();

    let (events, _) = collect_run(
        &runtime,
        RunMessage::text(
            Sender::user("Alex"),
            ThreadSpec::by_external_id(unique("chain")),
            "@Researcher and @Writer, collaborate on this",
        ),
    )
    .await;

    let llm_calls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::LlmCall { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(llm_calls.len(), 2, "researcher then writer");
    assert_eq!(llm_calls[0].agent_name, "Researcher");
    assert_eq!(llm_calls[0].target_queue, vec!["Writer".to_string()]);
    assert_eq!(llm_calls[1].agent_name, "Writer");

    // Researcher's reply (no mentions) was routed to the queued Writer.
    let researcher_msg = events.iter().find_map(|e| match e {
        StreamEvent::NewMessage { message, metadata, .. }
            if message.sender.name.as_deref() == Some("Researcher") =>
        {
            Some(metadata.clone())
        }
        _ => None,
    });
    assert_eq!(researcher_msg.unwrap()["target_id"], "Writer");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool batch: shared batch id, single follow-up LLM call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_batch_completes_with_single_followup() {
    let Some(store) = pg_store().await else { return };

    let provider = Arc::new(ScriptedChatProvider::new(vec![
        ScriptedChatProvider::tool_script(
            "",
            vec![
                ("c1", "echo", serde_json::json!({ "text": "one" })),
                ("c2", "echo", serde_json::json!({ "text": "two" })),
            ],
        ),
        ScriptedChatProvider::text_script("Both tools are done."),
    ]));
    let mut providers = ProviderRegistry::new();
    providers.register_chat(provider.clone());

    let runtime = Runtime::builder(store.clone())
        .providers(providers)
        .agent(AgentDefinition::new("a1", "Assistant"))
        .tool(Arc::new(EchoTool))
        .build()
        .unwrap();

    let (events, thread_id) = collect_run(
        &runtime,
        RunMessage::text(
            Sender::user("Alex"),
            ThreadSpec::by_external_id(unique("tool-batch")),
            "run both tools please",
        ),
    )
    .await;

    let tool_events: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolCall {
                batch_id,
                batch_size,
                batch_index,
                ..
            } => Some((batch_id.clone(), *batch_size, *batch_index)),
            _ => None,
        })
        .collect();
    assert_eq!(tool_events.len(), 2);
    assert_eq!(tool_events[0].0, tool_events[1].0);
    assert!(tool_events[0].0.is_some());
    assert_eq!(tool_events[0].1, Some(2));
    let mut indexes: Vec<u32> = tool_events.iter().filter_map(|t| t.2).collect();
    indexes.sort_unstable();
    assert_eq!(indexes, vec![0, 1]);

    // Exactly one follow-up call after the batch (two total).
    let llm_count = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::LlmCall { .. }))
        .count();
    assert_eq!(llm_count, 2);
    assert_eq!(*provider.calls.lock(), 2);

    // user + agent(toolCalls) + 2 tool results + final answer.
    assert_eq!(store.message_count(&thread_id).await.unwrap(), 5);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool batch: an error terminates the batch immediately
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_batch_error_terminates_batch() {
    let Some(store) = pg_store().await else { return };

    // First call errors; a successful sibling is still in flight. The
    // follow-up must fire on the error, not wait for the sibling —
    // errors never bump the completion counter, so waiting for
    // `completed == size` here would never resolve.
    let provider = Arc::new(ScriptedChatProvider::new(vec![
        ScriptedChatProvider::tool_script(
            "",
            vec![
                ("c1", "always_fails", serde_json::json!({})),
                ("c2", "echo", serde_json::json!({ "text": "late" })),
            ],
        ),
        ScriptedChatProvider::text_script("One tool failed; carrying on."),
    ]));
    let mut providers = ProviderRegistry::new();
    providers.register_chat(provider.clone());

    let runtime = Runtime::builder(store.clone())
        .providers(providers)
        .agent(AgentDefinition::new("a1", "Assistant"))
        .tool(Arc::new(EchoTool))
        .tool(Arc::new(FailingTool))
        .build()
        .unwrap();

    let (events, thread_id) = collect_run(
        &runtime,
        RunMessage::text(
            Sender::user("Alex"),
            ThreadSpec::by_external_id(unique("tool-batch-error")),
            "run both tools please",
        ),
    )
    .await;

    // The error result reached the stream, flagged as such.
    let error_result = events.iter().find_map(|e| match e {
        StreamEvent::NewMessage { message, .. }
            if message.sender.name.as_deref() == Some("always_fails") =>
        {
            Some(message.clone())
        }
        _ => None,
    });
    let error_result = error_result.expect("error tool result on the stream");
    assert!(error_result.content.contains("tool exploded"));
    assert_eq!(error_result.metadata["is_error"], true);

    // Exactly one follow-up (terminator), despite the unfinished count.
    let llm_count = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::LlmCall { .. }))
        .count();
    assert_eq!(llm_count, 2, "initial call + the error-triggered follow-up");
    assert_eq!(*provider.calls.lock(), 2);

    // user + agent(toolCalls) + 2 tool results + final answer: the
    // successful sibling still persists after termination.
    assert_eq!(store.message_count(&thread_id).await.unwrap(), 5);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lease steal after expiry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn expired_lease_is_stolen() {
    let Some(store) = pg_store().await else { return };

    let thread = store
        .find_or_create_thread(&ThreadSpec::by_external_id(unique("lease-steal")), None)
        .await
        .unwrap();

    // Worker A holds a 1-second lease and "crashes" (never renews).
    assert!(store
        .acquire_lease(&thread.id, None, "worker-a", Duration::from_secs(1))
        .await
        .unwrap());
    // While valid, B cannot take it.
    assert!(!store
        .acquire_lease(&thread.id, None, "worker-b", Duration::from_secs(30))
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // Expired: B steals the lease; A's renewal is rejected.
    assert!(store
        .acquire_lease(&thread.id, None, "worker-b", Duration::from_secs(30))
        .await
        .unwrap());
    assert!(!store
        .renew_lease(&thread.id, "worker-a", Duration::from_secs(30))
        .await
        .unwrap());

    store.release_lease(&thread.id, "worker-b").await.unwrap();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Idempotent ingest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn rag_ingest_deduplicates_by_content_hash() {
    let Some(store) = pg_store().await else { return };

    let mut providers = ProviderRegistry::new();
    providers.register_embedding(Arc::new(MockEmbeddingProvider::new(1536)));
    let runtime = Runtime::builder(store.clone())
        .providers(providers)
        .build()
        .unwrap();

    let namespace = unique("acme:global");
    let source = format!("text:hello world. this sentence pads the chunk out. {namespace}");
    let options = || RunOptions {
        namespace: Some(namespace.clone()),
        ..Default::default()
    };
    let thread = ThreadSpec::by_external_id(unique("ingest-dedup"));

    for _ in 0..2 {
        let mut handle = runtime
            .ingest(
                thread.clone(),
                IngestRequest {
                    source: source.clone(),
                    mime_type: None,
                    strategy: None,
                    chunk_size: None,
                    overlap: None,
                    metadata: serde_json::Value::Null,
                },
                options(),
            )
            .await
            .unwrap();
        handle.done().await.unwrap();
    }

    use sha2::Digest;
    let hash = hex::encode(sha2::Sha256::digest(
        source.trim_start_matches("text:").as_bytes(),
    ));
    let document = store
        .find_document(&namespace, &hash)
        .await
        .unwrap()
        .expect("document exists");
    assert_eq!(
        document.status,
        cf_domain::graph::DocumentStatus::Ready
    );
    let chunks = store.chunk_count(&document.id).await.unwrap();
    assert!(chunks >= 1);
    assert_eq!(i64::from(document.chunk_count.unwrap()), chunks, "not re-chunked");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue ordering and status transitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn dequeue_order_is_priority_then_fifo() {
    let Some(store) = pg_store().await else { return };

    let thread = store
        .find_or_create_thread(&ThreadSpec::by_external_id(unique("ordering")), None)
        .await
        .unwrap();

    let draft = |content: &str, priority: i32| {
        EventDraft::new(EventPayload::NewMessage(user_payload("Alex", content)))
            .with_priority(priority)
    };
    store
        .add_batch_to_queue(
            &thread.id,
            None,
            vec![
                draft("first-normal", 0),
                draft("second-normal", 0),
                draft("urgent", 5),
            ],
        )
        .await
        .unwrap();

    let order: Vec<String> = {
        let mut out = Vec::new();
        while let Some(event) = store.dequeue(&thread.id, None).await.unwrap() {
            out.push(event.new_message().unwrap().content.clone());
            store.ack(&event.id).await.unwrap();
        }
        out
    };
    assert_eq!(order, vec!["urgent", "first-normal", "second-normal"]);
}

#[tokio::test]
async fn event_status_path_and_ttl_expiry() {
    let Some(store) = pg_store().await else { return };

    let thread = store
        .find_or_create_thread(&ThreadSpec::by_external_id(unique("ttl")), None)
        .await
        .unwrap();

    // TTL'd event expires instead of dispatching.
    let stale = store
        .add_to_queue(
            &thread.id,
            None,
            EventDraft::new(EventPayload::NewMessage(user_payload("Alex", "stale")))
                .with_ttl_ms(50),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(store.dequeue(&thread.id, None).await.unwrap().is_none());
    store.expire_pending(&thread.id, None).await.unwrap();
    let stale = store.event(&stale.id).await.unwrap().unwrap();
    assert_eq!(stale.status, cf_domain::event::EventStatus::Expired);

    // Normal path: pending → processing → completed.
    let live = store
        .add_to_queue(
            &thread.id,
            None,
            EventDraft::new(EventPayload::NewMessage(user_payload("Alex", "live"))),
        )
        .await
        .unwrap();
    assert_eq!(live.status, cf_domain::event::EventStatus::Pending);
    let claimed = store.dequeue(&thread.id, None).await.unwrap().unwrap();
    assert_eq!(claimed.id, live.id);
    assert_eq!(claimed.status, cf_domain::event::EventStatus::Processing);
    store.ack(&claimed.id).await.unwrap();
    let finished = store.event(&claimed.id).await.unwrap().unwrap();
    assert_eq!(finished.status, cf_domain::event::EventStatus::Completed);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lease acquisition reopens stranded `processing` events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn crash_recovery_reopens_processing_events() {
    let Some(store) = pg_store().await else { return };

    let thread = store
        .find_or_create_thread(&ThreadSpec::by_external_id(unique("recover")), None)
        .await
        .unwrap();
    store
        .add_to_queue(
            &thread.id,
            None,
            EventDraft::new(EventPayload::NewMessage(user_payload("Alex", "orphan"))),
        )
        .await
        .unwrap();

    // Worker A claims the event, then "crashes" without acking.
    assert!(store
        .acquire_lease(&thread.id, None, "worker-a", Duration::from_secs(1))
        .await
        .unwrap());
    let claimed = store.dequeue(&thread.id, None).await.unwrap().unwrap();
    assert_eq!(claimed.status, cf_domain::event::EventStatus::Processing);

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // B's acquisition resets the stranded event to pending.
    assert!(store
        .acquire_lease(&thread.id, None, "worker-b", Duration::from_secs(30))
        .await
        .unwrap());
    let reopened = store.dequeue(&thread.id, None).await.unwrap().unwrap();
    assert_eq!(reopened.id, claimed.id);
    store.ack(&reopened.id).await.unwrap();
    store.release_lease(&thread.id, "worker-b").await.unwrap();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entity extraction: auto-merge on identical surface forms
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn entity_extraction_merges_duplicates() {
    let Some(store) = pg_store().await else { return };

    let entities_json = r#"{"entities":[{"name":"Acme Corp","type":"organization"}]}"#;
    let chat = Arc::new(ScriptedChatProvider::new(vec![ScriptedChatProvider::text_script(
        "Noted, Acme Corp is on file.",
    )]));
    let extraction = Arc::new(
        ScriptedChatProvider::new(vec![
            ScriptedChatProvider::text_script(entities_json),
            ScriptedChatProvider::text_script(entities_json),
        ])
        .named("extraction-p"),
    );

    let mut providers = ProviderRegistry::new();
    providers.register_chat(chat);
    providers.register_chat(extraction.clone());
    providers.assign_role(cf_providers::registry::role::EXTRACTION, "extraction-p");
    providers.register_embedding(Arc::new(MockEmbeddingProvider::new(1536)));

    let mut config = cf_domain::config::RuntimeConfig::default();
    config.entity_extraction.enabled = true;

    let namespace = unique("extract:global");
    let runtime = Runtime::builder(store.clone())
        .providers(providers)
        .agent(AgentDefinition::new("a1", "Assistant"))
        .config(config)
        .build()
        .unwrap();

    let mut handle = runtime
        .run(
            RunMessage::text(
                Sender::user("Alex"),
                ThreadSpec::by_external_id(unique("entity")),
                "Acme Corp shipped the release.",
            ),
            RunOptions {
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    handle.collect_events().await;
    handle.done().await.unwrap();

    // Both extraction passes (user + agent message) resolved to ONE
    // entity node with two MENTIONS edges worth of bookkeeping.
    let embedder = MockEmbeddingProvider::new(1536);
    use cf_providers::EmbeddingProvider;
    let probe = embedder.embed_one("Acme Corp").await.unwrap();
    let matches = store
        .search_nodes(&probe, &[namespace], None, 10, 0.9)
        .await
        .unwrap();
    let entity_nodes: Vec<_> = matches
        .iter()
        .filter(|m| m.node.node_type == "entity")
        .collect();
    assert_eq!(entity_nodes.len(), 1, "duplicates merged");
    assert_eq!(
        entity_nodes[0].node.data["mention_count"].as_i64().unwrap(),
        2
    );
}
