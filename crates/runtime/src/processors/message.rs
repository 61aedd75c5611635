//! New-message intake: the single persistence point for every message
//! (user, agent, system, tool) and the router that decides what runs
//! next — an agent turn, a tool fan-out, or nothing.

use base64::Engine;

use cf_domain::chat::ChatMessage;
use cf_domain::error::Result;
use cf_domain::event::{
    Event, EventDraft, EventPayload, EntityExtractPayload, EventType, LlmCallConfig,
    LlmCallPayload, ToolCallPayload,
};
use cf_domain::message::{Attachment, MessagePayload, RoutingMeta, SenderType};
use cf_domain::routing::extract_mentions;
use cf_domain::stream::StreamEvent;
use cf_domain::agent::{AgentDefinition, RagMode};
use cf_store::documents::ChunkSearch;
use cf_store::messages::MessageDraft;

use crate::registry::{Processor, ProcessorContext};
use super::history::{build_history, HistoryOptions};

/// Read `chain_depth` out of an event metadata object.
pub(crate) fn chain_depth_of(metadata: &serde_json::Value) -> u64 {
    metadata
        .get("chain_depth")
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

pub struct MessageProcessor;

#[async_trait::async_trait]
impl Processor for MessageProcessor {
    fn name(&self) -> &str {
        "message"
    }

    fn event_type(&self) -> EventType {
        EventType::NewMessage
    }

    async fn process(&self, event: &Event, ctx: &ProcessorContext) -> Result<Vec<EventDraft>> {
        let payload = event.new_message()?.clone();
        let namespace = ctx.namespace_or_default();

        // ── 1. Asset intake: store inline attachments, swap to refs ──
        let attachments = self.intake_attachments(&payload, ctx).await;

        // ── 2. Persist (idempotent on the event id) ──────────────────
        let sender_id = payload
            .sender
            .id
            .clone()
            .or_else(|| payload.sender.external_id.clone())
            .or_else(|| payload.sender.name.clone())
            .unwrap_or_else(|| "anonymous".into());

        let embedding = self.maybe_embed(&payload.content, ctx).await;
        let created = ctx
            .deps
            .store
            .create_message(
                &ctx.thread_id,
                &namespace,
                MessageDraft {
                    id: Some(event.id.clone()),
                    sender_id: sender_id.clone(),
                    sender_type: payload.sender.sender_type,
                    sender_name: payload.sender.name.clone(),
                    content: payload.content.clone(),
                    tool_calls: payload.tool_calls.clone(),
                    tool_call_id: payload.tool_call_id.clone(),
                    attachments,
                    metadata: payload.metadata.clone(),
                },
                embedding,
            )
            .await?;

        let mut produced = Vec::new();

        // ── 3. Best-effort side writes ───────────────────────────────
        if payload.sender.sender_type == SenderType::User {
            self.debounced_user_upsert(&payload, &namespace, ctx);
        }
        if created.was_insert
            && ctx.deps.config.entity_extraction.enabled
            && matches!(
                payload.sender.sender_type,
                SenderType::User | SenderType::Agent
            )
            && !payload.content.trim().is_empty()
        {
            produced.push(EventDraft::new(EventPayload::EntityExtract(
                EntityExtractPayload {
                    message_id: created.message.id.clone(),
                    node_id: created.node_id.clone(),
                    content: payload.content.clone(),
                    sender_name: payload.sender.name.clone(),
                },
            ))
            .with_parent(event.id.clone()));
        }

        // ── 4. Routing ───────────────────────────────────────────────
        if payload.sender.sender_type == SenderType::Agent && !payload.tool_calls.is_empty() {
            // Agent wants tools: fan out one TOOL_CALL per call.
            produced.extend(self.fan_out_tool_calls(event, &payload, &sender_id));
            return Ok(produced);
        }

        if payload.sender.sender_type == SenderType::Tool {
            // A tool result landed; maybe the batch is complete.
            if let Some(draft) = self.maybe_finish_batch(event, &payload, ctx).await? {
                produced.push(draft);
            }
            return Ok(produced);
        }

        let routing = self.resolve_target(&payload, ctx);
        let Some(target) = routing.target_id else {
            return Ok(produced);
        };
        let Some(agent) = ctx.deps.agents.find(&target) else {
            // Addressed to the user (or someone unknown): turn is over.
            tracing::debug!(target = %target, "routing target is not an agent; drain");
            return Ok(produced);
        };

        let Some(depth) = self.next_chain_depth(event, ctx) else {
            return Ok(produced);
        };
        let draft = self
            .build_llm_call(
                ctx,
                agent,
                &payload.content,
                Some(payload.sender.display_id().to_string()),
                routing.target_queue,
            )
            .await?
            .with_parent(event.id.clone())
            .with_trace(event.trace_id.clone())
            .with_metadata(serde_json::json!({ "chain_depth": depth }));
        produced.push(draft);
        Ok(produced)
    }
}

impl MessageProcessor {
    /// Depth of the next LLM call in this chain, or `None` when the
    /// ceiling is reached (runaway agent-to-agent loops stop here).
    fn next_chain_depth(&self, event: &Event, ctx: &ProcessorContext) -> Option<u64> {
        let depth = chain_depth_of(&event.metadata) + 1;
        if depth > u64::from(ctx.deps.config.max_chain_depth) {
            tracing::warn!(
                event_id = %event.id,
                depth,
                "chain depth ceiling reached; not scheduling another LLM call"
            );
            None
        } else {
            Some(depth)
        }
    }

    /// Resolve who this message is for: a user message goes to its
    /// first @mention, else to the first agent, else to whatever
    /// `metadata.target_id` says. Agent messages arrive pre-routed by
    /// the LLM processor.
    fn resolve_target(&self, payload: &MessagePayload, ctx: &ProcessorContext) -> RoutingMeta {
        let carried = RoutingMeta::from_metadata(&payload.metadata);
        match payload.sender.sender_type {
            SenderType::Agent => carried,
            _ => {
                let mentions = extract_mentions(&payload.content);
                if let Some((first, rest)) = mentions.split_first() {
                    RoutingMeta {
                        target_id: Some(first.clone()),
                        target_queue: rest.to_vec(),
                    }
                } else if let Some(first_agent) = ctx.deps.agents.first() {
                    RoutingMeta {
                        target_id: Some(first_agent.name.clone()),
                        target_queue: carried.target_queue,
                    }
                } else {
                    carried
                }
            }
        }
    }

    /// Store inline attachment bytes and replace them with `asset://`
    /// references. Failures leave the attachment inline.
    async fn intake_attachments(
        &self,
        payload: &MessagePayload,
        ctx: &ProcessorContext,
    ) -> Vec<Attachment> {
        let mut attachments = payload.attachments.clone();
        if !ctx.deps.config.assets.store_inline_attachments {
            return attachments;
        }
        let Some(assets) = &ctx.deps.assets else {
            return attachments;
        };

        for attachment in &mut attachments {
            if attachment.asset_ref.is_some() {
                continue;
            }
            let Some(data) = &attachment.data else {
                continue;
            };
            let raw = data
                .rsplit_once("base64,")
                .map(|(_, b64)| b64)
                .unwrap_or(data);
            let bytes = match base64::engine::general_purpose::STANDARD.decode(raw) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "attachment base64 undecodable; left inline");
                    continue;
                }
            };
            match assets.save(&bytes, &attachment.mime_type).await {
                Ok(saved) => {
                    let asset_ref =
                        cf_assets::build_asset_ref(ctx.namespace.as_deref(), &saved.asset_id);
                    ctx.sink.emit(StreamEvent::AssetCreated {
                        thread_id: ctx.thread_id.clone(),
                        asset_ref: asset_ref.clone(),
                        mime_type: attachment.mime_type.clone(),
                        size: saved.size,
                        kind: attachment.kind.clone(),
                    });
                    attachment.asset_ref = Some(asset_ref);
                    attachment.data = None;
                    attachment.size = Some(saved.size);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "asset save failed; attachment left inline");
                }
            }
        }
        attachments
    }

    /// Fire-and-forget user upsert, one per sender key per window.
    fn debounced_user_upsert(
        &self,
        payload: &MessagePayload,
        namespace: &str,
        ctx: &ProcessorContext,
    ) {
        let Some(external_id) = payload
            .sender
            .external_id
            .clone()
            .or_else(|| payload.sender.name.clone())
        else {
            return;
        };
        let key = format!("{namespace}:{external_id}");
        if !ctx.deps.upsert_debounce.should_run(&key) {
            return;
        }
        let store = ctx.deps.store.clone();
        let namespace = ctx.namespace.clone();
        let name = payload.sender.name.clone();
        let metadata = payload.sender.metadata.clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .upsert_user(&external_id, namespace.as_deref(), name.as_deref(), &metadata)
                .await
            {
                tracing::warn!(error = %e, %external_id, "user upsert failed");
            }
        });
    }

    /// One `TOOL_CALL` event per call, sharing the batch coordinates
    /// the LLM processor assigned.
    fn fan_out_tool_calls(
        &self,
        event: &Event,
        payload: &MessagePayload,
        agent_id: &str,
    ) -> Vec<EventDraft> {
        let batch_id = payload
            .metadata
            .get("batch_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                (payload.tool_calls.len() > 1).then(cf_domain::new_opaque_id)
            });
        let batch_size = (payload.tool_calls.len() > 1).then(|| payload.tool_calls.len() as u32);

        let depth = chain_depth_of(&event.metadata);
        payload
            .tool_calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                EventDraft::new(EventPayload::ToolCall(ToolCallPayload {
                    call: call.clone(),
                    agent_id: agent_id.to_string(),
                    batch_id: batch_size.and(batch_id.clone()),
                    batch_size,
                    batch_index: batch_size.map(|_| index as u32),
                }))
                .with_parent(event.id.clone())
                .with_trace(event.trace_id.clone())
                .with_metadata(serde_json::json!({ "chain_depth": depth }))
            })
            .collect()
    }

    /// Count a tool result against its batch; when the batch is done
    /// (or was never batched), emit the follow-up `LLM_CALL` so the
    /// agent observes the results. An error result terminates its
    /// batch: the follow-up goes out immediately instead of waiting on
    /// the remaining members, and those members no longer re-trigger.
    async fn maybe_finish_batch(
        &self,
        event: &Event,
        payload: &MessagePayload,
        ctx: &ProcessorContext,
    ) -> Result<Option<EventDraft>> {
        let meta = &payload.metadata;
        let agent_id = meta.get("agent_id").and_then(|v| v.as_str());
        let origin_event_id = meta.get("origin_event_id").and_then(|v| v.as_str());
        let batch_size = meta
            .get("batch_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        let is_error = meta
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let Some(agent_id) = agent_id else {
            tracing::warn!("tool result without agent_id; no follow-up call");
            return Ok(None);
        };

        // The origin (agent message) event carries both the batch
        // bookkeeping and the routing context for the follow-up.
        let origin_event = match origin_event_id {
            Some(origin) => ctx.deps.store.event(origin).await?,
            None => None,
        };

        if batch_size > 1 {
            let Some(origin) = origin_event_id else {
                tracing::warn!("batched tool result without origin_event_id");
                return Ok(None);
            };
            if is_error {
                if !ctx.deps.store.try_terminate_batch(origin).await? {
                    tracing::debug!("batch already terminated; no follow-up");
                    return Ok(None);
                }
                tracing::debug!(batch_size, "tool error terminates the batch");
            } else {
                let terminated = origin_event
                    .as_ref()
                    .and_then(|e| e.metadata.get("batch_terminated"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if terminated {
                    tracing::debug!("batch terminated by an earlier error; no follow-up");
                    return Ok(None);
                }
                let completed = ctx.deps.store.bump_batch_completed(origin).await?;
                if (completed as u64) < batch_size {
                    tracing::debug!(completed, batch_size, "batch still pending");
                    return Ok(None);
                }
            }
        }

        let Some(agent) = ctx.deps.agents.find(agent_id) else {
            tracing::warn!(agent_id, "tool result for unknown agent");
            return Ok(None);
        };

        // Routing context for the agent's post-tool answer: whatever
        // the original agent message was going to address.
        let (source_sender, queue) = match &origin_event {
            Some(origin_event) => {
                let routing = RoutingMeta::from_metadata(&origin_event.metadata);
                (routing.target_id, routing.target_queue)
            }
            None => (None, Vec::new()),
        };

        let Some(depth) = self.next_chain_depth(event, ctx) else {
            return Ok(None);
        };
        let draft = self
            .build_llm_call(ctx, agent, &payload.content, source_sender, queue)
            .await?
            .with_parent(event.id.clone())
            .with_trace(event.trace_id.clone())
            .with_metadata(serde_json::json!({ "chain_depth": depth }));
        Ok(Some(draft))
    }

    /// Assemble the full `LLM_CALL` payload for one agent: system
    /// prompt, optional RAG preamble, per-agent history, tool schemas.
    async fn build_llm_call(
        &self,
        ctx: &ProcessorContext,
        agent: &AgentDefinition,
        trigger_content: &str,
        source_sender_id: Option<String>,
        target_queue: Vec<String>,
    ) -> Result<EventDraft> {
        let deps = &ctx.deps;
        let records = deps
            .store
            .list_messages(&ctx.thread_id, deps.config.history.max_messages)
            .await?;

        let mut messages = Vec::with_capacity(records.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt(agent, ctx)));

        if let Some(preamble) = self.rag_preamble(agent, trigger_content, ctx).await {
            messages.push(ChatMessage::system(preamble));
        }

        let options = HistoryOptions {
            include_target_context: deps.config.history.include_target_context,
        };
        messages.extend(build_history(&records, agent, &deps.agents, &options));

        let tools = deps.tools.definitions_for(agent);

        Ok(EventDraft::new(EventPayload::LlmCall(LlmCallPayload {
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            messages,
            tools,
            config: LlmCallConfig {
                provider: agent.provider.clone(),
                model: agent.model.clone(),
                temperature: agent.temperature,
                max_tokens: agent.max_tokens,
            },
            source_sender_id,
            target_queue,
        })))
    }

    fn system_prompt(&self, agent: &AgentDefinition, ctx: &ProcessorContext) -> String {
        let mut prompt = if agent.instructions.is_empty() {
            format!("You are {}.", agent.name)
        } else {
            agent.instructions.clone()
        };
        let others: Vec<&str> = ctx
            .deps
            .agents
            .iter()
            .filter(|a| a.id != agent.id)
            .map(|a| a.name.as_str())
            .collect();
        if !others.is_empty() {
            prompt.push_str(&format!(
                "\n\nOther participants you can address with an @mention: {}.",
                others.join(", ")
            ));
        }
        prompt
    }

    /// Auto-RAG: fetch top-K relevant chunks for the triggering message
    /// and format them as a context block. Best-effort.
    async fn rag_preamble(
        &self,
        agent: &AgentDefinition,
        trigger_content: &str,
        ctx: &ProcessorContext,
    ) -> Option<String> {
        let rag = agent.rag.as_ref()?;
        if rag.mode != RagMode::Auto || trigger_content.trim().is_empty() {
            return None;
        }
        let embedder = ctx.deps.providers.embedding()?;
        let config = &ctx.deps.config.rag;

        let embedding = match embedder.embed_one(trigger_content).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "rag embedding failed; continuing without context");
                return None;
            }
        };
        let namespaces = if rag.namespaces.is_empty() {
            vec![ctx.namespace_or_default()]
        } else {
            rag.namespaces.clone()
        };
        let search = ChunkSearch::Hybrid {
            query: trigger_content.to_string(),
            semantic_weight: config.semantic_weight,
            keyword_weight: config.keyword_weight,
        };
        let matches = match ctx
            .deps
            .store
            .search_chunks(
                &namespaces,
                &embedding,
                &search,
                rag.top_k.unwrap_or(config.top_k),
                rag.min_similarity.unwrap_or(config.min_similarity),
            )
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!(error = %e, "rag search failed; continuing without context");
                return None;
            }
        };
        if matches.is_empty() {
            return None;
        }

        let mut block = String::from(
            "Relevant context from the knowledge base (use when helpful):\n",
        );
        for (i, m) in matches.iter().enumerate() {
            block.push_str(&format!("\n[{}] {}\n", i + 1, m.chunk.content.trim()));
        }
        Some(block)
    }

    pub(crate) async fn maybe_embed(
        &self,
        content: &str,
        ctx: &ProcessorContext,
    ) -> Option<Vec<f32>> {
        if !ctx.deps.config.embed_messages || content.trim().is_empty() {
            return None;
        }
        let embedder = ctx.deps.providers.embedding()?;
        match embedder.embed_one(content).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "message embedding failed");
                None
            }
        }
    }
}
