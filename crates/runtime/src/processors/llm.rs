//! The agent turn: stream a chat completion, forward tokens live,
//! assemble tool calls, and emit the agent's message with routing.

use std::collections::HashMap;

use futures_util::StreamExt;

use cf_domain::chat::ToolCall;
use cf_domain::error::{Error, Result};
use cf_domain::event::{Event, EventDraft, EventPayload, EventType};
use cf_domain::message::{MessagePayload, Sender};
use cf_domain::routing::{resolve_route, strip_self_prefix};
use cf_domain::stream::StreamEvent;
use cf_providers::{ChatRequest, ChatStreamEvent};

use crate::registry::{Processor, ProcessorContext};

pub struct LlmProcessor;

#[async_trait::async_trait]
impl Processor for LlmProcessor {
    fn name(&self) -> &str {
        "llm"
    }

    fn event_type(&self) -> EventType {
        EventType::LlmCall
    }

    async fn process(&self, event: &Event, ctx: &ProcessorContext) -> Result<Vec<EventDraft>> {
        let payload = event.llm_call()?;
        let provider = ctx
            .deps
            .providers
            .chat_for(payload.config.provider.as_deref())?;

        // ── Resolve asset refs (or strip media) before the wire ──────
        let messages = match (&ctx.deps.assets, ctx.deps.config.assets.resolve_in_llm) {
            (Some(assets), true) => {
                cf_assets::resolve_asset_refs_in_messages(&payload.messages, assets.as_ref()).await
            }
            _ => cf_assets::strip_media_parts(&payload.messages),
        };

        let request = ChatRequest {
            messages,
            tools: payload.tools.clone(),
            temperature: payload.config.temperature,
            max_tokens: payload.config.max_tokens,
            json_mode: false,
            model: payload.config.model.clone(),
        };

        // One retry for transport failures at connection time; errors
        // mid-stream fail the event (the caller saw partial tokens).
        let mut stream = match provider.chat_stream(request.clone()).await {
            Ok(stream) => stream,
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "provider connect failed; retrying once");
                provider.chat_stream(request).await?
            }
            Err(e) => return Err(e),
        };

        let mut text_buf = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        // call_id → (tool_name, partial args json)
        let mut assembling: HashMap<String, (String, String)> = HashMap::new();

        while let Some(item) = stream.next().await {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match item? {
                ChatStreamEvent::Token { text } => {
                    ctx.sink.emit(StreamEvent::Token {
                        thread_id: ctx.thread_id.clone(),
                        agent_name: payload.agent_name.clone(),
                        token: text.clone(),
                        is_complete: false,
                    });
                    text_buf.push_str(&text);
                }
                ChatStreamEvent::ToolCallStarted { call_id, tool_name } => {
                    assembling.insert(call_id, (tool_name, String::new()));
                }
                ChatStreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = assembling.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                ChatStreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    assembling.remove(&call_id);
                    tool_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                ChatStreamEvent::Done { .. } => {}
                ChatStreamEvent::Error { message } => {
                    return Err(Error::Provider {
                        provider: provider.provider_id().to_string(),
                        message,
                    });
                }
            }
        }

        // Calls that only came through start/delta (some providers never
        // send a finish event). Unparseable arguments default to `{}`.
        for (call_id, (tool_name, args)) in assembling.drain() {
            let arguments = if args.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&args).unwrap_or_else(|e| {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %tool_name,
                        error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object"
                    );
                    serde_json::Value::Object(Default::default())
                })
            };
            tool_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        // Exactly one completion sentinel per call.
        ctx.sink.emit(StreamEvent::Token {
            thread_id: ctx.thread_id.clone(),
            agent_name: payload.agent_name.clone(),
            token: String::new(),
            is_complete: true,
        });

        let answer = strip_self_prefix(&text_buf, &payload.agent_name)
            .trim()
            .to_string();

        // Ids for providers that omit them.
        for call in &mut tool_calls {
            if call.call_id.is_empty() {
                call.call_id = cf_domain::new_opaque_id();
            }
        }

        let routing = resolve_route(
            &answer,
            &payload.target_queue,
            payload.source_sender_id.as_deref(),
        );

        let mut metadata = serde_json::json!({});
        routing.apply_to(&mut metadata);
        {
            let obj = metadata.as_object_mut().expect("metadata is an object");
            if tool_calls.len() > 1 {
                obj.insert(
                    "batch_id".into(),
                    serde_json::json!(cf_domain::new_opaque_id()),
                );
                obj.insert("batch_size".into(), serde_json::json!(tool_calls.len()));
            }
            obj.insert(
                "chain_depth".into(),
                serde_json::json!(super::message::chain_depth_of(&event.metadata)),
            );
        }

        let message = MessagePayload {
            content: answer,
            sender: Sender::agent(payload.agent_id.clone(), payload.agent_name.clone()),
            tool_calls,
            tool_call_id: None,
            attachments: Vec::new(),
            metadata: metadata.clone(),
        };

        Ok(vec![EventDraft::new(EventPayload::NewMessage(message))
            .with_parent(event.id.clone())
            .with_trace(event.trace_id.clone())
            .with_metadata(metadata)])
    }
}
