//! Tool execution: look up the named tool, run it with a scoped
//! context, and emit the result as a tool message. Errors become error
//! results the agent can read; they never fail the event.

use cf_domain::error::Result;
use cf_domain::event::{Event, EventDraft, EventPayload, EventType};
use cf_domain::message::{MessagePayload, Sender, SenderType};

use crate::registry::{Processor, ProcessorContext};
use crate::tools::{Collections, ToolContext};

pub struct ToolProcessor;

#[async_trait::async_trait]
impl Processor for ToolProcessor {
    fn name(&self) -> &str {
        "tool"
    }

    fn event_type(&self) -> EventType {
        EventType::ToolCall
    }

    async fn process(&self, event: &Event, ctx: &ProcessorContext) -> Result<Vec<EventDraft>> {
        let payload = event.tool_call()?;
        let call = &payload.call;

        let (content, is_error) = match ctx.deps.tools.get(&call.tool_name) {
            Some(tool) => {
                let tool_ctx = ToolContext {
                    store: &ctx.deps.store,
                    thread_id: &ctx.thread_id,
                    sender_id: &payload.agent_id,
                    agents: &ctx.deps.agents,
                    tools: &ctx.deps.tools,
                    assets: ctx.deps.assets.as_deref(),
                    collections: Collections::new(
                        ctx.deps.store.clone(),
                        ctx.namespace_or_default(),
                    ),
                    metadata: &event.metadata,
                };
                match tool.execute(&tool_ctx, call.arguments.clone()).await {
                    Ok(value) => (serde_json::to_string(&value)?, false),
                    Err(e) => {
                        tracing::warn!(
                            tool = %call.tool_name,
                            error = %e,
                            "tool execution failed"
                        );
                        (
                            serde_json::json!({ "error": e.to_string() }).to_string(),
                            true,
                        )
                    }
                }
            }
            None => {
                tracing::warn!(tool = %call.tool_name, "unknown tool");
                (
                    serde_json::json!({
                        "error": format!("unknown tool: {}", call.tool_name)
                    })
                    .to_string(),
                    true,
                )
            }
        };

        // Batch bookkeeping rides on the tool message; the message
        // processor counts results and emits the follow-up LLM call.
        let mut metadata = serde_json::json!({
            "agent_id": payload.agent_id,
            "is_error": is_error,
        });
        {
            let obj = metadata.as_object_mut().expect("metadata is an object");
            if let Some(batch_id) = &payload.batch_id {
                obj.insert("batch_id".into(), serde_json::json!(batch_id));
            }
            if let Some(batch_size) = payload.batch_size {
                obj.insert("batch_size".into(), serde_json::json!(batch_size));
            }
            if let Some(batch_index) = payload.batch_index {
                obj.insert("batch_index".into(), serde_json::json!(batch_index));
            }
            if let Some(origin) = &event.parent_event_id {
                obj.insert("origin_event_id".into(), serde_json::json!(origin));
            }
            obj.insert(
                "chain_depth".into(),
                serde_json::json!(super::message::chain_depth_of(&event.metadata)),
            );
        }

        let message = MessagePayload {
            content,
            sender: Sender {
                id: Some(call.tool_name.clone()),
                external_id: None,
                sender_type: SenderType::Tool,
                name: Some(call.tool_name.clone()),
                metadata: serde_json::Value::Null,
            },
            tool_calls: Vec::new(),
            tool_call_id: Some(call.call_id.clone()),
            attachments: Vec::new(),
            metadata: metadata.clone(),
        };

        Ok(vec![EventDraft::new(EventPayload::NewMessage(message))
            .with_parent(event.id.clone())
            .with_trace(event.trace_id.clone())
            .with_metadata(metadata)])
    }
}
