//! Entity extraction: prompt an LLM for the entities a message
//! mentions, then deduplicate against the graph by embedding
//! similarity, with an LLM confirmation pass in the gray zone.

use serde::Deserialize;

use cf_domain::chat::ChatMessage;
use cf_domain::error::Result;
use cf_domain::event::{Event, EventDraft, EventType};
use cf_domain::graph::{edge_type, node_type, NodeMatch};
use cf_providers::registry::role;
use cf_providers::ChatRequest;
use cf_store::graph::NodeDraft;

use crate::registry::{Processor, ProcessorContext};

/// Entities above this many per message are ignored (prompt runaway).
const MAX_ENTITIES: usize = 16;

const EXTRACTION_PROMPT: &str = "Extract the named entities (people, \
organizations, projects, places, concepts) mentioned in the user's \
message. Respond with ONLY a JSON object of the form \
{\"entities\":[{\"name\":\"...\",\"type\":\"...\",\"description\":\"...\"}]} \
and nothing else. Use an empty list when there are none.";

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    entities: Vec<ExtractedEntity>,
}

#[derive(Debug, Deserialize)]
struct ExtractedEntity {
    name: String,
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SameResponse {
    same: bool,
}

pub struct EntityExtractProcessor;

#[async_trait::async_trait]
impl Processor for EntityExtractProcessor {
    fn name(&self) -> &str {
        "entity_extract"
    }

    fn event_type(&self) -> EventType {
        EventType::EntityExtract
    }

    async fn process(&self, event: &Event, ctx: &ProcessorContext) -> Result<Vec<EventDraft>> {
        let payload = match &event.payload {
            cf_domain::event::EventPayload::EntityExtract(p) => p,
            other => {
                return Err(cf_domain::Error::Validation(format!(
                    "expected ENTITY_EXTRACT payload, got {}",
                    other.event_type()
                )))
            }
        };

        // Extraction is enrichment; missing providers make it a no-op.
        let Ok(chat) = ctx.deps.providers.chat_for_role(role::EXTRACTION) else {
            tracing::debug!("no extraction provider; skipping");
            return Ok(Vec::new());
        };
        let Some(embedder) = ctx.deps.providers.embedding() else {
            tracing::debug!("no embedding provider; skipping extraction");
            return Ok(Vec::new());
        };

        let response = chat
            .chat(ChatRequest {
                messages: vec![
                    ChatMessage::system(EXTRACTION_PROMPT),
                    ChatMessage::user(payload.content.clone()),
                ],
                json_mode: true,
                ..Default::default()
            })
            .await?;

        let Some(parsed) = parse_strict::<ExtractionResponse>(&response.content) else {
            tracing::warn!(
                message_id = %payload.message_id,
                "extraction output unparseable; treating as no entities"
            );
            return Ok(Vec::new());
        };

        let namespace = ctx.namespace_or_default();
        let config = &ctx.deps.config.entity_extraction;
        let entity_types = [node_type::ENTITY.to_string()];

        for entity in parsed.entities.into_iter().take(MAX_ENTITIES) {
            let name = entity.name.trim();
            if name.is_empty() {
                continue;
            }
            let embed_text = match &entity.description {
                Some(d) if !d.trim().is_empty() => format!("{name}: {}", d.trim()),
                _ => name.to_string(),
            };
            let embedding = embedder.embed_one(&embed_text).await?;

            let matches = ctx
                .deps
                .store
                .search_nodes(
                    &embedding,
                    std::slice::from_ref(&namespace),
                    Some(&entity_types),
                    config.search_limit,
                    config.similarity_threshold,
                )
                .await?;

            let entity_node_id = match matches.first() {
                Some(best) if best.similarity >= config.auto_merge_threshold => {
                    self.merge_into(best, name, ctx).await?
                }
                Some(best) => {
                    if self.confirm_same(&chat, name, &entity, &best.node.name).await {
                        self.merge_into(best, name, ctx).await?
                    } else {
                        let node_id = self
                            .create_entity(&entity, &embedding, &namespace, payload, ctx)
                            .await?;
                        ctx.deps
                            .store
                            .create_edge(
                                &node_id,
                                &best.node.id,
                                edge_type::RELATED_TO,
                                serde_json::json!({ "similarity": best.similarity }),
                                best.similarity,
                            )
                            .await?;
                        node_id
                    }
                }
                None => {
                    self.create_entity(&entity, &embedding, &namespace, payload, ctx)
                        .await?
                }
            };

            // Source message --MENTIONS--> entity, with the surface form.
            ctx.deps
                .store
                .create_edge(
                    &payload.node_id,
                    &entity_node_id,
                    edge_type::MENTIONS,
                    serde_json::json!({
                        "extracted_name": name,
                        "context": truncate(&payload.content, 200),
                    }),
                    1.0,
                )
                .await?;
        }

        Ok(Vec::new())
    }
}

impl EntityExtractProcessor {
    /// Merge: record the surface form as an alias and bump the count.
    async fn merge_into(
        &self,
        matched: &NodeMatch,
        extracted_name: &str,
        ctx: &ProcessorContext,
    ) -> Result<String> {
        let node = &matched.node;
        let mut data = if node.data.is_object() {
            node.data.clone()
        } else {
            serde_json::json!({})
        };
        let obj = data.as_object_mut().expect("object ensured above");

        let count = obj
            .get("mention_count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        obj.insert("mention_count".into(), serde_json::json!(count + 1));

        if !extracted_name.eq_ignore_ascii_case(&node.name) {
            let mut aliases: Vec<String> = obj
                .get("aliases")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            if !aliases.iter().any(|a| a.eq_ignore_ascii_case(extracted_name)) {
                aliases.push(extracted_name.to_string());
                obj.insert("aliases".into(), serde_json::json!(aliases));
            }
        }

        ctx.deps.store.update_node_data(&node.id, &data).await?;
        Ok(node.id.clone())
    }

    async fn create_entity(
        &self,
        entity: &ExtractedEntity,
        embedding: &[f32],
        namespace: &str,
        payload: &cf_domain::event::EntityExtractPayload,
        ctx: &ProcessorContext,
    ) -> Result<String> {
        let node = ctx
            .deps
            .store
            .create_node(NodeDraft {
                namespace: namespace.to_string(),
                node_type: node_type::ENTITY.into(),
                name: entity.name.trim().to_string(),
                content: entity.description.clone(),
                embedding: Some(embedding.to_vec()),
                data: serde_json::json!({
                    "entity_type": entity.entity_type,
                    "mention_count": 1,
                    "aliases": [],
                }),
                source_type: Some("extraction".into()),
                source_id: Some(payload.message_id.clone()),
            })
            .await?;
        Ok(node.id)
    }

    /// Gray-zone dedup: ask the LLM whether two names denote the same
    /// entity. Unparseable output counts as "different".
    async fn confirm_same(
        &self,
        chat: &std::sync::Arc<dyn cf_providers::ChatProvider>,
        candidate: &str,
        entity: &ExtractedEntity,
        existing: &str,
    ) -> bool {
        let question = format!(
            "Are \"{candidate}\" ({}) and \"{existing}\" the same entity? \
             Respond with ONLY {{\"same\": true}} or {{\"same\": false}}.",
            entity.entity_type
        );
        match chat
            .chat(ChatRequest {
                messages: vec![ChatMessage::user(question)],
                json_mode: true,
                ..Default::default()
            })
            .await
        {
            Ok(response) => parse_strict::<SameResponse>(&response.content)
                .map(|r| r.same)
                .unwrap_or_else(|| {
                    tracing::warn!("same-entity confirmation unparseable; assuming different");
                    false
                }),
            Err(e) => {
                tracing::warn!(error = %e, "same-entity confirmation failed; assuming different");
                false
            }
        }
    }
}

/// Strict JSON parse, tolerating only a surrounding ``` fence.
fn parse_strict<T: serde::de::DeserializeOwned>(content: &str) -> Option<T> {
    let trimmed = content.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed);
    serde_json::from_str(inner.trim()).ok()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_parse_accepts_plain_and_fenced() {
        let plain = r#"{"entities":[{"name":"Ada","type":"person"}]}"#;
        let parsed: ExtractionResponse = parse_strict(plain).unwrap();
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].name, "Ada");

        let fenced = format!("```json\n{plain}\n```");
        let parsed: ExtractionResponse = parse_strict(&fenced).unwrap();
        assert_eq!(parsed.entities[0].entity_type, "person");
    }

    #[test]
    fn strict_parse_rejects_prose() {
        let prose = "Sure! Here are the entities: Ada (person).";
        assert!(parse_strict::<ExtractionResponse>(prose).is_none());
        // Regex-over-JSON leniency is exactly what we do not do.
        let partial = r#"The JSON is {"entities": []} as requested."#;
        assert!(parse_strict::<ExtractionResponse>(partial).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("short", 10), "short");
    }
}
