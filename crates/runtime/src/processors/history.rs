//! Per-agent conversation view.
//!
//! Each agent sees the same thread differently: its own messages are
//! `assistant`, everyone else's are `user` with a `[Name]:` prefix
//! (other agents included), tool results keep the `tool` role. The
//! mapping is deterministic: same records in, same messages out.

use cf_domain::agent::{AgentDefinition, AgentRoster};
use cf_domain::chat::{ChatMessage, ContentPart, MessageContent, Role};
use cf_domain::message::{Attachment, MessageRecord, RoutingMeta, SenderType};

pub struct HistoryOptions {
    pub include_target_context: bool,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            include_target_context: true,
        }
    }
}

/// Build the chat history `agent` sees for these records (chronological
/// order in, chronological order out).
pub fn build_history(
    records: &[MessageRecord],
    agent: &AgentDefinition,
    roster: &AgentRoster,
    options: &HistoryOptions,
) -> Vec<ChatMessage> {
    records
        .iter()
        .map(|record| build_item(record, agent, roster, options))
        .collect()
}

fn build_item(
    record: &MessageRecord,
    agent: &AgentDefinition,
    roster: &AgentRoster,
    options: &HistoryOptions,
) -> ChatMessage {
    if record.sender_type == SenderType::Tool {
        let mut msg = ChatMessage::tool_result(
            record.tool_call_id.clone().unwrap_or_default(),
            format!("[Tool Result]: {}", record.content),
        );
        msg.content = attach_parts(msg.content.extract_all_text(), &record.attachments);
        return msg;
    }

    let is_self = matches_agent(record, agent);
    if is_self {
        let mut msg =
            ChatMessage::assistant_with_tools(record.content.clone(), record.tool_calls.clone());
        msg.content = attach_parts(record.content.clone(), &record.attachments);
        return msg;
    }

    let sender = record
        .sender_name
        .clone()
        .unwrap_or_else(|| record.sender_id.clone());
    let mut text = format!("[{sender}]: {}", record.content);

    if options.include_target_context {
        let routing = RoutingMeta::from_metadata(&record.metadata);
        if let Some(target) = routing.target_id {
            if !key_matches(&target, agent) {
                let display = roster
                    .find(&target)
                    .map(|a| a.name.clone())
                    .unwrap_or(target);
                text.push_str(&format!("\n(addressed to: {display})"));
            }
        }
    }

    let mut msg = ChatMessage::user(text.clone());
    msg.content = attach_parts(text, &record.attachments);
    msg
}

fn matches_agent(record: &MessageRecord, agent: &AgentDefinition) -> bool {
    if record.sender_type != SenderType::Agent {
        return false;
    }
    key_matches(&record.sender_id, agent)
        || record
            .sender_name
            .as_deref()
            .is_some_and(|n| key_matches(n, agent))
}

fn key_matches(key: &str, agent: &AgentDefinition) -> bool {
    key.eq_ignore_ascii_case(&agent.id) || key.eq_ignore_ascii_case(&agent.name)
}

/// Fold attachments into content parts: `asset://` references and URLs
/// become image/file parts, inline base64 becomes a data URL, unknown
/// kinds fall back to a generic file part carrying the MIME type.
fn attach_parts(text: String, attachments: &[Attachment]) -> MessageContent {
    if attachments.is_empty() {
        return MessageContent::Text(text);
    }
    let mut parts = vec![ContentPart::Text { text }];
    for attachment in attachments {
        let url = if let Some(asset_ref) = &attachment.asset_ref {
            asset_ref.clone()
        } else if let Some(data) = &attachment.data {
            if data.starts_with("data:") {
                data.clone()
            } else {
                format!("data:{};base64,{data}", attachment.mime_type)
            }
        } else if let Some(url) = &attachment.url {
            url.clone()
        } else {
            continue;
        };

        parts.push(match attachment.kind.as_str() {
            "image" => ContentPart::Image {
                url,
                media_type: Some(attachment.mime_type.clone()),
            },
            _ => ContentPart::File {
                url,
                mime_type: attachment.mime_type.clone(),
            },
        });
    }
    MessageContent::Parts(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(
        sender_type: SenderType,
        sender_id: &str,
        sender_name: &str,
        content: &str,
    ) -> MessageRecord {
        MessageRecord {
            id: cf_domain::new_id(),
            thread_id: "t1".into(),
            sender_id: sender_id.into(),
            sender_type,
            sender_name: Some(sender_name.into()),
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            attachments: vec![],
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn writer() -> AgentDefinition {
        AgentDefinition::new("a-writer", "Writer")
    }

    fn roster() -> AgentRoster {
        AgentRoster::new(vec![
            AgentDefinition::new("a-researcher", "Researcher"),
            writer(),
        ])
    }

    #[test]
    fn own_messages_become_assistant() {
        let records = vec![
            record(SenderType::User, "u1", "Alex", "hi"),
            record(SenderType::Agent, "a-writer", "Writer", "hello Alex"),
        ];
        let history = build_history(&records, &writer(), &roster(), &Default::default());

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content.text(), Some("[Alex]: hi"));
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content.text(), Some("hello Alex"));
    }

    #[test]
    fn other_agents_read_as_prefixed_users() {
        let records = vec![record(
            SenderType::Agent,
            "a-researcher",
            "Researcher",
            "findings attached",
        )];
        let history = build_history(&records, &writer(), &roster(), &Default::default());

        assert_eq!(history[0].role, Role::User);
        assert_eq!(
            history[0].content.text(),
            Some("[Researcher]: findings attached")
        );
    }

    #[test]
    fn tool_results_keep_role_and_prefix() {
        let mut rec = record(SenderType::Tool, "save_asset", "save_asset", "{\"ok\":true}");
        rec.tool_call_id = Some("c1".into());
        let history = build_history(&[rec], &writer(), &roster(), &Default::default());

        assert_eq!(history[0].role, Role::Tool);
        assert_eq!(history[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(
            history[0].content.text(),
            Some("[Tool Result]: {\"ok\":true}")
        );
    }

    #[test]
    fn addressed_to_context_appended_for_other_targets() {
        let mut rec = record(SenderType::User, "u1", "Alex", "please review");
        rec.metadata = serde_json::json!({ "target_id": "Researcher" });
        let history = build_history(&[rec.clone()], &writer(), &roster(), &Default::default());
        assert_eq!(
            history[0].content.text(),
            Some("[Alex]: please review\n(addressed to: Researcher)")
        );

        // Addressed to the current agent: no annotation.
        rec.metadata = serde_json::json!({ "target_id": "Writer" });
        let history = build_history(&[rec.clone()], &writer(), &roster(), &Default::default());
        assert_eq!(history[0].content.text(), Some("[Alex]: please review"));

        // Disabled option: no annotation either.
        rec.metadata = serde_json::json!({ "target_id": "Researcher" });
        let opts = HistoryOptions {
            include_target_context: false,
        };
        let history = build_history(&[rec], &writer(), &roster(), &opts);
        assert_eq!(history[0].content.text(), Some("[Alex]: please review"));
    }

    #[test]
    fn attachments_become_parts() {
        let mut rec = record(SenderType::User, "u1", "Alex", "see image");
        rec.attachments = vec![
            Attachment {
                kind: "image".into(),
                mime_type: "image/png".into(),
                asset_ref: Some("asset://abc".into()),
                data: None,
                url: None,
                size: None,
            },
            Attachment {
                kind: "unknown-kind".into(),
                mime_type: "application/pdf".into(),
                asset_ref: None,
                data: Some("aGk=".into()),
                url: None,
                size: None,
            },
        ];
        let history = build_history(&[rec], &writer(), &roster(), &Default::default());

        let MessageContent::Parts(parts) = &history[0].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[1], ContentPart::Image { url, .. } if url == "asset://abc"));
        assert!(matches!(
            &parts[2],
            ContentPart::File { url, mime_type }
                if url == "data:application/pdf;base64,aGk=" && mime_type == "application/pdf"
        ));
    }

    #[test]
    fn deterministic_output() {
        let records = vec![
            record(SenderType::User, "u1", "Alex", "hi"),
            record(SenderType::Agent, "a-researcher", "Researcher", "hello"),
        ];
        let a = build_history(&records, &writer(), &roster(), &Default::default());
        let b = build_history(&records, &writer(), &roster(), &Default::default());
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
