//! Message persistence with graph dual-write.
//!
//! Every message row gets exactly one `node(type = message)`, and
//! consecutive messages in a thread are linked `previous --REPLIED_BY-->
//! current`. All of it commits in one transaction; re-running with the
//! same message id is a no-op (crash-recovery idempotency).

use pgvector::Vector;
use sqlx::postgres::PgRow;
use sqlx::Row;

use cf_domain::chat::ToolCall;
use cf_domain::error::{Error, Result};
use cf_domain::graph::node_type;
use cf_domain::message::{Attachment, MessageRecord, SenderType};

use crate::{db, Store};

/// Input to [`Store::create_message`]. Supplying `id` makes the write
/// idempotent on that key (the runtime passes the originating event id).
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: Option<String>,
    pub sender_id: String,
    pub sender_type: SenderType,
    pub sender_name: Option<String>,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub metadata: serde_json::Value,
}

/// Result of a dual-write: the stored row, its graph node, and whether
/// this call actually inserted (false = idempotent replay).
#[derive(Debug, Clone)]
pub struct CreatedMessage {
    pub message: MessageRecord,
    pub node_id: String,
    pub was_insert: bool,
}

impl Store {
    pub async fn create_message(
        &self,
        thread_id: &str,
        namespace: &str,
        draft: MessageDraft,
        embedding: Option<Vec<f32>>,
    ) -> Result<CreatedMessage> {
        let message_id = draft.id.clone().unwrap_or_else(cf_domain::new_id);
        let metadata = if draft.metadata.is_null() {
            serde_json::json!({})
        } else {
            draft.metadata.clone()
        };
        let tool_calls_json = if draft.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&draft.tool_calls)?)
        };
        let attachments_json = if draft.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&draft.attachments)?)
        };

        let mut tx = self.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO messages
                 (id, thread_id, sender_id, sender_type, sender_name, content,
                  tool_calls, tool_call_id, attachments, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&message_id)
        .bind(thread_id)
        .bind(&draft.sender_id)
        .bind(draft.sender_type.as_str())
        .bind(&draft.sender_name)
        .bind(&draft.content)
        .bind(&tool_calls_json)
        .bind(&draft.tool_call_id)
        .bind(&attachments_json)
        .bind(&metadata)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        let was_insert = inserted.rows_affected() == 1;

        if was_insert {
            // Previous message in the thread, for the REPLIED_BY link.
            let prev_msg_id: Option<String> = sqlx::query(
                "SELECT id FROM messages
                 WHERE thread_id = $1 AND id <> $2
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
            )
            .bind(thread_id)
            .bind(&message_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?
            .map(|r| r.get("id"));

            let node_id = cf_domain::new_id();
            let display_name = draft
                .sender_name
                .clone()
                .unwrap_or_else(|| draft.sender_id.clone());
            let node_data = serde_json::json!({
                "message_id": message_id,
                "thread_id": thread_id,
                "sender_id": draft.sender_id,
                "sender_type": draft.sender_type.as_str(),
            });
            sqlx::query(
                "INSERT INTO nodes
                     (id, namespace, type, name, content, embedding, data,
                      source_type, source_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'message', $8)
                 ON CONFLICT DO NOTHING",
            )
            .bind(&node_id)
            .bind(namespace)
            .bind(node_type::MESSAGE)
            .bind(&display_name)
            .bind(&draft.content)
            .bind(embedding.map(Vector::from))
            .bind(&node_data)
            .bind(&message_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

            if let Some(prev_id) = prev_msg_id {
                let prev_node: Option<String> = sqlx::query(
                    "SELECT id FROM nodes WHERE type = $1 AND source_id = $2",
                )
                .bind(node_type::MESSAGE)
                .bind(&prev_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?
                .map(|r| r.get("id"));

                if let Some(prev_node_id) = prev_node {
                    sqlx::query(
                        "INSERT INTO edges (id, source_node_id, target_node_id, type, data)
                         VALUES ($1, $2, $3, $4, '{}')
                         ON CONFLICT DO NOTHING",
                    )
                    .bind(cf_domain::new_id())
                    .bind(&prev_node_id)
                    .bind(&node_id)
                    .bind(cf_domain::graph::edge_type::REPLIED_BY)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                }
            }
        }

        // Read back (covers both fresh inserts and idempotent replays).
        let row = sqlx::query("SELECT * FROM messages WHERE id = $1")
            .bind(&message_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db)?;
        let node_id: String = sqlx::query(
            "SELECT id FROM nodes WHERE type = $1 AND source_id = $2",
        )
        .bind(node_type::MESSAGE)
        .bind(&message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?
        .map(|r| r.get("id"))
        .ok_or_else(|| {
            Error::Database(format!("message {message_id} has no graph node"))
        })?;

        tx.commit().await.map_err(db)?;

        Ok(CreatedMessage {
            message: message_from_row(&row)?,
            node_id,
            was_insert,
        })
    }

    /// The most recent `limit` messages, oldest first.
    pub async fn list_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            "SELECT * FROM (
                 SELECT * FROM messages
                 WHERE thread_id = $1
                 ORDER BY created_at DESC, id DESC
                 LIMIT $2
             ) recent
             ORDER BY created_at ASC, id ASC",
        )
        .bind(thread_id)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        rows.iter().map(message_from_row).collect()
    }

    /// The graph node mirroring a message, if the dual-write happened.
    pub async fn message_node_id(&self, message_id: &str) -> Result<Option<String>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT id FROM nodes WHERE type = $1 AND source_id = $2")
            .bind(node_type::MESSAGE)
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(row.map(|r| r.get("id")))
    }

    pub async fn message_count(&self, thread_id: &str) -> Result<i64> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(row.get::<i64, _>("n"))
    }
}

pub(crate) fn message_from_row(row: &PgRow) -> Result<MessageRecord> {
    let sender_type: String = row.get("sender_type");
    let tool_calls: Vec<ToolCall> = row
        .get::<Option<serde_json::Value>, _>("tool_calls")
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let attachments: Vec<Attachment> = row
        .get::<Option<serde_json::Value>, _>("attachments")
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    Ok(MessageRecord {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        sender_id: row.get("sender_id"),
        sender_type: SenderType::parse(&sender_type)
            .ok_or_else(|| Error::Database(format!("unknown sender type: {sender_type}")))?,
        sender_name: row.get("sender_name"),
        content: row.get("content"),
        tool_calls,
        tool_call_id: row.get("tool_call_id"),
        attachments,
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    })
}
