//! The durable event queue.
//!
//! Dequeue is only ever called by the thread's lease holder; the
//! `FOR UPDATE SKIP LOCKED` is belt-and-braces against concurrent
//! sweeps, not the exclusivity mechanism (the lease is).

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use cf_domain::error::Result;
use cf_domain::event::{Event, EventDraft, EventPayload, EventStatus, EventType};

use crate::{db, Store};

impl Store {
    /// Insert one pending event. `expires_at` is computed from `ttl_ms`
    /// at insert time.
    pub async fn add_to_queue(
        &self,
        thread_id: &str,
        namespace: Option<&str>,
        draft: EventDraft,
    ) -> Result<Event> {
        let mut tx = self.begin().await?;
        let event = insert_event(&mut tx, thread_id, namespace, draft).await?;
        tx.commit().await.map_err(db)?;
        Ok(event)
    }

    /// Insert a batch of events atomically: either all become visible to
    /// the next dequeue, or none do.
    pub async fn add_batch_to_queue(
        &self,
        thread_id: &str,
        namespace: Option<&str>,
        drafts: Vec<EventDraft>,
    ) -> Result<Vec<Event>> {
        let mut tx = self.begin().await?;
        let mut events = Vec::with_capacity(drafts.len());
        for draft in drafts {
            events.push(insert_event(&mut tx, thread_id, namespace, draft).await?);
        }
        tx.commit().await.map_err(db)?;
        Ok(events)
    }

    /// Claim the next pending event: `(priority DESC, created_at ASC,
    /// id ASC)` within the thread + namespace, skipping expired rows.
    /// The claimed event transitions to `processing`.
    pub async fn dequeue(&self, thread_id: &str, namespace: Option<&str>) -> Result<Option<Event>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "SELECT * FROM events
             WHERE thread_id = $1
               AND (namespace = $2 OR ($2 IS NULL AND namespace IS NULL))
               AND status = 'pending'
               AND (expires_at IS NULL OR expires_at > now())
             ORDER BY COALESCE(priority, 0) DESC, created_at ASC, id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(thread_id)
        .bind(namespace)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let Some(row) = row else {
            tx.commit().await.map_err(db)?;
            return Ok(None);
        };

        let id: String = row.get("id");
        sqlx::query("UPDATE events SET status = 'processing', updated_at = now() WHERE id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;

        let mut event = event_from_row(&row)?;
        event.status = EventStatus::Processing;
        Ok(Some(event))
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self, event_id: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE events SET status = 'completed', updated_at = now() WHERE id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    /// Acknowledge an event and enqueue its produced events in one
    /// transaction: the follow-ups become visible to the next dequeue
    /// exactly when the ack commits.
    pub async fn complete_and_enqueue(
        &self,
        event_id: &str,
        thread_id: &str,
        namespace: Option<&str>,
        drafts: Vec<EventDraft>,
    ) -> Result<Vec<Event>> {
        let mut tx = self.begin().await?;
        let mut produced = Vec::with_capacity(drafts.len());
        for draft in drafts {
            produced.push(insert_event(&mut tx, thread_id, namespace, draft).await?);
        }
        sqlx::query("UPDATE events SET status = 'completed', updated_at = now() WHERE id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(produced)
    }

    /// Mark an event failed with the error and its taxonomy category in
    /// metadata.
    pub async fn fail(&self, event_id: &str, error: &str, category: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "UPDATE events
             SET status = 'failed',
                 metadata = metadata
                     || jsonb_build_object('error', $2::text, 'error_category', $3::text),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(event_id)
        .bind(error)
        .bind(category)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    /// Expire pending events whose TTL has elapsed. Returns the count.
    pub async fn expire_pending(&self, thread_id: &str, namespace: Option<&str>) -> Result<u64> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "UPDATE events
             SET status = 'expired', updated_at = now()
             WHERE thread_id = $1
               AND (namespace = $2 OR ($2 IS NULL AND namespace IS NULL))
               AND status = 'pending'
               AND expires_at IS NOT NULL
               AND expires_at < now()",
        )
        .bind(thread_id)
        .bind(namespace)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(result.rows_affected())
    }

    /// Pending events remaining for a thread (excluding expired).
    pub async fn pending_count(&self, thread_id: &str, namespace: Option<&str>) -> Result<i64> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM events
             WHERE thread_id = $1
               AND (namespace = $2 OR ($2 IS NULL AND namespace IS NULL))
               AND status = 'pending'
               AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(thread_id)
        .bind(namespace)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Event counts per status for a thread (observability).
    pub async fn status_counts(
        &self,
        thread_id: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<(EventStatus, i64)>> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM events
             WHERE thread_id = $1
               AND (namespace = $2 OR ($2 IS NULL AND namespace IS NULL))
             GROUP BY status
             ORDER BY status",
        )
        .bind(thread_id)
        .bind(namespace)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let status: String = row.get("status");
                EventStatus::parse(&status).map(|s| (s, row.get::<i64, _>("n")))
            })
            .collect())
    }

    pub async fn event(&self, event_id: &str) -> Result<Option<Event>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        row.as_ref().map(event_from_row).transpose()
    }

    /// Mark a batch terminated (a member errored). Returns `true` only
    /// for the caller that flips the flag, so exactly one terminator
    /// emits the follow-up even across crash redeliveries.
    pub async fn try_terminate_batch(&self, event_id: &str) -> Result<bool> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "UPDATE events
             SET metadata = jsonb_set(
                     COALESCE(metadata, '{}'::jsonb),
                     '{batch_terminated}',
                     'true'::jsonb,
                     true),
                 updated_at = now()
             WHERE id = $1
               AND NOT COALESCE((metadata->>'batch_terminated')::bool, false)",
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    /// Atomically bump the batch-completion counter on an event and
    /// return the new value. Used for tool batches: the parent message
    /// event tracks how many of its tool calls have results.
    pub async fn bump_batch_completed(&self, event_id: &str) -> Result<i64> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "UPDATE events
             SET metadata = jsonb_set(
                     COALESCE(metadata, '{}'::jsonb),
                     '{batch_completed}',
                     to_jsonb(COALESCE((metadata->>'batch_completed')::int, 0) + 1),
                     true),
                 updated_at = now()
             WHERE id = $1
             RETURNING (metadata->>'batch_completed')::int AS completed",
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(row.map(|r| i64::from(r.get::<i32, _>("completed"))).unwrap_or(0))
    }
}

pub(crate) async fn insert_event(
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    thread_id: &str,
    namespace: Option<&str>,
    draft: EventDraft,
) -> Result<Event> {
    let id = cf_domain::new_id();
    let event_type = draft.payload.event_type();
    let payload_json = draft.payload.to_json()?;
    let metadata = if draft.metadata.is_null() {
        serde_json::json!({})
    } else {
        draft.metadata.clone()
    };

    let row = sqlx::query(
        "INSERT INTO events
             (id, thread_id, namespace, type, payload, parent_event_id, trace_id,
              priority, ttl_ms, expires_at, status, metadata)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                 CASE WHEN $9::bigint IS NULL THEN NULL
                      ELSE now() + ($9::bigint * interval '1 millisecond') END,
                 'pending', $10)
         RETURNING *",
    )
    .bind(&id)
    .bind(thread_id)
    .bind(namespace)
    .bind(event_type.as_str())
    .bind(&payload_json)
    .bind(&draft.parent_event_id)
    .bind(&draft.trace_id)
    .bind(draft.priority)
    .bind(draft.ttl_ms)
    .bind(&metadata)
    .fetch_one(&mut **tx)
    .await
    .map_err(db)?;

    event_from_row(&row)
}

pub(crate) fn event_from_row(row: &PgRow) -> Result<Event> {
    let type_str: String = row.get("type");
    let status_str: String = row.get("status");
    let event_type = EventType::parse(&type_str).ok_or_else(|| {
        cf_domain::Error::Database(format!("unknown event type in row: {type_str}"))
    })?;
    let payload_json: serde_json::Value = row.get("payload");
    let payload = EventPayload::from_parts(event_type, payload_json)?;

    Ok(Event {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        namespace: row.get("namespace"),
        payload,
        parent_event_id: row.get("parent_event_id"),
        trace_id: row.get("trace_id"),
        priority: row.get("priority"),
        ttl_ms: row.get("ttl_ms"),
        expires_at: row.get::<Option<DateTime<Utc>>, _>("expires_at"),
        status: EventStatus::parse(&status_str).unwrap_or(EventStatus::Pending),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
