//! Thread rows and the per-thread worker lease.
//!
//! The lease is a compare-and-swap on `(worker_locked_by,
//! worker_lease_expires_at)`: acquisition succeeds iff the row is
//! unlocked, expired, or already ours. Acquisition also reopens any
//! `processing` events left behind by a crashed holder.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use cf_domain::error::Result;
use cf_domain::thread::{Thread, ThreadMode, ThreadSpec, ThreadStatus};

use crate::{db, is_unique_violation, Store};

impl Store {
    /// Look up a thread by id, then by external id, else insert.
    pub async fn find_or_create_thread(
        &self,
        spec: &ThreadSpec,
        namespace: Option<&str>,
    ) -> Result<Thread> {
        let mut tx = self.begin().await?;

        if let Some(id) = &spec.id {
            let row = sqlx::query("SELECT * FROM threads WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?;
            if let Some(row) = row {
                tx.commit().await.map_err(db)?;
                return thread_from_row(&row);
            }
        }

        if let Some(external_id) = &spec.external_id {
            let row = sqlx::query(
                "SELECT * FROM threads
                 WHERE external_id = $1
                   AND (namespace = $2 OR ($2 IS NULL AND namespace IS NULL))",
            )
            .bind(external_id)
            .bind(namespace)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
            if let Some(row) = row {
                tx.commit().await.map_err(db)?;
                return thread_from_row(&row);
            }
        }

        let id = spec.id.clone().unwrap_or_else(cf_domain::new_id);
        let name = spec
            .name
            .clone()
            .or_else(|| spec.external_id.clone())
            .unwrap_or_else(|| format!("thread-{id}"));
        let mode = spec.mode.unwrap_or(ThreadMode::Immediate);
        let metadata = if spec.metadata.is_null() {
            serde_json::json!({})
        } else {
            spec.metadata.clone()
        };

        let inserted = sqlx::query(
            "INSERT INTO threads
                 (id, namespace, name, external_id, participants, status, mode,
                  parent_thread_id, metadata)
             VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8)
             RETURNING *",
        )
        .bind(&id)
        .bind(namespace)
        .bind(&name)
        .bind(&spec.external_id)
        .bind(&spec.participants)
        .bind(mode.as_str())
        .bind(&spec.parent_thread_id)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(row) => {
                tx.commit().await.map_err(db)?;
                thread_from_row(&row)
            }
            // Lost a create race on external_id; the winner's row is it.
            Err(e) if is_unique_violation(&e) && spec.external_id.is_some() => {
                tx.rollback().await.map_err(db)?;
                let mut tx = self.begin().await?;
                let row = sqlx::query(
                    "SELECT * FROM threads
                     WHERE external_id = $1
                       AND (namespace = $2 OR ($2 IS NULL AND namespace IS NULL))",
                )
                .bind(&spec.external_id)
                .bind(namespace)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
                tx.commit().await.map_err(db)?;
                thread_from_row(&row)
            }
            Err(e) => {
                tx.rollback().await.map_err(db)?;
                Err(db(e))
            }
        }
    }

    pub async fn thread(&self, id: &str) -> Result<Option<Thread>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT * FROM threads WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        row.as_ref().map(thread_from_row).transpose()
    }

    // ── Lease ──────────────────────────────────────────────────────

    /// Try to acquire (or re-acquire) the worker lease.
    ///
    /// On success, any `processing` events for the thread are reset to
    /// `pending` in the same transaction: a previous holder that crashed
    /// mid-dispatch leaves them reopened for this worker.
    pub async fn acquire_lease(
        &self,
        thread_id: &str,
        namespace: Option<&str>,
        worker_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            "UPDATE threads
             SET worker_locked_by = $2,
                 worker_lease_expires_at = now() + make_interval(secs => $3),
                 updated_at = now()
             WHERE id = $1
               AND (worker_locked_by IS NULL
                    OR worker_lease_expires_at < now()
                    OR worker_locked_by = $2)",
        )
        .bind(thread_id)
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db)?;
            return Ok(false);
        }

        let reopened = sqlx::query(
            "UPDATE events
             SET status = 'pending', updated_at = now()
             WHERE thread_id = $1
               AND (namespace = $2 OR ($2 IS NULL AND namespace IS NULL))
               AND status = 'processing'",
        )
        .bind(thread_id)
        .bind(namespace)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        if reopened.rows_affected() > 0 {
            tracing::warn!(
                thread_id,
                worker_id,
                reopened = reopened.rows_affected(),
                "reopened processing events from a previous lease holder"
            );
        }

        tx.commit().await.map_err(db)?;
        Ok(true)
    }

    /// Renew the lease; fails when another worker stole it after expiry.
    pub async fn renew_lease(
        &self,
        thread_id: &str,
        worker_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            "UPDATE threads
             SET worker_lease_expires_at = now() + make_interval(secs => $3),
                 updated_at = now()
             WHERE id = $1 AND worker_locked_by = $2",
        )
        .bind(thread_id)
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(updated.rows_affected() == 1)
    }

    /// Release the lease if we still hold it.
    pub async fn release_lease(&self, thread_id: &str, worker_id: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "UPDATE threads
             SET worker_locked_by = NULL,
                 worker_lease_expires_at = NULL,
                 updated_at = now()
             WHERE id = $1 AND worker_locked_by = $2",
        )
        .bind(thread_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }
}

pub(crate) fn thread_from_row(row: &PgRow) -> Result<Thread> {
    let status: String = row.get("status");
    let mode: String = row.get("mode");
    Ok(Thread {
        id: row.get("id"),
        namespace: row.get("namespace"),
        name: row.get("name"),
        external_id: row.get("external_id"),
        participants: row.get("participants"),
        status: ThreadStatus::parse(&status).unwrap_or(ThreadStatus::Active),
        mode: ThreadMode::parse(&mode).unwrap_or(ThreadMode::Immediate),
        parent_thread_id: row.get("parent_thread_id"),
        worker_locked_by: row.get("worker_locked_by"),
        worker_lease_expires_at: row.get::<Option<DateTime<Utc>>, _>("worker_lease_expires_at"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
