//! User upserts: a `users` row plus its graph node, keyed by
//! `(external_id, namespace)`.

use sqlx::Row;

use cf_domain::error::Result;
use cf_domain::graph::node_type;

use crate::{db, Store};

impl Store {
    /// Insert or refresh a user. Returns the internal user id.
    ///
    /// Best-effort callers (the message processor's debounced upsert)
    /// swallow the error; nothing here is load-bearing for a run.
    pub async fn upsert_user(
        &self,
        external_id: &str,
        namespace: Option<&str>,
        name: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<String> {
        let metadata = if metadata.is_null() {
            serde_json::json!({})
        } else {
            metadata.clone()
        };

        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "INSERT INTO users (id, external_id, namespace, name, metadata)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (external_id, (COALESCE(namespace, '')))
             DO UPDATE SET
                 name = COALESCE(EXCLUDED.name, users.name),
                 metadata = users.metadata || EXCLUDED.metadata,
                 updated_at = now()
             RETURNING id",
        )
        .bind(cf_domain::new_id())
        .bind(external_id)
        .bind(namespace)
        .bind(name)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;
        let user_id: String = row.get("id");

        // Mirror node; unique on source_id for type 'user'.
        sqlx::query(
            "INSERT INTO nodes (id, namespace, type, name, data, source_type, source_id)
             VALUES ($1, $2, $3, $4, $5, 'user', $6)
             ON CONFLICT (source_id) WHERE type = 'user'
             DO UPDATE SET name = EXCLUDED.name, updated_at = now()",
        )
        .bind(cf_domain::new_id())
        .bind(namespace.unwrap_or(""))
        .bind(node_type::USER)
        .bind(name.unwrap_or(external_id))
        .bind(serde_json::json!({ "external_id": external_id, "user_id": user_id }))
        .bind(&user_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(user_id)
    }
}
