//! Knowledge graph: nodes, edges, and cosine similarity search.

use pgvector::Vector;
use sqlx::postgres::PgRow;
use sqlx::Row;

use cf_domain::error::Result;
use cf_domain::graph::{KnowledgeEdge, KnowledgeNode, NodeMatch};

use crate::{db, is_unique_violation, Store};

/// Input to node creation; id assigned by the store.
#[derive(Debug, Clone)]
pub struct NodeDraft {
    pub namespace: String,
    pub node_type: String,
    pub name: String,
    pub content: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub data: serde_json::Value,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
}

impl Store {
    pub async fn create_node(&self, draft: NodeDraft) -> Result<KnowledgeNode> {
        let mut tx = self.begin().await?;
        let node = insert_node(&mut tx, draft).await?;
        tx.commit().await.map_err(db)?;
        Ok(node)
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<KnowledgeNode>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT * FROM nodes WHERE id = $1")
            .bind(node_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        row.as_ref().map(node_from_row).transpose()
    }

    /// Update a node's `data` and optionally its name (entity merges).
    pub async fn update_node_data(
        &self,
        node_id: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE nodes SET data = $2, updated_at = now() WHERE id = $1")
            .bind(node_id)
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    /// Delete a node; its edges go with it (FK cascade).
    pub async fn delete_node(&self, node_id: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    /// Insert an edge; duplicate `(source, target, type)` is a no-op.
    pub async fn create_edge(
        &self,
        source_node_id: &str,
        target_node_id: &str,
        edge_type: &str,
        data: serde_json::Value,
        weight: f32,
    ) -> Result<Option<KnowledgeEdge>> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "INSERT INTO edges (id, source_node_id, target_node_id, type, data, weight)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(cf_domain::new_id())
        .bind(source_node_id)
        .bind(target_node_id)
        .bind(edge_type)
        .bind(&data)
        .bind(weight)
        .fetch_one(&mut *tx)
        .await;

        match result {
            Ok(row) => {
                tx.commit().await.map_err(db)?;
                Ok(Some(edge_from_row(&row)?))
            }
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(db)?;
                Ok(None)
            }
            Err(e) => {
                tx.rollback().await.map_err(db)?;
                Err(db(e))
            }
        }
    }

    /// Cosine similarity search over embedded nodes.
    pub async fn search_nodes(
        &self,
        embedding: &[f32],
        namespaces: &[String],
        types: Option<&[String]>,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<NodeMatch>> {
        let vector = Vector::from(embedding.to_vec());
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            "SELECT *, 1 - (embedding <=> $1) AS similarity
             FROM nodes
             WHERE embedding IS NOT NULL
               AND namespace = ANY($2)
               AND ($3::text[] IS NULL OR type = ANY($3))
               AND 1 - (embedding <=> $1) >= $4
             ORDER BY embedding <=> $1 ASC
             LIMIT $5",
        )
        .bind(&vector)
        .bind(namespaces)
        .bind(types)
        .bind(f64::from(min_similarity))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;

        rows.iter()
            .map(|row| {
                Ok(NodeMatch {
                    node: node_from_row(row)?,
                    similarity: row.get::<f64, _>("similarity") as f32,
                })
            })
            .collect()
    }

    /// Edges leaving a node, optionally filtered by type.
    pub async fn edges_from(
        &self,
        source_node_id: &str,
        edge_type: Option<&str>,
    ) -> Result<Vec<KnowledgeEdge>> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            "SELECT * FROM edges
             WHERE source_node_id = $1 AND ($2::text IS NULL OR type = $2)
             ORDER BY created_at ASC",
        )
        .bind(source_node_id)
        .bind(edge_type)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        rows.iter().map(edge_from_row).collect()
    }
}

pub(crate) async fn insert_node(
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    draft: NodeDraft,
) -> Result<KnowledgeNode> {
    let data = if draft.data.is_null() {
        serde_json::json!({})
    } else {
        draft.data
    };
    let row = sqlx::query(
        "INSERT INTO nodes
             (id, namespace, type, name, content, embedding, data, source_type, source_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING *",
    )
    .bind(cf_domain::new_id())
    .bind(&draft.namespace)
    .bind(&draft.node_type)
    .bind(&draft.name)
    .bind(&draft.content)
    .bind(draft.embedding.map(Vector::from))
    .bind(&data)
    .bind(&draft.source_type)
    .bind(&draft.source_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(db)?;
    node_from_row(&row)
}

pub(crate) fn node_from_row(row: &PgRow) -> Result<KnowledgeNode> {
    let embedding: Option<Vector> = row.get("embedding");
    Ok(KnowledgeNode {
        id: row.get("id"),
        namespace: row.get("namespace"),
        node_type: row.get("type"),
        name: row.get("name"),
        content: row.get("content"),
        embedding: embedding.map(|v| v.to_vec()),
        data: row.get("data"),
        source_type: row.get("source_type"),
        source_id: row.get("source_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn edge_from_row(row: &PgRow) -> Result<KnowledgeEdge> {
    Ok(KnowledgeEdge {
        id: row.get("id"),
        source_node_id: row.get("source_node_id"),
        target_node_id: row.get("target_node_id"),
        edge_type: row.get("type"),
        data: row.get("data"),
        weight: row.get("weight"),
        created_at: row.get("created_at"),
    })
}
