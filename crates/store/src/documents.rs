//! Ingested documents and their chunks.
//!
//! `(namespace, content_hash)` is the idempotency key: ingesting the
//! same bytes twice returns the existing document. Chunk insertion is
//! one transaction covering `document_chunks`, the mirror `chunk`
//! nodes, their `NEXT_CHUNK` edges, and the final `ready` status.

use pgvector::Vector;
use sqlx::postgres::PgRow;
use sqlx::Row;

use cf_domain::error::Result;
use cf_domain::graph::{
    edge_type, node_type, ChunkMatch, Document, DocumentChunk, DocumentStatus,
};

use crate::graph::{insert_node, NodeDraft};
use crate::{db, is_unique_violation, Store};

#[derive(Debug, Clone)]
pub struct DocumentDraft {
    pub namespace: String,
    pub source_type: String,
    pub source_uri: Option<String>,
    pub content_hash: String,
}

/// One chunk ready for insertion.
#[derive(Debug, Clone)]
pub struct ChunkInsert {
    pub index: i32,
    pub content: String,
    pub embedding: Vec<f32>,
    pub token_count: i32,
}

/// How chunk search scores candidates.
#[derive(Debug, Clone)]
pub enum ChunkSearch {
    /// Cosine similarity only.
    Semantic,
    /// `semantic_weight * cosine + keyword_weight * ts_rank_cd`.
    Hybrid {
        query: String,
        semantic_weight: f32,
        keyword_weight: f32,
    },
}

impl Store {
    pub async fn find_document(
        &self,
        namespace: &str,
        content_hash: &str,
    ) -> Result<Option<Document>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "SELECT * FROM documents WHERE namespace = $1 AND content_hash = $2",
        )
        .bind(namespace)
        .bind(content_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        row.as_ref().map(document_from_row).transpose()
    }

    /// Insert a new document in `ingesting` state, or return the
    /// existing one for this `(namespace, content_hash)`.
    ///
    /// The boolean is `true` when this call created the row.
    pub async fn create_or_get_document(&self, draft: DocumentDraft) -> Result<(Document, bool)> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "INSERT INTO documents (id, namespace, source_type, source_uri, content_hash, status)
             VALUES ($1, $2, $3, $4, $5, 'ingesting')
             RETURNING *",
        )
        .bind(cf_domain::new_id())
        .bind(&draft.namespace)
        .bind(&draft.source_type)
        .bind(&draft.source_uri)
        .bind(&draft.content_hash)
        .fetch_one(&mut *tx)
        .await;

        match result {
            Ok(row) => {
                tx.commit().await.map_err(db)?;
                Ok((document_from_row(&row)?, true))
            }
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(db)?;
                let existing = self
                    .find_document(&draft.namespace, &draft.content_hash)
                    .await?
                    .ok_or_else(|| {
                        cf_domain::Error::Database(
                            "document vanished between conflict and re-read".into(),
                        )
                    })?;
                Ok((existing, false))
            }
            Err(e) => {
                tx.rollback().await.map_err(db)?;
                Err(db(e))
            }
        }
    }

    pub async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        chunk_count: Option<i32>,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "UPDATE documents
             SET status = $2, chunk_count = COALESCE($3, chunk_count), updated_at = now()
             WHERE id = $1",
        )
        .bind(document_id)
        .bind(status.as_str())
        .bind(chunk_count)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    /// Write all chunks for a document: rows, mirror `chunk` nodes with
    /// the same embeddings, `NEXT_CHUNK` edges between consecutive
    /// chunks, and the `ready` status. One transaction; conflicting
    /// `(document_id, chunk_index)` rows are skipped.
    pub async fn insert_chunks(
        &self,
        document_id: &str,
        namespace: &str,
        chunks: Vec<ChunkInsert>,
    ) -> Result<usize> {
        let count = chunks.len();
        let mut tx = self.begin().await?;
        let mut prev_node_id: Option<String> = None;

        for chunk in &chunks {
            let inserted = sqlx::query(
                "INSERT INTO document_chunks
                     (id, document_id, chunk_index, content, embedding, token_count)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (document_id, chunk_index) DO NOTHING",
            )
            .bind(cf_domain::new_id())
            .bind(document_id)
            .bind(chunk.index)
            .bind(&chunk.content)
            .bind(Vector::from(chunk.embedding.clone()))
            .bind(chunk.token_count)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

            if inserted.rows_affected() == 0 {
                // Replayed ingest; the graph side was written last time.
                prev_node_id = None;
                continue;
            }

            let node = insert_node(
                &mut tx,
                NodeDraft {
                    namespace: namespace.to_string(),
                    node_type: node_type::CHUNK.into(),
                    name: format!("chunk {} of {document_id}", chunk.index),
                    content: Some(chunk.content.clone()),
                    embedding: Some(chunk.embedding.clone()),
                    data: serde_json::json!({
                        "document_id": document_id,
                        "chunk_index": chunk.index,
                    }),
                    source_type: Some("document".into()),
                    source_id: Some(document_id.to_string()),
                },
            )
            .await?;

            if let Some(prev) = &prev_node_id {
                sqlx::query(
                    "INSERT INTO edges (id, source_node_id, target_node_id, type, data)
                     VALUES ($1, $2, $3, $4, '{}')
                     ON CONFLICT DO NOTHING",
                )
                .bind(cf_domain::new_id())
                .bind(prev)
                .bind(&node.id)
                .bind(edge_type::NEXT_CHUNK)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            }
            prev_node_id = Some(node.id);
        }

        sqlx::query(
            "UPDATE documents
             SET status = 'ready', chunk_count = $2, updated_at = now()
             WHERE id = $1",
        )
        .bind(document_id)
        .bind(count as i32)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(count)
    }

    pub async fn chunk_count(&self, document_id: &str) -> Result<i64> {
        let mut tx = self.begin().await?;
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM document_chunks WHERE document_id = $1")
                .bind(document_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Search chunks across namespaces; scoring per [`ChunkSearch`].
    pub async fn search_chunks(
        &self,
        namespaces: &[String],
        embedding: &[f32],
        search: &ChunkSearch,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<ChunkMatch>> {
        let vector = Vector::from(embedding.to_vec());
        let mut tx = self.begin().await?;

        let rows = match search {
            ChunkSearch::Semantic => {
                sqlx::query(
                    "SELECT dc.*, 1 - (dc.embedding <=> $1) AS score
                     FROM document_chunks dc
                     JOIN documents d ON d.id = dc.document_id
                     WHERE d.namespace = ANY($2)
                       AND dc.embedding IS NOT NULL
                       AND 1 - (dc.embedding <=> $1) >= $3
                     ORDER BY dc.embedding <=> $1 ASC
                     LIMIT $4",
                )
                .bind(&vector)
                .bind(namespaces)
                .bind(f64::from(threshold))
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await
                .map_err(db)?
            }
            ChunkSearch::Hybrid {
                query,
                semantic_weight,
                keyword_weight,
            } => {
                sqlx::query(
                    "SELECT dc.*,
                            $5 * (1 - (dc.embedding <=> $1))
                          + $6 * ts_rank_cd(to_tsvector('english', dc.content),
                                            plainto_tsquery('english', $4)) AS score
                     FROM document_chunks dc
                     JOIN documents d ON d.id = dc.document_id
                     WHERE d.namespace = ANY($2)
                       AND dc.embedding IS NOT NULL
                       AND ($5 * (1 - (dc.embedding <=> $1))
                          + $6 * ts_rank_cd(to_tsvector('english', dc.content),
                                            plainto_tsquery('english', $4))) >= $3
                     ORDER BY score DESC
                     LIMIT $7",
                )
                .bind(&vector)
                .bind(namespaces)
                .bind(f64::from(threshold))
                .bind(query)
                .bind(f64::from(*semantic_weight))
                .bind(f64::from(*keyword_weight))
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await
                .map_err(db)?
            }
        };
        tx.commit().await.map_err(db)?;

        rows.iter()
            .map(|row| {
                Ok(ChunkMatch {
                    chunk: chunk_from_row(row)?,
                    score: row.get::<f64, _>("score") as f32,
                })
            })
            .collect()
    }
}

pub(crate) fn document_from_row(row: &PgRow) -> Result<Document> {
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        namespace: row.get("namespace"),
        source_type: row.get("source_type"),
        source_uri: row.get("source_uri"),
        content_hash: row.get("content_hash"),
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Pending),
        chunk_count: row.get("chunk_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn chunk_from_row(row: &PgRow) -> Result<DocumentChunk> {
    let embedding: Option<Vector> = row.get("embedding");
    Ok(DocumentChunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        embedding: embedding.map(|v| v.to_vec()),
        token_count: row.get("token_count"),
    })
}
