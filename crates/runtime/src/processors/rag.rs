//! Document ingestion: fetch → preprocess → hash → chunk → embed →
//! dual-write chunks + graph nodes.
//!
//! Idempotent on `(namespace, content_hash)`: re-ingesting identical
//! content is a no-op beyond returning the existing document.

use sha2::{Digest, Sha256};

use cf_domain::error::{Error, Result};
use cf_domain::event::{ChunkStrategy, Event, EventDraft, EventType, IngestRequest};
use cf_domain::graph::DocumentStatus;
use cf_store::documents::{ChunkInsert, DocumentDraft};

use super::chunk::{chunk_text, estimate_tokens};
use crate::registry::{Processor, ProcessorContext};

pub struct RagIngestProcessor {
    http: reqwest::Client,
}

impl Default for RagIngestProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl RagIngestProcessor {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
        }
    }
}

#[async_trait::async_trait]
impl Processor for RagIngestProcessor {
    fn name(&self) -> &str {
        "rag_ingest"
    }

    fn event_type(&self) -> EventType {
        EventType::RagIngest
    }

    async fn process(&self, event: &Event, ctx: &ProcessorContext) -> Result<Vec<EventDraft>> {
        let request = match &event.payload {
            cf_domain::event::EventPayload::RagIngest(r) => r.clone(),
            other => {
                return Err(Error::Validation(format!(
                    "expected RAG_INGEST payload, got {}",
                    other.event_type()
                )))
            }
        };
        let namespace = ctx.namespace_or_default();
        let store = &ctx.deps.store;

        let fetched = self.fetch(&request).await?;
        let content = preprocess(&fetched.content, &fetched.mime);
        let content_hash = hex::encode(Sha256::digest(content.as_bytes()));

        let (document, created) = store
            .create_or_get_document(DocumentDraft {
                namespace: namespace.clone(),
                source_type: fetched.source_type.clone(),
                source_uri: fetched.source_uri.clone(),
                content_hash: content_hash.clone(),
            })
            .await?;

        if !created && document.status == DocumentStatus::Ready {
            tracing::debug!(
                document_id = %document.id,
                content_hash = %content_hash,
                "identical content already ingested; no-op"
            );
            return Ok(Vec::new());
        }
        if !created {
            // Retrying a failed or interrupted ingest.
            store
                .set_document_status(&document.id, DocumentStatus::Ingesting, None)
                .await?;
        }

        let result = self
            .ingest_chunks(&request, &content, &document.id, &namespace, ctx)
            .await;
        if let Err(e) = &result {
            let _ = store
                .set_document_status(&document.id, DocumentStatus::Failed, None)
                .await;
            tracing::warn!(document_id = %document.id, error = %e, "ingest failed");
        }
        result?;
        Ok(Vec::new())
    }
}

struct Fetched {
    content: String,
    mime: String,
    source_type: String,
    source_uri: Option<String>,
}

impl RagIngestProcessor {
    async fn fetch(&self, request: &IngestRequest) -> Result<Fetched> {
        let source = request.source.trim();

        if let Some(inline) = source.strip_prefix("text:") {
            return Ok(Fetched {
                content: inline.to_string(),
                mime: request.mime_type.clone().unwrap_or_else(|| "text/plain".into()),
                source_type: "text".into(),
                source_uri: None,
            });
        }

        if source.starts_with("http://") || source.starts_with("https://") {
            let response = self
                .http
                .get(source)
                .send()
                .await
                .map_err(|e| Error::Transport(format!("fetch {source} failed: {e}")))?;
            if !response.status().is_success() {
                let status = response.status();
                return Err(if status.is_server_error() {
                    Error::Transport(format!("fetch {source}: {status}"))
                } else {
                    Error::Validation(format!("fetch {source}: {status}"))
                });
            }
            let mime = request.mime_type.clone().unwrap_or_else(|| {
                response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
                    .unwrap_or_else(|| "text/html".into())
            });
            let content = response
                .text()
                .await
                .map_err(|e| Error::Transport(format!("read {source} failed: {e}")))?;
            return Ok(Fetched {
                content,
                mime,
                source_type: "url".into(),
                source_uri: Some(source.to_string()),
            });
        }

        let path = source.strip_prefix("file://").unwrap_or(source);
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Validation(format!("read {path} failed: {e}")))?;
        let mime = request.mime_type.clone().unwrap_or_else(|| mime_from_path(path));
        Ok(Fetched {
            content,
            mime,
            source_type: "file".into(),
            source_uri: Some(path.to_string()),
        })
    }

    async fn ingest_chunks(
        &self,
        request: &IngestRequest,
        content: &str,
        document_id: &str,
        namespace: &str,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        let config = &ctx.deps.config.rag;
        let strategy = request.strategy.unwrap_or(ChunkStrategy::Sentences);
        let chunk_size = request.chunk_size.unwrap_or(config.chunk_size);
        let overlap = request.overlap.unwrap_or(config.overlap);

        let pieces = chunk_text(content, strategy, chunk_size, overlap);
        if pieces.is_empty() {
            ctx.deps
                .store
                .set_document_status(document_id, DocumentStatus::Ready, Some(0))
                .await?;
            return Ok(());
        }

        let embedder = ctx.deps.providers.embedding().ok_or_else(|| {
            Error::Config("document ingestion requires an embedding provider".into())
        })?;
        let embeddings = embedder.embed(&pieces).await?;
        if embeddings.len() != pieces.len() {
            return Err(Error::Provider {
                provider: embedder.provider_id().to_string(),
                message: format!(
                    "embedding count mismatch: {} texts, {} vectors",
                    pieces.len(),
                    embeddings.len()
                ),
            });
        }

        let chunks: Vec<ChunkInsert> = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (content, embedding))| ChunkInsert {
                index: index as i32,
                token_count: estimate_tokens(&content),
                content,
                embedding,
            })
            .collect();

        let count = ctx
            .deps
            .store
            .insert_chunks(document_id, namespace, chunks)
            .await?;
        tracing::info!(document_id, chunks = count, "document ingested");
        Ok(())
    }
}

/// Reduce fetched bytes to plain text by MIME family.
fn preprocess(content: &str, mime: &str) -> String {
    match mime {
        m if m.contains("html") => html2text::from_read(content.as_bytes(), 100),
        m if m.contains("markdown") => markdown_to_text(content),
        _ => content.to_string(),
    }
}

fn markdown_to_text(markdown: &str) -> String {
    use pulldown_cmark::{Event as MdEvent, Parser};
    let mut out = String::new();
    for event in Parser::new(markdown) {
        match event {
            MdEvent::Text(text) | MdEvent::Code(text) => out.push_str(&text),
            MdEvent::SoftBreak | MdEvent::HardBreak => out.push(' '),
            MdEvent::End(_) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
    out.trim().to_string()
}

fn mime_from_path(path: &str) -> String {
    match path.rsplit('.').next() {
        Some("html") | Some("htm") => "text/html".into(),
        Some("md") | Some("markdown") => "text/markdown".into(),
        _ => "text/plain".into(),
    }
}
