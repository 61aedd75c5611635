//! Deterministic mock providers for tests.
//!
//! [`ScriptedChatProvider`] pops one pre-written event script per call,
//! so turn-level tests can specify exact token/tool-call sequences
//! without network access. [`MockEmbeddingProvider`] hashes text into a
//! stable unit vector, so identical inputs embed identically.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream;
use parking_lot::Mutex;

use cf_domain::chat::ToolCall;
use cf_domain::error::Result;
use cf_domain::stream::BoxStream;

use crate::traits::{
    ChatProvider, ChatRequest, ChatResponse, ChatStreamEvent, EmbeddingProvider, Usage,
};

/// A pre-scripted chat provider. Each call pops the next script from the
/// front of the queue; when the queue is empty, a fallback text reply is
/// emitted.
pub struct ScriptedChatProvider {
    scripts: Arc<Mutex<VecDeque<Vec<ChatStreamEvent>>>>,
    id: String,
    /// The last request seen, for test inspection.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
    /// Total number of calls served.
    pub calls: Arc<Mutex<usize>>,
}

impl ScriptedChatProvider {
    pub fn new(scripts: Vec<Vec<ChatStreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            id: "scripted-mock".into(),
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Provider that always streams a single text reply, token per word.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Script: stream `reply` word-by-word, then `Done`.
    pub fn text_script(reply: impl Into<String>) -> Vec<ChatStreamEvent> {
        let reply = reply.into();
        let mut events: Vec<ChatStreamEvent> = Vec::new();
        if reply.is_empty() {
            events.push(ChatStreamEvent::Token { text: reply });
        } else {
            for w in reply.split_inclusive(' ') {
                events.push(ChatStreamEvent::Token { text: w.to_string() });
            }
        }
        events.push(ChatStreamEvent::Done {
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 10,
                total_tokens: 20,
            }),
            finish_reason: Some("stop".into()),
        });
        events
    }

    /// Script: the model issues tool calls (optionally with lead-in text).
    pub fn tool_script(
        text: impl Into<String>,
        calls: Vec<(&str, &str, serde_json::Value)>,
    ) -> Vec<ChatStreamEvent> {
        let text = text.into();
        let mut events: Vec<ChatStreamEvent> = Vec::new();
        if !text.is_empty() {
            events.push(ChatStreamEvent::Token { text });
        }
        for (call_id, tool_name, arguments) in calls {
            events.push(ChatStreamEvent::ToolCallStarted {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
            });
            events.push(ChatStreamEvent::ToolCallFinished {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                arguments,
            });
        }
        events.push(ChatStreamEvent::Done {
            usage: None,
            finish_reason: Some("tool_calls".into()),
        });
        events
    }

    fn next_script(&self) -> Vec<ChatStreamEvent> {
        *self.calls.lock() += 1;
        self.scripts.lock().pop_front().unwrap_or_else(|| {
            vec![
                ChatStreamEvent::Token {
                    text: "[no more scripts]".into(),
                },
                ChatStreamEvent::Done {
                    usage: None,
                    finish_reason: Some("stop".into()),
                },
            ]
        })
    }
}

#[async_trait::async_trait]
impl ChatProvider for ScriptedChatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        *self.last_request.lock() = Some(req);
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        let mut finish_reason = None;
        for event in self.next_script() {
            match event {
                ChatStreamEvent::Token { text } => content.push_str(&text),
                ChatStreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                }),
                ChatStreamEvent::Done {
                    usage: u,
                    finish_reason: f,
                } => {
                    usage = u;
                    finish_reason = f;
                }
                _ => {}
            }
        }
        Ok(ChatResponse {
            content,
            tool_calls,
            usage,
            model: "scripted-mock-model".into(),
            finish_reason,
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<ChatStreamEvent>>> {
        *self.last_request.lock() = Some(req);
        let events: Vec<Result<ChatStreamEvent>> =
            self.next_script().into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

/// Hash-based embedding provider: stable, normalized, no network.
pub struct MockEmbeddingProvider {
    dimension: usize,
    id: String,
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            id: "mock-embeddings".into(),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        // FNV-style rolling hash seeds each component; identical text
        // always produces the identical unit vector.
        let mut state: u64 = 0xcbf2_9ce4_8422_2325;
        for b in text.bytes() {
            state ^= u64::from(b);
            state = state.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let mut v: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let mut s = state.wrapping_add(i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
                s ^= s >> 33;
                ((s as f64 / u64::MAX as f64) * 2.0 - 1.0) as f32
            })
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn scripted_provider_pops_scripts_in_order() {
        let provider = ScriptedChatProvider::new(vec![
            ScriptedChatProvider::text_script("first"),
            ScriptedChatProvider::text_script("second"),
        ]);

        let r1 = provider.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(r1.content, "first");
        let r2 = provider.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(r2.content, "second");
        // Exhausted queue falls back.
        let r3 = provider.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(r3.content, "[no more scripts]");
        assert_eq!(*provider.calls.lock(), 3);
    }

    #[tokio::test]
    async fn stream_ends_with_done() {
        let provider = ScriptedChatProvider::always_text("hello world");
        let mut stream = provider.chat_stream(ChatRequest::default()).await.unwrap();
        let mut saw_done = false;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                ChatStreamEvent::Token { text: t } => text.push_str(&t),
                ChatStreamEvent::Done { .. } => saw_done = true,
                _ => {}
            }
        }
        assert_eq!(text, "hello world");
        assert!(saw_done);
    }

    #[tokio::test]
    async fn tool_script_round_trips_calls() {
        let provider = ScriptedChatProvider::new(vec![ScriptedChatProvider::tool_script(
            "",
            vec![("c1", "save_asset", serde_json::json!({"path": "a.png"}))],
        )]);
        let resp = provider.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "save_asset");
    }

    #[tokio::test]
    async fn mock_embeddings_are_stable_unit_vectors() {
        let provider = MockEmbeddingProvider::new(16);
        let a = provider.embed_one("hello").await.unwrap();
        let b = provider.embed_one("hello").await.unwrap();
        let c = provider.embed_one("goodbye").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
