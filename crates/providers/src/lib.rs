//! Provider abstraction: the seams through which the runtime talks to
//! LLM and embedding backends.
//!
//! The runtime never speaks a provider wire protocol. It builds a
//! [`ChatRequest`], consumes a stream of [`ChatStreamEvent`]s, and hands
//! text to an [`EmbeddingProvider`]. Concrete adapters live outside this
//! workspace; the [`mock`] module ships a scripted implementation for
//! deterministic tests.

pub mod mock;
pub mod registry;
pub mod traits;

pub use registry::ProviderRegistry;
pub use traits::{
    ChatProvider, ChatRequest, ChatResponse, ChatStreamEvent, EmbeddingProvider, Usage,
};
