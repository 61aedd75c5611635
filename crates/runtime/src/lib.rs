//! The Confab runtime: thread workers, the processor pipeline, and the
//! public `run()` API.
//!
//! One conversation = one thread = at most one worker at a time,
//! enforced by a Postgres lease. `run()` enqueues a `NEW_MESSAGE`
//! event, starts (or joins) the thread's worker, and hands back a
//! [`RunHandle`] streaming everything the worker does.

pub mod cancel;
pub mod debounce;
pub mod processors;
pub mod registry;
pub mod run;
pub mod state;
pub mod stream;
pub mod tools;
pub mod worker;
pub mod workers;

pub use cancel::{CancelSet, CancelToken};
pub use registry::{Processor, ProcessorContext, ProcessorRegistry};
pub use run::{AckMode, RunHandle, RunMessage, RunOptions, RunStatus, Runtime, RuntimeBuilder};
pub use stream::EventStream;
pub use tools::{Collections, Tool, ToolContext, ToolSet};
