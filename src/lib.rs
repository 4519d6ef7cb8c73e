//! # durably
//!
//! A deterministic-replay durable workflow engine.
//!
//! `durably` intercepts every effect a workflow performs — an action, a
//! sleep, a suspend, a child scope — against an append-only event
//! stream. Resuming a workflow replays its recorded prefix (so actions
//! that already completed never run twice) and transitions seamlessly
//! into live execution the moment the log runs out of answers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DurableContext                        │
//! │   (per-scope API: action, sleep, resource, spawn, suspend)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            Engine                             │
//! │  (the reducer: replay frontier, divergence, id allocation)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DurableStream                          │
//! │       (append-only log of DurableEvent; in-memory here)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use durably::prelude::*;
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("boom")]
//! # struct MyError;
//! # async fn run() {
//! let stream: Arc<dyn DurableStream> = Arc::new(InMemoryDurableStream::new());
//! let handle = durably(stream, |ctx| async move {
//!     let sum: i32 = ctx
//!         .action("add(1, 2)", || async { Ok::<_, MyError>(1 + 2) })
//!         .await?;
//!     Ok::<_, ContextError>(sum)
//! })
//! .await
//! .unwrap();
//! let result = handle.join().await.unwrap();
//! assert_eq!(result, 3);
//! # }
//! ```

pub mod context;
pub mod engine;
pub mod entry;
pub mod event;
pub mod id;
pub mod scope;
pub mod stream;

pub use entry::{durably, durably_with_config, DurablyError, DurablyHandle};

/// Convenient single-import surface for consumers.
pub mod prelude {
    pub use crate::context::{
        all, race, BoxFuture, ContextError, DurableChannel, DurableContext, DurableTask,
        TaskError,
    };
    pub use crate::engine::{DivergenceError, Engine, EngineConfig, ReducerError, ScopeOutcome};
    pub use crate::entry::{durably, durably_with_config, DurablyError, DurablyHandle};
    pub use crate::event::{
        create_live_only_sentinel, is_live_only, live_only_value, normalize_error, DurableEvent,
        LiveOnlySentinel, ScopeResult, SerializedError, HALT_ERROR_NAME,
    };
    pub use crate::id::IdAllocator;
    pub use crate::scope::{ContextLayer, ScopeHandle, ScopeId, ROOT_SCOPE_ID};
    pub use crate::stream::{DurableStream, InMemoryDurableStream, StreamEntry, StreamError};
}
