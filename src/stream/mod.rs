//! The durable stream: an append-only, offset-addressed log of
//! [`DurableEvent`]s.
//!
//! This is the engine's sole collaborator contract for persistence
//! (spec.md §6). The core never assumes anything about the backend beyond
//! `append`/`read`/`length`/`closed` — remote implementations only need to
//! preserve append order and offset semantics.

mod memory;

pub use memory::InMemoryDurableStream;

use async_trait::async_trait;

use crate::event::DurableEvent;

/// A single entry read back from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub offset: usize,
    pub event: DurableEvent,
}

/// Errors the stream collaborator may raise.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// `append` was called on a stream whose `closed` flag is set.
    #[error("stream is closed")]
    StreamClosed,

    /// `read` was called with a negative or otherwise invalid offset.
    #[error("invalid read offset: {0}")]
    BadOffset(i64),
}

/// Abstract append-only event log (spec.md §4.1, §6).
///
/// The core depends only on this trait; the concrete backend (in-memory,
/// HTTP/remote log, ...) is an external collaborator. A stream must be
/// driven by at most one live [`crate::durably`] invocation at a time —
/// see the Open Questions resolution in DESIGN.md.
#[async_trait]
pub trait DurableStream: Send + Sync {
    /// Appends `event` and returns the offset just assigned. Offsets are
    /// non-negative integers, strictly increasing by one per append.
    async fn append(&self, event: DurableEvent) -> Result<usize, StreamError>;

    /// Returns all entries at or after `from_offset`, ordered by offset.
    async fn read(&self, from_offset: usize) -> Result<Vec<StreamEntry>, StreamError>;

    /// The current number of entries.
    async fn length(&self) -> usize;

    /// Whether the stream has been closed. Once true, further appends fail.
    async fn closed(&self) -> bool;

    /// Idempotent: closes the stream if it is not already closed.
    async fn close(&self);
}
