//! In-memory reference implementation of [`DurableStream`]
//!
//! Grounded on the teacher's `InMemoryWorkflowEventStore`
//! (`persistence/memory.rs`): a `parking_lot::RwLock`-guarded growable
//! vector, with the same "primarily for tests and fixtures" framing.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::event::DurableEvent;

use super::{DurableStream, StreamEntry, StreamError};

/// In-memory [`DurableStream`].
///
/// # Example
///
/// ```
/// use durably::InMemoryDurableStream;
///
/// let stream = InMemoryDurableStream::new();
/// ```
pub struct InMemoryDurableStream {
    entries: RwLock<Vec<DurableEvent>>,
    closed: RwLock<bool>,
}

impl InMemoryDurableStream {
    /// An empty, open stream.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            closed: RwLock::new(false),
        }
    }

    /// Seeds a stream from a recorded prefix — used to build replay test
    /// fixtures (spec.md §4.1).
    pub fn from(events: Vec<DurableEvent>, closed: bool) -> Self {
        Self {
            entries: RwLock::new(events),
            closed: RwLock::new(closed),
        }
    }

    /// Synchronous snapshot of the full event log, for assertions in tests.
    pub fn snapshot(&self) -> Vec<DurableEvent> {
        self.entries.read().clone()
    }
}

impl Default for InMemoryDurableStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStream for InMemoryDurableStream {
    async fn append(&self, event: DurableEvent) -> Result<usize, StreamError> {
        if *self.closed.read() {
            return Err(StreamError::StreamClosed);
        }
        let mut entries = self.entries.write();
        let offset = entries.len();
        entries.push(event);
        Ok(offset)
    }

    async fn read(&self, from_offset: usize) -> Result<Vec<StreamEntry>, StreamError> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .enumerate()
            .skip(from_offset)
            .map(|(offset, event)| StreamEntry {
                offset,
                event: event.clone(),
            })
            .collect())
    }

    async fn length(&self) -> usize {
        self.entries.read().len()
    }

    async fn closed(&self) -> bool {
        *self.closed.read()
    }

    async fn close(&self) {
        *self.closed.write() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_increasing_offsets() {
        let stream = InMemoryDurableStream::new();
        let a = stream
            .append(DurableEvent::ScopeCreated {
                scope_id: "root".into(),
                parent_scope_id: None,
            })
            .await
            .unwrap();
        let b = stream
            .append(DurableEvent::WorkflowReturn {
                scope_id: "root".into(),
                value: serde_json::json!(42),
            })
            .await
            .unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(stream.length().await, 2);
    }

    #[tokio::test]
    async fn read_returns_entries_from_offset() {
        let stream = InMemoryDurableStream::new();
        for i in 0..3 {
            stream
                .append(DurableEvent::EffectYielded {
                    scope_id: "root".into(),
                    effect_id: format!("effect-{i}"),
                    description: "noop".into(),
                })
                .await
                .unwrap();
        }
        let entries = stream.read(1).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, 1);
        assert_eq!(entries[1].offset, 2);
    }

    #[tokio::test]
    async fn append_fails_once_closed() {
        let stream = InMemoryDurableStream::new();
        stream.close().await;
        stream.close().await; // idempotent
        let result = stream
            .append(DurableEvent::ScopeCreated {
                scope_id: "root".into(),
                parent_scope_id: None,
            })
            .await;
        assert!(matches!(result, Err(StreamError::StreamClosed)));
    }

    #[tokio::test]
    async fn from_seeds_a_replay_fixture() {
        let seed = vec![DurableEvent::WorkflowReturn {
            scope_id: "root".into(),
            value: serde_json::json!(1),
        }];
        let stream = InMemoryDurableStream::from(seed.clone(), true);
        assert_eq!(stream.length().await, 1);
        assert!(stream.closed().await);
        assert_eq!(stream.snapshot(), seed);
    }
}
