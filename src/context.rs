//! The per-scope API a running workflow actually calls: `action`,
//! `sleep`, `resource`, `suspend`, `race`/`all`, `spawn`, context
//! `set`/`get`/`delete`, and durable channels.
//!
//! Everything here is a thin adapter over [`crate::engine::Engine`] and
//! [`crate::scope::ScopeHandle`] — the context itself holds no replay
//! state, it only knows which scope it is acting on behalf of.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::event::normalize_error;
use crate::engine::{Engine, ReducerError, ScopeOutcome};
use crate::scope::{ContextLayer, ScopeHandle, ScopeId};
use crate::stream::StreamError;

/// Errors a [`DurableContext`] call can raise.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Reducer(#[from] ReducerError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// The handle a running workflow uses to perform every durable
/// operation. One `DurableContext` exists per scope; `spawn` hands a
/// fresh one to each child.
#[derive(Clone)]
pub struct DurableContext {
    scope: ScopeHandle,
}

impl DurableContext {
    pub(crate) fn new(scope: ScopeHandle) -> Self {
        Self { scope }
    }

    pub fn scope_id(&self) -> &ScopeId {
        self.scope.id()
    }

    fn engine(&self) -> &Arc<Engine> {
        self.scope.engine()
    }

    /// Runs `body` exactly once across any number of resumes, recording
    /// its JSON-serializable result (or typed error) keyed by
    /// `description`. `description` must be stable across resumes for
    /// the same logical step — see the crate root docs on divergence.
    pub async fn action<T, E, F, Fut>(
        &self,
        description: impl Into<String>,
        body: F,
    ) -> Result<T, ContextError>
    where
        T: Serialize + DeserializeOwned,
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        Ok(self
            .engine()
            .effect(self.scope.id(), description, body())
            .await?)
    }

    /// Durably records a sleep's due time so replay never re-sleeps for
    /// the full duration — only whatever remains after a restart.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        let description = format!("sleep({}ms)", duration.as_millis());
        self.engine()
            .effect::<(), std::convert::Infallible, _>(self.scope.id(), description, async move {
                tokio::time::sleep(duration).await;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Constructs a live-only value (a handle, a reading, anything
    /// without a faithful JSON form). Always actually runs `make`, even
    /// on replay — only the bookkeeping event is skipped.
    pub async fn resource<T, F, Fut>(
        &self,
        description: impl Into<String>,
        type_name: impl Into<String>,
        make: F,
    ) -> Result<T, ContextError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        T: std::fmt::Debug,
    {
        Ok(self
            .engine()
            .resource(self.scope.id(), description, type_name, make)
            .await?)
    }

    /// Parks this scope until it is cancelled from outside — by a parent
    /// teardown, or by calling `cancel` on this scope's [`DurableTask`]
    /// or [`crate::DurablyHandle`]. Never returns on its own.
    pub async fn suspend(&self) -> Result<(), ContextError> {
        Ok(self
            .engine()
            .suspend(self.scope.id(), self.scope.cancellation())
            .await?)
    }

    /// Writes a context slot visible to this scope and its descendants.
    pub async fn set(&self, name: &str, value: impl Serialize) -> Result<(), ContextError> {
        let value = serde_json::to_value(value).map_err(ReducerError::from)?;
        self.scope.context.set(name, value.clone());
        self.engine().set_context(self.scope.id(), name, value).await?;
        Ok(())
    }

    /// Reads a context slot, checking this scope then each ancestor in
    /// turn.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.scope
            .context
            .get(name)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Deletes a context slot local to this scope (ancestor slots of the
    /// same name, if any, become visible again).
    pub async fn delete(&self, name: &str) -> Result<(), ContextError> {
        self.scope.context.delete(name);
        self.engine().delete_context(self.scope.id(), name).await?;
        Ok(())
    }

    /// Spawns `body` as a structured child scope: a genuine concurrent
    /// task, cancelled automatically if this scope is cancelled, whose
    /// completion/failure/halt is durably recorded.
    pub fn spawn<F, Fut, T, E>(&self, body: F) -> DurableTask<T, E>
    where
        F: FnOnce(DurableContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let parent = self.scope.clone();
        let engine = parent.engine().clone();
        let cancellation = parent.child_cancellation();
        let task_cancellation = cancellation.clone();

        let handle = tokio::spawn(async move {
            let child_id = engine
                .create_child_scope(&parent.id)
                .await
                .map_err(|e| TaskError::Context(e.into()))?;
            let context = ContextLayer::child(parent.context.clone());
            let child_scope = ScopeHandle::new(
                engine.clone(),
                child_id.clone(),
                Some(parent.id.clone()),
                cancellation.clone(),
                context,
            );
            let ctx = DurableContext::new(child_scope);
            let outcome = body(ctx).await;

            // `suspend` is the only thing that observes cancellation; once
            // it returns control, the scope's own code decides when to
            // actually finish (its cleanup path, if any). Whatever it
            // returns, a cancelled scope is always recorded as halted —
            // see the module docs on why this is not a hard race.
            if cancellation.is_cancelled() {
                engine
                    .destroy_scope(&child_id, ScopeOutcome::Halted)
                    .await
                    .map_err(|e| TaskError::Context(e.into()))?;
                return Err(TaskError::Halted);
            }

            match outcome {
                Ok(value) => {
                    let json = serde_json::to_value(&value)
                        .map_err(|e| TaskError::Context(ReducerError::from(e).into()))?;
                    engine
                        .destroy_scope(&child_id, ScopeOutcome::Completed(Some(json)))
                        .await
                        .map_err(|e| TaskError::Context(e.into()))?;
                    Ok(value)
                }
                Err(err) => {
                    let serialized = normalize_error(&err);
                    engine
                        .destroy_scope(&child_id, ScopeOutcome::Failed(serialized))
                        .await
                        .map_err(|e| TaskError::Context(e.into()))?;
                    Err(TaskError::Failed(err))
                }
            }
        });

        DurableTask {
            handle,
            cancellation: task_cancellation,
        }
    }

    /// Builds a durable channel: a live-only resource, reconstructed
    /// fresh on every resume (channels cannot cross a restart — only
    /// their existence is recorded).
    pub async fn channel<T: Send + 'static>(
        &self,
        description: impl Into<String>,
        capacity: usize,
    ) -> Result<DurableChannel<T>, ContextError> {
        self.resource(description, "DurableChannel", move || async move {
            DurableChannel::new(capacity)
        })
        .await
    }

    /// Receives one value from `channel` as a recorded effect: on replay,
    /// the value that was actually received live is returned again
    /// without touching the channel, instead of blocking on a receiver
    /// nothing is sending to anymore.
    pub async fn recv<T>(
        &self,
        description: impl Into<String>,
        channel: &DurableChannel<T>,
    ) -> Result<Option<T>, ContextError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        Ok(self
            .engine()
            .effect::<Option<T>, std::convert::Infallible, _>(
                self.scope.id(),
                description,
                async { Ok(channel.recv().await) },
            )
            .await?)
    }
}

/// A boxed, pinned future — the shape [`race`] and [`all`] accept. They
/// are not effects themselves, only combinators over already-
/// instrumented child effects: only the leaves get recorded.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Returns the first future to complete; the others keep running in the
/// background and are dropped once this returns (mirroring the
/// teacher-adjacent `race` semantics the corpus uses elsewhere —
/// abandoned branches are not cancelled, merely un-awaited).
pub async fn race<T>(futures: Vec<BoxFuture<'_, T>>) -> T {
    let (result, _index, _rest) = futures::future::select_all(futures).await;
    result
}

/// Waits for every future to complete, preserving input order.
pub async fn all<T>(futures: Vec<BoxFuture<'_, T>>) -> Vec<T> {
    futures::future::join_all(futures).await
}

/// The outcome of a spawned scope that did not complete with a value.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    /// The scope was cancelled (by a parent teardown or explicit cancel)
    /// before it completed.
    #[error("spawned scope was halted before completing")]
    Halted,

    /// The scope's body returned an error.
    #[error(transparent)]
    Failed(E),

    /// A durable bookkeeping operation (scope create/destroy) failed.
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// A handle to a spawned child scope.
pub struct DurableTask<T, E> {
    handle: tokio::task::JoinHandle<Result<T, TaskError<E>>>,
    cancellation: tokio_util::sync::CancellationToken,
}

impl<T, E> DurableTask<T, E> {
    /// Cancels the child scope. The task will resolve to
    /// [`TaskError::Halted`] once it observes the cancellation.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Waits for the spawned scope to finish.
    pub async fn join(self) -> Result<T, TaskError<E>> {
        match self.handle.await {
            Ok(result) => result,
            Err(_join_err) => Err(TaskError::Halted),
        }
    }
}

/// A channel whose existence is durably recorded but whose two ends are
/// always freshly constructed, live-only (see [`DurableContext::channel`]).
pub struct DurableChannel<T> {
    sender: tokio::sync::mpsc::Sender<T>,
    receiver: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<T>>,
}

impl<T: Send + 'static> DurableChannel<T> {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    pub async fn send(&self, value: T) -> Result<(), tokio::sync::mpsc::error::SendError<T>> {
        self.sender.send(value).await
    }

    /// Raw, unrecorded receive. Prefer [`DurableContext::recv`] from
    /// workflow code — calling this directly bypasses the replay log, so
    /// a resumed run would block waiting on a sender nothing live is
    /// driving anymore instead of returning the value it already got.
    pub async fn recv(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }
}

impl<T> std::fmt::Debug for DurableChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DurableChannel")
    }
}
