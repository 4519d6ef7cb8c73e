//! The public entry point: attach to a stream, open (or resume) the root
//! scope, and run the operation as a genuinely separate task so the
//! caller's own cancellation/await semantics stay entirely theirs.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::context::{ContextError, DurableContext, TaskError};
use crate::engine::{Engine, EngineConfig, ReducerError, ScopeOutcome};
use crate::event::normalize_error;
use crate::scope::{ContextLayer, ScopeHandle};
use crate::stream::{DurableStream, StreamError};

/// Errors raised while attaching to a stream or opening its root scope.
/// Once the operation is actually running, failures surface through
/// [`DurablyHandle::join`] as [`TaskError`] instead.
#[derive(Debug, thiserror::Error)]
pub enum DurablyError {
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Runs `operation` durably against `stream`: replays whatever prefix of
/// recorded effects already exists, then transitions to live execution
/// for the rest. Returns a handle the caller can await or cancel;
/// `operation` itself runs on its own task, not inlined into this
/// `durably` call.
#[instrument(level = "info", skip(stream, operation))]
pub async fn durably<F, Fut, T, E>(
    stream: Arc<dyn DurableStream>,
    operation: F,
) -> Result<DurablyHandle<T, E>, DurablyError>
where
    F: FnOnce(DurableContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    durably_with_config(stream, EngineConfig::default(), operation).await
}

/// As [`durably`], with explicit [`EngineConfig`].
pub async fn durably_with_config<F, Fut, T, E>(
    stream: Arc<dyn DurableStream>,
    config: EngineConfig,
    operation: F,
) -> Result<DurablyHandle<T, E>, DurablyError>
where
    F: FnOnce(DurableContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let engine = Arc::new(Engine::attach_with_config(stream, config).await?);
    let root_id = engine.create_root_scope().await?;
    let cancellation = CancellationToken::new();
    let context = ContextLayer::root();
    let scope = ScopeHandle::new(
        engine.clone(),
        root_id.clone(),
        None,
        cancellation.clone(),
        context,
    );
    let ctx = DurableContext::new(scope);
    let task_cancellation = cancellation.clone();

    let handle = tokio::spawn(async move {
        let outcome = operation(ctx).await;

        // See `DurableContext::spawn` for why this is a post-hoc check
        // rather than a race: `suspend` is the only thing that observes
        // cancellation, and it hands control back to the workflow's own
        // code (its cleanup path, if any) instead of force-unwinding it.
        if cancellation.is_cancelled() {
            engine
                .destroy_scope(&root_id, ScopeOutcome::Halted)
                .await
                .map_err(|e| TaskError::Context(ContextError::from(e)))?;
            return Err(TaskError::Halted);
        }

        match outcome {
            Ok(value) => {
                let json = serde_json::to_value(&value)
                    .map_err(|e| TaskError::Context(ReducerError::from(e).into()))?;
                engine
                    .destroy_scope(&root_id, ScopeOutcome::Completed(Some(json)))
                    .await
                    .map_err(|e| TaskError::Context(ContextError::from(e)))?;
                Ok(value)
            }
            Err(err) => {
                let serialized = normalize_error(&err);
                engine
                    .destroy_scope(&root_id, ScopeOutcome::Failed(serialized))
                    .await
                    .map_err(|e| TaskError::Context(ContextError::from(e)))?;
                Err(TaskError::Failed(err))
            }
        }
    });

    Ok(DurablyHandle {
        handle,
        cancellation: task_cancellation,
    })
}

/// A handle to a running `durably` invocation. The stream is never
/// closed by this crate — closing it (or not) is the stream backend's
/// decision, made independently of how the root scope concluded.
pub struct DurablyHandle<T, E> {
    handle: tokio::task::JoinHandle<Result<T, TaskError<E>>>,
    cancellation: CancellationToken,
}

impl<T, E> DurablyHandle<T, E> {
    /// Cancels the root scope (and therefore every descendant scope).
    /// The run resolves to [`TaskError::Halted`] once it observes this.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Waits for the operation to finish, live or replayed.
    pub async fn join(self) -> Result<T, TaskError<E>> {
        match self.handle.await {
            Ok(result) => result,
            Err(_join_err) => Err(TaskError::Halted),
        }
    }
}
