//! The reducer: decides, for every effect and every scope transition,
//! whether the durable stream already has an answer (replay) or whether
//! the workflow must actually run it (live), and keeps those two modes
//! indistinguishable to calling code.
//!
//! Grounded on the teacher's `engine/executor.rs` for error-enum shape
//! and `#[instrument]`/tracing style, and on the `is_live()` branch in
//! golem-llm's `Durability` (see DESIGN.md) for the core record-vs-replay
//! idiom — generalized here from one wrapped call to an arbitrary
//! sequence of effects sharing one frontier.
//!
//! # Concurrency model
//!
//! spec.md's source model is a single-threaded cooperative scheduler:
//! there is never shared-memory parallelism *within* a workflow, only
//! interleaving of logically-independent effects. The Rust translation
//! honors this by making every frontier decision — "does the stream
//! already have an answer for this yield?" — a short critical section
//! guarded by [`Engine::cursor`], a `tokio::sync::Mutex<usize>`. The
//! body of a live effect (the actual `Future` the caller supplies) runs
//! *outside* that lock, so independent effects (e.g. the two arms of a
//! `race`) still make real concurrent progress; only the bookkeeping
//! that assigns them their place in the log is serialized.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, trace};

use crate::event::{create_live_only_sentinel, live_only_value, normalize_error, DurableEvent, ScopeResult, SerializedError};
use crate::id::IdAllocator;
use crate::scope::ScopeId;
use crate::stream::{DurableStream, StreamEntry, StreamError};
use std::sync::Arc;

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on the number of effects a single engine will record,
    /// a guard against runaway loops appending unboundedly to the
    /// stream. Mirrors the teacher's per-workflow event cap.
    pub max_recorded_effects: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recorded_effects: 100_000,
        }
    }
}

/// A description recorded during replay did not match the description the
/// live code produced at the same position in the stream (spec.md §4.5,
/// §8 E5). `offset` is the stream position of the mismatched
/// `effect:yielded` entry.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("history diverged at offset {offset}: expected {expected:?}, got {actual:?}")]
pub struct DivergenceError {
    pub expected: String,
    pub actual: String,
    pub offset: usize,
}

/// Errors the reducer can raise while driving an effect or scope
/// transition.
#[derive(Debug, thiserror::Error)]
pub enum ReducerError {
    /// The live code's execution order no longer matches the recorded
    /// history.
    #[error(transparent)]
    Divergence(#[from] DivergenceError),

    /// The effect itself failed (replayed or freshly run).
    #[error("effect failed: {0}")]
    Effect(SerializedError),

    /// The backing stream rejected an append or read.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A recorded value could not be decoded as the type the caller
    /// requested.
    #[error("failed to decode recorded effect value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// [`EngineConfig::max_recorded_effects`] was reached.
    #[error("exceeded the maximum of {0} recorded effects")]
    TooManyEffects(usize),
}

/// Outcome of a scope finishing, for [`Engine::destroy_scope`].
#[derive(Debug, Clone)]
pub enum ScopeOutcome {
    /// The scope's task returned a value normally.
    Completed(Option<serde_json::Value>),
    /// The scope's task returned an error.
    Failed(SerializedError),
    /// The scope was cancelled rather than completing on its own.
    Halted,
}

enum YieldDecision {
    /// The stream already has a completion recorded for this yield.
    Completed(DurableEvent),
    /// No completion is recorded yet; the caller must run the effect and
    /// append its outcome under `effect_id`.
    RunLive { effect_id: String },
}

/// Effects whose description is exempt from divergence checks. Reserved
/// for internal bookkeeping yields the engine itself might one day need
/// to inject ahead of user code; nothing in this crate currently emits
/// one, but replay must not break if a future version does.
fn is_infra_description(description: &str) -> bool {
    description.starts_with("@durably/infra:")
}

/// The durable reducer: owns the replay frontier and the id allocator,
/// and mediates every effect and scope transition against the attached
/// [`DurableStream`].
pub struct Engine {
    stream: Arc<dyn DurableStream>,
    ids: IdAllocator,
    cursor: tokio::sync::Mutex<usize>,
    config: EngineConfig,
}

impl Engine {
    /// Attaches to `stream`, reading its full recorded prefix to seed the
    /// id allocator. The replay frontier starts at offset 0 regardless of
    /// how much history exists — an empty stream and a fully-replayed one
    /// both just mean "nothing left to replay" once the frontier catches
    /// up to `length()`.
    pub async fn attach(stream: Arc<dyn DurableStream>) -> Result<Self, StreamError> {
        Self::attach_with_config(stream, EngineConfig::default()).await
    }

    pub async fn attach_with_config(
        stream: Arc<dyn DurableStream>,
        config: EngineConfig,
    ) -> Result<Self, StreamError> {
        let entries = stream.read(0).await?;
        let ids = IdAllocator::scan(&entries);
        Ok(Self {
            stream,
            ids,
            cursor: tokio::sync::Mutex::new(0),
            config,
        })
    }

    pub fn stream(&self) -> &Arc<dyn DurableStream> {
        &self.stream
    }

    /// Scans forward from `*cursor` for the first event matching
    /// `predicate`, consuming (skipping past) everything in between. This
    /// is safe because replay determinism guarantees the next thing the
    /// live code actually does is the next thing recorded — see the
    /// module docs.
    async fn consume_next(
        &self,
        cursor: &mut usize,
        predicate: impl Fn(&DurableEvent) -> bool,
    ) -> Result<Option<StreamEntry>, StreamError> {
        let entries = self.stream.read(*cursor).await?;
        for entry in entries {
            if predicate(&entry.event) {
                *cursor = entry.offset + 1;
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Looks for a recorded resolution of `effect_id`, anywhere in the
    /// stream. Independent of the shared cursor: an effect's completion
    /// may be recorded well after other effects' yields.
    async fn find_completion(&self, effect_id: &str) -> Result<Option<DurableEvent>, StreamError> {
        let entries = self.stream.read(0).await?;
        for entry in entries {
            match &entry.event {
                DurableEvent::EffectResolved { effect_id: id, .. }
                | DurableEvent::EffectErrored { effect_id: id, .. }
                    if id == effect_id =>
                {
                    return Ok(Some(entry.event));
                }
                _ => {}
            }
        }
        Ok(None)
    }

    #[instrument(level = "trace", skip(self), fields(scope = %scope, description = %description))]
    async fn decide_yield(&self, scope: &ScopeId, description: &str) -> Result<YieldDecision, ReducerError> {
        let mut cursor = self.cursor.lock().await;
        let len = self.stream.length().await;

        if *cursor < len {
            if let Some(entry) = self
                .consume_next(&mut cursor, |e| matches!(e, DurableEvent::EffectYielded { .. }))
                .await?
            {
                let (effect_id, recorded_description) = match &entry.event {
                    DurableEvent::EffectYielded {
                        effect_id,
                        description,
                        ..
                    } => (effect_id.clone(), description.clone()),
                    _ => unreachable!("predicate only matches EffectYielded"),
                };

                if !is_infra_description(description) && recorded_description != description {
                    return Err(DivergenceError {
                        expected: recorded_description,
                        actual: description.to_string(),
                        offset: entry.offset,
                    }
                    .into());
                }

                drop(cursor);
                return Ok(match self.find_completion(&effect_id).await? {
                    Some(completion) => {
                        trace!(effect_id, "replaying recorded completion");
                        YieldDecision::Completed(completion)
                    }
                    None => {
                        debug!(effect_id, "boundary heal: yield recorded, no completion yet");
                        YieldDecision::RunLive { effect_id }
                    }
                });
            }
        }

        if len + 1 > self.config.max_recorded_effects {
            return Err(ReducerError::TooManyEffects(self.config.max_recorded_effects));
        }

        let effect_id = self.ids.next_effect_id();
        let offset = self
            .stream
            .append(DurableEvent::EffectYielded {
                scope_id: scope.as_str().to_string(),
                effect_id: effect_id.clone(),
                description: description.to_string(),
            })
            .await?;
        *cursor = offset + 1;
        debug!(effect_id, "running live, freshly recorded");
        Ok(YieldDecision::RunLive { effect_id })
    }

    /// Runs a JSON-serializable effect exactly once across any number of
    /// resume cycles: replays its recorded result if one exists, runs
    /// `body` and records the outcome otherwise.
    pub async fn effect<T, E, Fut>(
        &self,
        scope: &ScopeId,
        description: impl Into<String>,
        body: Fut,
    ) -> Result<T, ReducerError>
    where
        T: Serialize + DeserializeOwned,
        E: std::error::Error,
        Fut: Future<Output = Result<T, E>>,
    {
        let description = description.into();
        match self.decide_yield(scope, &description).await? {
            YieldDecision::Completed(DurableEvent::EffectResolved { value, .. }) => {
                Ok(serde_json::from_value(value)?)
            }
            YieldDecision::Completed(DurableEvent::EffectErrored { error, .. }) => {
                Err(ReducerError::Effect(error))
            }
            YieldDecision::Completed(_) => unreachable!("find_completion only returns Resolved/Errored"),
            YieldDecision::RunLive { effect_id } => match body.await {
                Ok(value) => {
                    let json = serde_json::to_value(&value)?;
                    self.stream
                        .append(DurableEvent::EffectResolved {
                            effect_id,
                            value: json,
                        })
                        .await?;
                    Ok(value)
                }
                Err(err) => {
                    let serialized = normalize_error(&err);
                    self.stream
                        .append(DurableEvent::EffectErrored {
                            effect_id,
                            error: serialized.clone(),
                        })
                        .await?;
                    Err(ReducerError::Effect(serialized))
                }
            },
        }
    }

    /// Runs a live-only effect: a value with no faithful JSON
    /// representation (a handle, a channel, a clock reading). Always
    /// actually constructs the value — replay cannot hand back a live
    /// resource, it can only skip re-recording the event pair.
    pub async fn resource<T, F, Fut>(
        &self,
        scope: &ScopeId,
        description: impl Into<String>,
        type_name: impl Into<String>,
        make: F,
    ) -> Result<T, ReducerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        T: std::fmt::Debug,
    {
        let description = description.into();
        let decision = self.decide_yield(scope, &description).await?;
        let value = make().await;
        if let YieldDecision::RunLive { effect_id } = decision {
            let sentinel = create_live_only_sentinel(type_name.into(), format!("{value:?}"));
            self.stream
                .append(DurableEvent::EffectResolved {
                    effect_id,
                    value: live_only_value(&sentinel),
                })
                .await?;
        }
        Ok(value)
    }

    /// Parks until `cancellation` fires, recording the suspend point at
    /// most once. A suspend never resolves on its own: it only ends via
    /// the enclosing scope being torn down (see [`Engine::destroy_scope`]).
    ///
    /// If history already shows this scope was halted (a prior run was
    /// cancelled here, crashed before its cleanup finished, and is now
    /// being replayed), control is handed back immediately instead of
    /// parking on a cancellation token nothing will ever fire — the
    /// historical halt already happened, replaying it should not require
    /// a fresh cancel.
    pub async fn suspend(
        &self,
        scope: &ScopeId,
        cancellation: &tokio_util::sync::CancellationToken,
    ) -> Result<(), ReducerError> {
        match self.decide_yield(scope, "suspend").await? {
            YieldDecision::Completed(_) => Ok(()),
            YieldDecision::RunLive { .. } => {
                if self.scope_already_halted(scope).await? {
                    return Ok(());
                }
                cancellation.cancelled().await;
                Ok(())
            }
        }
    }

    async fn scope_already_halted(&self, scope: &ScopeId) -> Result<bool, StreamError> {
        let entries = self.stream.read(0).await?;
        Ok(entries.iter().any(|entry| {
            matches!(
                &entry.event,
                DurableEvent::ScopeDestroyed {
                    scope_id,
                    result: ScopeResult::Err { error },
                } if scope_id == scope.as_str() && error.name == crate::event::HALT_ERROR_NAME
            )
        }))
    }

    /// Records a context slot write. Unconditional: context ops are not
    /// replay-matched, they simply re-execute and re-append every run
    /// (spec.md §4.4's rationale for excluding them from the frontier).
    pub async fn set_context(
        &self,
        scope: &ScopeId,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StreamError> {
        self.stream
            .append(DurableEvent::ScopeSet {
                scope_id: scope.as_str().to_string(),
                context_name: name.to_string(),
                value,
            })
            .await?;
        Ok(())
    }

    /// Records a context slot deletion. See [`Engine::set_context`].
    pub async fn delete_context(&self, scope: &ScopeId, name: &str) -> Result<(), StreamError> {
        self.stream
            .append(DurableEvent::ScopeDelete {
                scope_id: scope.as_str().to_string(),
                context_name: name.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Creates the reserved root scope, matching its recorded creation if
    /// one exists (a stream resumed from a prior run) or appending a
    /// fresh one (a brand-new stream).
    #[instrument(level = "debug", skip(self))]
    pub async fn create_root_scope(&self) -> Result<ScopeId, StreamError> {
        self.create_scope_inner(None, Some(crate::scope::ROOT_SCOPE_ID.to_string()))
            .await
    }

    /// Creates a child scope under `parent`, matching its recorded
    /// creation during replay or allocating and appending a fresh id.
    #[instrument(level = "debug", skip(self), fields(parent = %parent))]
    pub async fn create_child_scope(&self, parent: &ScopeId) -> Result<ScopeId, StreamError> {
        self.create_scope_inner(Some(parent.as_str().to_string()), None)
            .await
    }

    async fn create_scope_inner(
        &self,
        parent: Option<String>,
        fixed_id: Option<String>,
    ) -> Result<ScopeId, StreamError> {
        let mut cursor = self.cursor.lock().await;
        let len = self.stream.length().await;

        if *cursor < len {
            let parent_ref = parent.clone();
            if let Some(entry) = self
                .consume_next(&mut cursor, move |e| {
                    matches!(e, DurableEvent::ScopeCreated { parent_scope_id, .. } if *parent_scope_id == parent_ref)
                })
                .await?
            {
                if let DurableEvent::ScopeCreated { scope_id, .. } = entry.event {
                    debug!(scope_id, "replaying scope creation");
                    return Ok(ScopeId(scope_id));
                }
            }
        }

        let id = fixed_id.unwrap_or_else(|| self.ids.next_scope_id());
        let offset = self
            .stream
            .append(DurableEvent::ScopeCreated {
                scope_id: id.clone(),
                parent_scope_id: parent,
            })
            .await?;
        *cursor = offset + 1;
        debug!(scope_id = %id, "freshly created scope");
        Ok(ScopeId(id))
    }

    /// Records (or matches) a scope's terminal transition. On replay,
    /// finding the recorded `scope:destroyed` for this scope is enough —
    /// the live code recomputes the same return value by actually
    /// re-running, so no value needs to be read back out of the log.
    #[instrument(level = "debug", skip(self, outcome), fields(scope = %scope))]
    pub async fn destroy_scope(&self, scope: &ScopeId, outcome: ScopeOutcome) -> Result<(), StreamError> {
        let mut cursor = self.cursor.lock().await;
        let len = self.stream.length().await;

        if *cursor < len {
            let target = scope.as_str().to_string();
            if self
                .consume_next(&mut cursor, move |e| {
                    matches!(e, DurableEvent::ScopeDestroyed { scope_id, .. } if *scope_id == target)
                })
                .await?
                .is_some()
            {
                debug!("replaying scope teardown");
                return Ok(());
            }
        }
        drop(cursor);

        match outcome {
            ScopeOutcome::Completed(value) => {
                if let Some(value) = value {
                    self.stream
                        .append(DurableEvent::WorkflowReturn {
                            scope_id: scope.as_str().to_string(),
                            value,
                        })
                        .await?;
                }
                self.stream
                    .append(DurableEvent::ScopeDestroyed {
                        scope_id: scope.as_str().to_string(),
                        result: ScopeResult::Ok,
                    })
                    .await?;
            }
            ScopeOutcome::Failed(error) => {
                self.stream
                    .append(DurableEvent::ScopeDestroyed {
                        scope_id: scope.as_str().to_string(),
                        result: ScopeResult::Err { error },
                    })
                    .await?;
            }
            ScopeOutcome::Halted => {
                self.stream
                    .append(DurableEvent::ScopeDestroyed {
                        scope_id: scope.as_str().to_string(),
                        result: ScopeResult::Err {
                            error: SerializedError::halt(),
                        },
                    })
                    .await?;
            }
        }
        debug!("freshly recorded scope teardown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::InMemoryDurableStream;
    use std::convert::Infallible;

    fn root() -> ScopeId {
        ScopeId::root()
    }

    #[tokio::test]
    async fn fresh_effect_runs_live_and_records_resolution() {
        let stream: Arc<dyn DurableStream> = Arc::new(InMemoryDurableStream::new());
        let engine = Engine::attach(stream.clone()).await.unwrap();
        let value: i32 = engine
            .effect(&root(), "add(1, 2)", async { Ok::<_, Infallible>(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(stream.length().await, 2);
    }

    #[tokio::test]
    async fn replayed_effect_does_not_rerun_body() {
        let stream: Arc<dyn DurableStream> = Arc::new(InMemoryDurableStream::from(
            vec![
                DurableEvent::EffectYielded {
                    scope_id: "root".into(),
                    effect_id: "effect-0".into(),
                    description: "add(1, 2)".into(),
                },
                DurableEvent::EffectResolved {
                    effect_id: "effect-0".into(),
                    value: serde_json::json!(3),
                },
            ],
            false,
        ));
        let engine = Engine::attach(stream.clone()).await.unwrap();
        let ran = std::sync::atomic::AtomicBool::new(false);
        let value: i32 = engine
            .effect(&root(), "add(1, 2)", async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, Infallible>(999)
            })
            .await
            .unwrap();
        assert_eq!(value, 3, "must return the recorded value, not the live one");
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(stream.length().await, 2, "must not append anything new");
    }

    #[tokio::test]
    async fn mismatched_description_raises_divergence() {
        let stream: Arc<dyn DurableStream> = Arc::new(InMemoryDurableStream::from(
            vec![DurableEvent::EffectYielded {
                scope_id: "root".into(),
                effect_id: "effect-0".into(),
                description: "sleep(1)".into(),
            }],
            false,
        ));
        let engine = Engine::attach(stream).await.unwrap();
        let err = engine
            .effect(&root(), "sleep(2)", async { Ok::<i32, Infallible>(0) })
            .await
            .unwrap_err();
        match err {
            ReducerError::Divergence(d) => {
                assert_eq!(d.expected, "sleep(1)");
                assert_eq!(d.actual, "sleep(2)");
                assert_eq!(d.offset, 0);
            }
            other => panic!("expected Divergence, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn boundary_heal_runs_unresolved_recorded_yield_live() {
        let stream: Arc<dyn DurableStream> = Arc::new(InMemoryDurableStream::from(
            vec![DurableEvent::EffectYielded {
                scope_id: "root".into(),
                effect_id: "effect-0".into(),
                description: "flaky()".into(),
            }],
            false,
        ));
        let engine = Engine::attach(stream.clone()).await.unwrap();
        let value: i32 = engine
            .effect(&root(), "flaky()", async { Ok::<_, Infallible>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(stream.length().await, 2, "completion must be appended");
    }

    #[tokio::test]
    async fn root_scope_creation_is_idempotent_across_resumes() {
        let stream: Arc<dyn DurableStream> = Arc::new(InMemoryDurableStream::new());
        let engine = Engine::attach(stream.clone()).await.unwrap();
        let first = engine.create_root_scope().await.unwrap();
        assert_eq!(first.as_str(), "root");
        assert_eq!(stream.length().await, 1);

        // A second engine resuming the same stream must match, not duplicate.
        let resumed = Engine::attach(stream.clone()).await.unwrap();
        let second = resumed.create_root_scope().await.unwrap();
        assert_eq!(second.as_str(), "root");
        assert_eq!(stream.length().await, 1, "must not append a duplicate creation");
    }

    #[tokio::test]
    async fn destroy_scope_is_idempotent_across_resumes() {
        let stream: Arc<dyn DurableStream> = Arc::new(InMemoryDurableStream::new());
        let engine = Engine::attach(stream.clone()).await.unwrap();
        let scope = engine.create_root_scope().await.unwrap();
        engine
            .destroy_scope(&scope, ScopeOutcome::Completed(Some(serde_json::json!(42))))
            .await
            .unwrap();
        let len_after_first = stream.length().await;

        let resumed = Engine::attach(stream.clone()).await.unwrap();
        let scope = resumed.create_root_scope().await.unwrap();
        resumed
            .destroy_scope(&scope, ScopeOutcome::Completed(Some(serde_json::json!(42))))
            .await
            .unwrap();
        assert_eq!(stream.length().await, len_after_first);
    }
}
