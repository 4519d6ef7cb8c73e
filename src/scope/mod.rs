//! Scope identity and live handles.
//!
//! A scope is the structured-concurrency unit spec.md builds everything
//! else on top of: every effect happens inside exactly one scope, every
//! scope but root has exactly one parent, and cancelling a scope cancels
//! its whole subtree. `ScopeId` is the durable, replay-stable identity;
//! `ScopeHandle` is the live, in-process handle a running task actually
//! holds (cancellation token, parent link, engine reference, inherited
//! context slots).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;

/// The reserved id of the outermost scope created by [`crate::durably`].
pub const ROOT_SCOPE_ID: &str = "root";

/// A scope's durable identity: `"root"` or an allocated `"scope-N"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) String);

impl ScopeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn root() -> Self {
        Self(ROOT_SCOPE_ID.to_string())
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScopeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One scope's layer of context slots, chained to its parent's layer. A
/// lookup checks this scope first, then walks up the chain — a child
/// sees everything its ancestors set, shadowed by its own writes.
pub struct ContextLayer {
    parent: Option<Arc<ContextLayer>>,
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl ContextLayer {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            values: RwLock::new(HashMap::new()),
        })
    }

    pub fn child(parent: Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(parent),
            values: RwLock::new(HashMap::new()),
        })
    }

    pub fn set(&self, name: &str, value: serde_json::Value) {
        self.values.write().insert(name.to_string(), value);
    }

    pub fn delete(&self, name: &str) {
        self.values.write().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<serde_json::Value> {
        if let Some(value) = self.values.read().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }
}

/// A live handle to a scope: the engine it replays/records against, its
/// durable id, the cancellation token that tears it (and its children)
/// down, and its context layer. Cloning a handle is cheap; every clone
/// refers to the same scope.
#[derive(Clone)]
pub struct ScopeHandle {
    pub(crate) engine: Arc<Engine>,
    pub(crate) id: ScopeId,
    pub(crate) parent: Option<ScopeId>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) context: Arc<ContextLayer>,
}

impl ScopeHandle {
    pub(crate) fn new(
        engine: Arc<Engine>,
        id: ScopeId,
        parent: Option<ScopeId>,
        cancellation: CancellationToken,
        context: Arc<ContextLayer>,
    ) -> Self {
        Self {
            engine,
            id,
            parent,
            cancellation,
            context,
        }
    }

    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    pub fn parent(&self) -> Option<&ScopeId> {
        self.parent.as_ref()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// A child token: cancelling `self` cancels it, cancelling it does
    /// not affect `self`.
    pub(crate) fn child_cancellation(&self) -> CancellationToken {
        self.cancellation.child_token()
    }
}
