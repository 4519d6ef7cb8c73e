//! Durable event model and JSON-safety helpers
//!
//! Every state change a durably-wrapped workflow makes is turned into a
//! [`DurableEvent`] and appended to the attached [`crate::stream::DurableStream`].
//! Replay reconstructs execution by reading this log back, not by
//! serializing arbitrary program state — see the crate root docs.

use serde::{Deserialize, Serialize};

/// Events persisted to the durable stream.
///
/// Mirrors the teacher's `WorkflowEvent` encoding convention: a `type`
/// discriminator in snake_case, one variant per lifecycle/effect moment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DurableEvent {
    /// A workflow yielded an effect; recorded before the effect executes.
    EffectYielded {
        scope_id: String,
        effect_id: String,
        description: String,
    },

    /// An effect completed normally.
    EffectResolved {
        effect_id: String,
        value: serde_json::Value,
    },

    /// An effect completed abnormally.
    EffectErrored {
        effect_id: String,
        error: SerializedError,
    },

    /// A new scope started. The root scope has the reserved id `"root"`
    /// and no parent.
    ScopeCreated {
        scope_id: String,
        parent_scope_id: Option<String>,
    },

    /// A scope completed.
    ScopeDestroyed {
        scope_id: String,
        result: ScopeResult,
    },

    /// A context slot was set in a scope. Informational: context ops
    /// re-execute on replay rather than being replay-matched.
    ScopeSet {
        scope_id: String,
        context_name: String,
        value: serde_json::Value,
    },

    /// A context slot was deleted. Informational, see [`DurableEvent::ScopeSet`].
    ScopeDelete {
        scope_id: String,
        context_name: String,
    },

    /// Emitted immediately before `ScopeDestroyed { result: Ok }` to record
    /// a task's return value. At most once per scope.
    WorkflowReturn {
        scope_id: String,
        value: serde_json::Value,
    },
}

impl DurableEvent {
    /// The scope this event pertains to, if any.
    pub fn scope_id(&self) -> Option<&str> {
        match self {
            Self::EffectYielded { scope_id, .. }
            | Self::ScopeCreated { scope_id, .. }
            | Self::ScopeDestroyed { scope_id, .. }
            | Self::ScopeSet { scope_id, .. }
            | Self::ScopeDelete { scope_id, .. }
            | Self::WorkflowReturn { scope_id, .. } => Some(scope_id),
            Self::EffectResolved { .. } | Self::EffectErrored { .. } => None,
        }
    }

    /// The effect id this event pertains to, if any.
    pub fn effect_id(&self) -> Option<&str> {
        match self {
            Self::EffectYielded { effect_id, .. }
            | Self::EffectResolved { effect_id, .. }
            | Self::EffectErrored { effect_id, .. } => Some(effect_id),
            _ => None,
        }
    }
}

/// The outcome recorded in a [`DurableEvent::ScopeDestroyed`] event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ScopeResult {
    Ok,
    Err { error: SerializedError },
}

/// A normalized, serializable error: name, message, and an optional stack
/// trace rendering. Any thrown/returned failure that is not already in
/// this shape is wrapped so `message` is always a string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for SerializedError {}

/// The reserved id for the `HaltError` recorded when a scope is cancelled
/// rather than completed or failed (spec.md §4.4, §5).
pub const HALT_ERROR_NAME: &str = "HaltError";

impl SerializedError {
    /// The error recorded for a scope that was halted/cancelled rather
    /// than completed.
    pub fn halt() -> Self {
        Self::new(HALT_ERROR_NAME, "scope was halted")
    }
}

/// Normalizes any error into its recorded [`SerializedError`] form.
///
/// Rust errors are always well-typed (unlike JS throwables, which may be
/// arbitrary values), so this is a straightforward `Display`/`Debug`
/// projection rather than a runtime type check — but it is still the
/// single place that guarantees `message` is always populated.
pub fn normalize_error<E: std::error::Error>(err: &E) -> SerializedError {
    SerializedError {
        name: std::any::type_name::<E>().to_string(),
        message: err.to_string(),
        stack: None,
    }
}

/// The JSON sentinel recorded in place of a value that cannot survive a
/// JSON round trip (live scope handles, abort tokens, channels, anything
/// without a serde impl). `__type` is a short label for the value's kind;
/// `__to_string` is a human-readable rendering. See spec.md §3/§4.2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveOnlySentinel {
    #[serde(rename = "__liveOnly")]
    pub live_only: bool,
    #[serde(rename = "__type")]
    pub type_name: String,
    #[serde(rename = "__toString")]
    pub to_string: String,
}

/// Builds a [`LiveOnlySentinel`] for a value that must be recorded but
/// cannot be reconstructed from the log.
pub fn create_live_only_sentinel(type_name: impl Into<String>, rendering: impl Into<String>) -> LiveOnlySentinel {
    LiveOnlySentinel {
        live_only: true,
        type_name: type_name.into(),
        to_string: rendering.into(),
    }
}

/// Encodes a [`LiveOnlySentinel`] as the `serde_json::Value` that gets
/// recorded in an event's `value`/`error` field.
pub fn live_only_value(sentinel: &LiveOnlySentinel) -> serde_json::Value {
    serde_json::to_value(sentinel).expect("LiveOnlySentinel is always JSON-safe")
}

/// True if `value` is the JSON encoding of a [`LiveOnlySentinel`].
pub fn is_live_only(value: &serde_json::Value) -> bool {
    value
        .get("__liveOnly")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_uses_snake_case_tag() {
        let event = DurableEvent::EffectYielded {
            scope_id: "root".into(),
            effect_id: "effect-1".into(),
            description: "sleep(1)".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"effect_yielded\""));
        let parsed: DurableEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn live_only_sentinel_round_trips_and_is_detected() {
        let sentinel = create_live_only_sentinel("AbortSignal", "AbortSignal { aborted: false }");
        let value = live_only_value(&sentinel);
        assert!(is_live_only(&value));
        assert!(!is_live_only(&serde_json::json!({"ok": true})));
    }

    #[test]
    fn serialized_error_display() {
        let err = SerializedError::new("ValueError", "bad input");
        assert_eq!(err.to_string(), "ValueError: bad input");
    }
}
