//! Deterministic id allocation, seeded from a stream's recorded prefix.
//!
//! Grounded on the teacher's sequence-counter handling in
//! `persistence/memory.rs` (`AtomicI32` sequence state), generalized to
//! the two id namespaces spec.md §4.3 requires: effect ids (`effect-N`)
//! and non-root scope ids (`scope-N`).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::DurableEvent;
use crate::stream::StreamEntry;

const EFFECT_PREFIX: &str = "effect-";
const SCOPE_PREFIX: &str = "scope-";

/// Allocates fresh effect/scope ids that never collide with ids already
/// present in the attached stream, across any number of resume cycles.
pub struct IdAllocator {
    next_effect: AtomicU64,
    next_scope: AtomicU64,
}

impl IdAllocator {
    /// Scans `entries` for the highest numeric suffix used by any
    /// `effect:yielded.effect_id` or non-root `scope:created.scope_id`,
    /// and starts allocation at `max + 1`.
    pub fn scan(entries: &[StreamEntry]) -> Self {
        let mut max_effect: Option<u64> = None;
        let mut max_scope: Option<u64> = None;

        for entry in entries {
            match &entry.event {
                DurableEvent::EffectYielded { effect_id, .. } => {
                    if let Some(n) = parse_suffix(effect_id, EFFECT_PREFIX) {
                        max_effect = Some(max_effect.map_or(n, |m| m.max(n)));
                    }
                }
                DurableEvent::ScopeCreated { scope_id, .. } => {
                    if let Some(n) = parse_suffix(scope_id, SCOPE_PREFIX) {
                        max_scope = Some(max_scope.map_or(n, |m| m.max(n)));
                    }
                }
                _ => {}
            }
        }

        Self {
            next_effect: AtomicU64::new(max_effect.map_or(0, |n| n + 1)),
            next_scope: AtomicU64::new(max_scope.map_or(0, |n| n + 1)),
        }
    }

    /// An allocator seeded from no recorded entries — ids start at 0.
    pub fn fresh() -> Self {
        Self {
            next_effect: AtomicU64::new(0),
            next_scope: AtomicU64::new(0),
        }
    }

    /// Allocates the next `effect-N` id. Never reuses an id, even across
    /// boundary heals.
    pub fn next_effect_id(&self) -> String {
        let n = self.next_effect.fetch_add(1, Ordering::SeqCst);
        format!("{EFFECT_PREFIX}{n}")
    }

    /// Allocates the next `scope-N` id for a non-root scope.
    pub fn next_scope_id(&self) -> String {
        let n = self.next_scope.fetch_add(1, Ordering::SeqCst);
        format!("{SCOPE_PREFIX}{n}")
    }
}

fn parse_suffix(id: &str, prefix: &str) -> Option<u64> {
    id.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_allocator_starts_at_zero() {
        let ids = IdAllocator::fresh();
        assert_eq!(ids.next_effect_id(), "effect-0");
        assert_eq!(ids.next_effect_id(), "effect-1");
        assert_eq!(ids.next_scope_id(), "scope-0");
    }

    #[test]
    fn scan_seeds_past_the_highest_recorded_id() {
        let entries = vec![
            StreamEntry {
                offset: 0,
                event: DurableEvent::EffectYielded {
                    scope_id: "root".into(),
                    effect_id: "effect-3".into(),
                    description: "sleep(1)".into(),
                },
            },
            StreamEntry {
                offset: 1,
                event: DurableEvent::ScopeCreated {
                    scope_id: "scope-1".into(),
                    parent_scope_id: Some("root".into()),
                },
            },
            StreamEntry {
                offset: 2,
                event: DurableEvent::EffectYielded {
                    scope_id: "root".into(),
                    effect_id: "effect-1".into(),
                    description: "other".into(),
                },
            },
        ];

        let ids = IdAllocator::scan(&entries);
        assert_eq!(ids.next_effect_id(), "effect-4");
        assert_eq!(ids.next_scope_id(), "scope-2");
    }

    #[test]
    fn never_reuses_ids_across_allocations() {
        let ids = IdAllocator::fresh();
        let allocated: Vec<_> = (0..5).map(|_| ids.next_effect_id()).collect();
        let unique: std::collections::HashSet<_> = allocated.iter().collect();
        assert_eq!(unique.len(), allocated.len());
    }
}
