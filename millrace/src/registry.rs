//! The computation registry.
//!
//! Every computation the worker knows about owns three collaterals: its
//! descriptor, its commit output queue, and its executor free-list. The
//! registry stores them as one entry per id, so a successful lookup
//! guarantees all three exist — there is no window where a computation is
//! registered but its queue or free-list is missing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::commit::OutputQueue;
use crate::descriptor::{ComputationDescriptor, ComputationId};
use crate::executor::ExecutorStack;

/// The per-computation collaterals bundled under one registry entry.
pub struct ComputationState {
    descriptor: ComputationDescriptor,
    output_queue: OutputQueue,
    executors: ExecutorStack,
}

impl ComputationState {
    fn new(descriptor: ComputationDescriptor) -> Self {
        Self {
            descriptor,
            output_queue: OutputQueue::new(),
            executors: ExecutorStack::new(),
        }
    }

    /// The computation's descriptor.
    pub fn descriptor(&self) -> &ComputationDescriptor {
        &self.descriptor
    }

    /// Commit requests awaiting aggregation.
    pub fn output_queue(&self) -> &OutputQueue {
        &self.output_queue
    }

    /// Idle executor pairs.
    pub fn executors(&self) -> &ExecutorStack {
        &self.executors
    }
}

/// Concurrent map from computation id to its collaterals.
///
/// Writers are startup registration and the dispatch loop's lazy
/// configuration fetch; readers are every actor. Registration is
/// idempotent: the first descriptor for an id wins and repeats are
/// ignored.
#[derive(Default)]
pub struct ComputationRegistry {
    inner: RwLock<HashMap<ComputationId, Arc<ComputationState>>>,
}

impl ComputationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a computation. Returns `true` when the id was new.
    pub fn register(&self, descriptor: ComputationDescriptor) -> bool {
        let mut map = self.inner.write();
        if map.contains_key(&descriptor.computation_id) {
            return false;
        }
        tracing::info!(
            computation = %descriptor.computation_id,
            "adding computation configuration"
        );
        let id = descriptor.computation_id.clone();
        map.insert(id, Arc::new(ComputationState::new(descriptor)));
        true
    }

    /// Look up a computation's collaterals.
    pub fn lookup(&self, id: &ComputationId) -> Option<Arc<ComputationState>> {
        self.inner.read().get(id).cloned()
    }

    /// Whether the id is registered.
    pub fn contains(&self, id: &ComputationId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// All registered ids, sorted.
    pub fn ids(&self) -> Vec<ComputationId> {
        let mut ids: Vec<ComputationId> =
            self.inner.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all entries, sorted by id. The commit aggregator drains
    /// queues in this order, so within one pass the order is stable.
    pub fn snapshot(&self) -> Vec<(ComputationId, Arc<ComputationState>)> {
        let mut entries: Vec<(ComputationId, Arc<ComputationState>)> = self
            .inner
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), Arc::clone(state)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Close every idle executor in every free-list. Used at shutdown.
    pub fn drain_executors(&self) {
        for (_, state) in self.snapshot() {
            state.executors().drain_and_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> ComputationDescriptor {
        ComputationDescriptor {
            computation_id: ComputationId::from(id),
            stages: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_register_initializes_all_collaterals() {
        let registry = ComputationRegistry::new();
        assert!(registry.register(descriptor("c1")));

        let state = registry.lookup(&ComputationId::from("c1")).unwrap();
        assert_eq!(state.descriptor().computation_id.as_str(), "c1");
        assert!(state.output_queue().is_empty());
        assert_eq!(state.executors().depth(), 0);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = ComputationRegistry::new();
        assert!(registry.register(descriptor("c1")));

        let first = registry.lookup(&ComputationId::from("c1")).unwrap();
        assert!(!registry.register(ComputationDescriptor {
            computation_id: ComputationId::from("c1"),
            stages: serde_json::json!({"replacement": true}),
        }));

        // First registration wins; the entry is untouched.
        let second = registry.lookup(&ComputationId::from("c1")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.descriptor().stages.is_null());
        assert_eq!(registry.ids().len(), 1);
    }

    #[test]
    fn test_lookup_absent() {
        let registry = ComputationRegistry::new();
        assert!(registry.lookup(&ComputationId::from("nope")).is_none());
        assert!(!registry.contains(&ComputationId::from("nope")));
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let registry = ComputationRegistry::new();
        registry.register(descriptor("c3"));
        registry.register(descriptor("c1"));
        registry.register(descriptor("c2"));

        let ids: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|(id, _)| id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }
}
