//! Per-type reconcile logic that a plan drives against the mock client.

use std::sync::Arc;

use async_trait::async_trait;
use kview_core::{ObjectClient, ObjectRef, ObjectType};
use rustc_hash::FxHashMap;

/// Controller logic for one object type. Implementations see only the client they
/// are handed, so the same logic runs against a live cluster or a simulation.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn object_type(&self) -> ObjectType;

    async fn reconcile(&self, client: &dyn ObjectClient, key: &ObjectRef) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct ReconcilerSet {
    by_type: FxHashMap<ObjectType, Arc<dyn Reconciler>>,
}

impl ReconcilerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `reconciler`, replacing any earlier one for the same type.
    pub fn with(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.by_type.insert(reconciler.object_type(), reconciler);
        self
    }

    pub fn get(&self, object_type: &ObjectType) -> Option<&Arc<dyn Reconciler>> {
        self.by_type.get(object_type)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

impl std::fmt::Debug for ReconcilerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().map(|t| t.key()).collect();
        types.sort();
        f.debug_struct("ReconcilerSet").field("types", &types).finish()
    }
}
