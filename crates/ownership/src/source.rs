//! Tree sources besides the live cluster: the revision store pinned at a revision.

use async_trait::async_trait;
use kube::core::DynamicObject;
use kview_core::{Error, ListQuery, ObjectReader, ObjectRef, ObjectType, Result, Revision};
use kview_store::RevisionStore;

/// Reads the latest retained snapshot of each object at or before `revision`.
pub struct RevisionSource<'a> {
    store: &'a RevisionStore,
    revision: Revision,
}

impl<'a> RevisionSource<'a> {
    pub fn new(store: &'a RevisionStore, revision: Revision) -> Self {
        Self { store, revision }
    }
}

#[async_trait]
impl<'a> ObjectReader for RevisionSource<'a> {
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject> {
        self.store
            .get_at_or_before(key, self.revision)
            .map(|s| (*s).clone())
            .ok_or_else(|| Error::not_found(format!("{} at or before revision {}", key, self.revision)))
    }

    async fn list(&self, object_type: &ObjectType, query: &ListQuery) -> Result<Vec<DynamicObject>> {
        Ok(self
            .store
            .list(object_type)
            .into_values()
            .filter_map(|revs| revs.range(..=self.revision).next_back().map(|(_, s)| (**s).clone()))
            .filter(|o| query.matches(o))
            .collect())
    }
}
