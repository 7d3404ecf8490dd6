//! Object access traits. The planner talks to the cluster (real, fake or simulated)
//! only through these.

use async_trait::async_trait;
use kube::core::DynamicObject;

use crate::{selector::Labels, Error, ObjectRef, ObjectType, Result};

/// Filter for list calls. An empty label map matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub labels: Labels,
}

impl ListQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: Option<&str>) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), labels: Labels::new() }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.metadata.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        crate::selector::matches(&self.labels, obj.metadata.labels.as_ref())
    }
}

#[async_trait]
pub trait ObjectReader: Send + Sync {
    /// Fetch one object; a missing object is `Error::NotFound`.
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject>;

    async fn list(&self, object_type: &ObjectType, query: &ListQuery) -> Result<Vec<DynamicObject>>;

    async fn get_opt(&self, key: &ObjectRef) -> Result<Option<DynamicObject>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
pub trait ObjectClient: ObjectReader {
    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to the stored object.
    async fn patch(&self, key: &ObjectRef, patch: &serde_json::Value) -> Result<DynamicObject>;

    async fn delete(&self, key: &ObjectRef) -> Result<()>;
}
