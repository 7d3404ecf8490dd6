//! Served-type registry: which object types the cluster serves, and their scope.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::ObjectType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub plural: String,
    pub namespaced: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: FxHashMap<ObjectType, TypeInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object_type: ObjectType, info: TypeInfo) {
        self.types.insert(object_type, info);
    }

    /// Register a type with a naive lowercase plural; used by tests and fakes.
    pub fn with(mut self, api_version: &str, kind: &str, namespaced: bool) -> Self {
        let plural = format!("{}s", kind.to_ascii_lowercase());
        self.insert(ObjectType::new(api_version, kind), TypeInfo { plural, namespaced });
        self
    }

    pub fn get(&self, object_type: &ObjectType) -> Option<&TypeInfo> {
        self.types.get(object_type)
    }

    pub fn is_served(&self, object_type: &ObjectType) -> bool {
        self.types.contains_key(object_type)
    }

    /// Unknown types are treated as namespaced.
    pub fn is_namespaced(&self, object_type: &ObjectType) -> bool {
        self.types.get(object_type).map(|t| t.namespaced).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Entries in `(apiVersion, kind)` order.
    pub fn sorted(&self) -> Vec<(&ObjectType, &TypeInfo)> {
        let mut out: Vec<_> = self.types.iter().collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    /// Core resources the planner relies on regardless of installed CRDs.
    pub fn builtin() -> Self {
        Self::new()
            .with("v1", "Pod", true)
            .with("v1", "Service", true)
            .with("v1", "Secret", true)
            .with("v1", "ConfigMap", true)
            .with("v1", "PersistentVolumeClaim", true)
            .with("v1", "PersistentVolume", false)
            .with("v1", "ServiceAccount", true)
            .with("v1", "Event", true)
            .with("apps/v1", "StatefulSet", true)
            .with("apps/v1", "Deployment", true)
            .with("batch/v1", "Job", true)
            .with("rbac.authorization.k8s.io/v1", "RoleBinding", true)
            .with("rbac.authorization.k8s.io/v1", "ClusterRoleBinding", false)
    }
}

impl FromIterator<(ObjectType, TypeInfo)> for TypeRegistry {
    fn from_iter<I: IntoIterator<Item = (ObjectType, TypeInfo)>>(iter: I) -> Self {
        Self { types: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_scope() {
        let reg = TypeRegistry::builtin();
        assert!(reg.is_served(&ObjectType::new("v1", "Pod")));
        assert!(!reg.is_namespaced(&ObjectType::new("v1", "PersistentVolume")));
        assert!(reg.is_namespaced(&ObjectType::new("example.io/v1", "Unknown")));
        assert_eq!(reg.get(&ObjectType::new("v1", "Pod")).unwrap().plural, "pods");
        let sorted = reg.sorted();
        assert!(sorted.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}
