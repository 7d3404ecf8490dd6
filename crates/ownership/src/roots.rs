//! Root Finder: maps a changed object back to the roots (and views) that track it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use kube::core::DynamicObject;
use kview_core::object::owner_references;
use kview_core::{Error, ListQuery, ObjectReader, ObjectRef, ObjectReference, ObjectType, Result, TypeRegistry};
use tracing::debug;

use crate::rules::{OwnershipRules, ValidationType};
use crate::selector::owns;
use crate::tree::TreeConfig;

pub struct RootFinder<'a> {
    rules: &'a OwnershipRules,
    registry: &'a TypeRegistry,
    root_types: &'a BTreeSet<ObjectType>,
    config: TreeConfig,
}

impl<'a> RootFinder<'a> {
    pub fn new(rules: &'a OwnershipRules, registry: &'a TypeRegistry, root_types: &'a BTreeSet<ObjectType>, config: TreeConfig) -> Self {
        Self { rules, registry, root_types, config }
    }

    /// Roots whose trees contain `changed`. Events are resolved through their
    /// `involvedObject`. An object of a type no rule mentions is a
    /// `ReferenceIntegrity` error.
    pub async fn find_roots(&self, changed: &DynamicObject, source: &dyn ObjectReader) -> Result<Vec<ObjectRef>> {
        let changed_type = ObjectType::of(changed)?;
        let seed = if changed_type.is_event() { self.involved_object(changed, source).await? } else { changed.clone() };

        let mut roots = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut frontier = VecDeque::from([(seed, 0usize)]);
        while let Some((obj, depth)) = frontier.pop_front() {
            let key = ObjectRef::of(&obj)?;
            if !visited.insert(key.clone()) {
                continue;
            }
            let is_root = self.root_types.contains(&key.object_type);
            if is_root {
                roots.insert(key.clone());
            }
            let owners: Vec<_> = self.rules.owners_of(&key.object_type).collect();
            if owners.is_empty() {
                if depth == 0 && !is_root {
                    return Err(Error::ReferenceIntegrity(format!("no ownership rule mentions {}", key.object_type)));
                }
                continue;
            }
            if self.config.max_depth > 0 && depth >= self.config.max_depth {
                debug!(object = %key, depth, "root search depth guard reached");
                continue;
            }
            for (primary_type, owned) in owners {
                for candidate in self.candidates(&obj, primary_type, owned.criteria.validation, source).await? {
                    match owns(&candidate, &obj, &owned.criteria, self.registry) {
                        Ok(true) => frontier.push_back((candidate, depth + 1)),
                        Ok(false) => {}
                        Err(e) if e.is_soft() => debug!(object = %key, error = %e, "skipping candidate primary"),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(roots.into_iter().collect())
    }

    async fn involved_object(&self, event: &DynamicObject, source: &dyn ObjectReader) -> Result<DynamicObject> {
        let involved = event
            .data
            .get("involvedObject")
            .cloned()
            .ok_or_else(|| Error::ReferenceIntegrity(format!("event {:?} has no involvedObject", event.metadata.name)))?;
        let reference: ObjectReference = serde_json::from_value(involved)?;
        let key = reference.to_ref();
        source
            .get_opt(&key)
            .await?
            .ok_or_else(|| Error::ReferenceIntegrity(format!("event refers to missing {}", key)))
    }

    /// Possible primaries of `obj`. When the criteria validates owners, owner
    /// references name them directly; otherwise every object of the primary type
    /// in scope is a candidate.
    async fn candidates(
        &self,
        obj: &DynamicObject,
        primary_type: &ObjectType,
        validation: ValidationType,
        source: &dyn ObjectReader,
    ) -> Result<Vec<DynamicObject>> {
        let namespace = if self.registry.is_namespaced(primary_type) { obj.metadata.namespace.as_deref() } else { None };
        if validation != ValidationType::None {
            let mut out = Vec::new();
            for r in owner_references(obj) {
                if r.kind != primary_type.kind || r.api_version != primary_type.api_version {
                    continue;
                }
                let key = ObjectRef::new(primary_type.clone(), namespace, r.name.clone());
                if let Some(p) = source.get_opt(&key).await? {
                    out.push(p);
                }
            }
            return Ok(out);
        }
        match source.list(primary_type, &ListQuery::in_namespace(namespace)).await {
            Ok(items) => Ok(items),
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

/// Which views track which roots.
#[derive(Debug, Clone, Default)]
pub struct ViewIndex {
    by_root: BTreeMap<ObjectRef, BTreeSet<String>>,
}

impl ViewIndex {
    pub fn insert(&mut self, root: ObjectRef, view: &str) {
        self.by_root.entry(root).or_default().insert(view.to_string());
    }

    /// Forget `view` everywhere; returns the roots no view tracks anymore.
    pub fn remove_view(&mut self, view: &str) -> Vec<ObjectRef> {
        let mut orphaned = Vec::new();
        self.by_root.retain(|root, views| {
            views.remove(view);
            if views.is_empty() {
                orphaned.push(root.clone());
                false
            } else {
                true
            }
        });
        orphaned
    }

    pub fn views_for<'r>(&self, roots: impl IntoIterator<Item = &'r ObjectRef>) -> BTreeSet<String> {
        roots.into_iter().filter_map(|r| self.by_root.get(r)).flatten().cloned().collect()
    }

    pub fn root_types(&self) -> BTreeSet<ObjectType> {
        self.by_root.keys().map(|r| r.object_type.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(name: &str) -> ObjectRef {
        ObjectRef::new(ObjectType::new("apps.kubeblocks.io/v1", "Cluster"), Some("demo"), name)
    }

    #[test]
    fn view_index_tracks_shared_roots() {
        let mut idx = ViewIndex::default();
        idx.insert(root("a"), "demo/view-1");
        idx.insert(root("a"), "demo/view-2");
        idx.insert(root("b"), "demo/view-2");
        let views = idx.views_for([&root("a")]);
        assert_eq!(views.len(), 2);
        assert!(idx.remove_view("demo/view-1").is_empty());
        assert_eq!(idx.remove_view("demo/view-2"), vec![root("a"), root("b")]);
        assert!(idx.is_empty());
    }
}
