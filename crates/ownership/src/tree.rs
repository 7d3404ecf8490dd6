//! Ownership Rule Engine: expands a root into its tree of owned objects.

use std::collections::{BTreeMap, VecDeque};

use kube::core::DynamicObject;
use kview_core::object::placeholder;
use kview_core::{Error, ObjectReader, ObjectRef, ObjectReference, ObjectTreeNode, Result, TypeRegistry};
use kview_store::{ObjectSet, RevisionStore};
use tracing::{debug, warn};

use crate::rules::OwnershipRules;
use crate::selector::materialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Maximum levels below the root; 0 disables the guard.
    pub max_depth: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self { max_depth: 16 }
    }
}

impl TreeConfig {
    pub fn from_env() -> Self {
        let max_depth = std::env::var("KVIEW_MAX_TREE_DEPTH").ok().and_then(|s| s.parse().ok()).unwrap_or(16);
        Self { max_depth }
    }
}

/// A revision-pinned tree plus the objects it was built from.
#[derive(Debug, Clone, Default)]
pub struct BuiltTree {
    pub tree: ObjectTreeNode,
    pub objects: ObjectSet,
}

pub struct TreeBuilder<'a> {
    rules: &'a OwnershipRules,
    registry: &'a TypeRegistry,
    config: TreeConfig,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(rules: &'a OwnershipRules, registry: &'a TypeRegistry, config: TreeConfig) -> Self {
        Self { rules, registry, config }
    }

    /// Breadth-first expansion of `root` against `source`. Each object is visited at
    /// most once; secondaries that cannot be found are left out.
    pub async fn build(&self, root: &DynamicObject, source: &dyn ObjectReader) -> Result<BuiltTree> {
        let t0 = std::time::Instant::now();
        let root_key = ObjectRef::of(root)?;
        let mut objects = ObjectSet::new();
        let mut edges: BTreeMap<ObjectRef, Vec<ObjectRef>> = BTreeMap::new();
        objects.insert(root_key.clone(), root.clone());
        let mut frontier = VecDeque::from([(root_key.clone(), 0usize)]);

        while let Some((key, depth)) = frontier.pop_front() {
            if self.config.max_depth > 0 && depth >= self.config.max_depth {
                warn!(object = %key, depth, "tree depth guard reached; not expanding");
                continue;
            }
            let Some(primary) = objects.get(&key).cloned() else { continue };
            for owned in self.rules.owned_by(&key.object_type) {
                let Some(query) = materialize(&primary, &owned.secondary, &owned.criteria, self.registry)? else {
                    continue;
                };
                let candidates = match &query.name {
                    Some(name) => {
                        let target = ObjectRef::new(owned.secondary.clone(), query.list.namespace.as_deref(), name.clone());
                        source.get_opt(&target).await?.into_iter().collect()
                    }
                    None => match source.list(&owned.secondary, &query.list).await {
                        Ok(items) => items,
                        Err(Error::NotFound(msg)) => {
                            debug!(gvk = %owned.secondary, %msg, "no secondaries");
                            Vec::new()
                        }
                        Err(e) => return Err(e),
                    },
                };
                for candidate in candidates.into_iter().filter(|c| query.accepts(c)) {
                    let child = ObjectRef::of(&candidate)?;
                    if objects.contains_key(&child) {
                        continue;
                    }
                    objects.insert(child.clone(), candidate);
                    edges.entry(key.clone()).or_default().push(child.clone());
                    frontier.push_back((child, depth + 1));
                }
            }
        }

        let tree = assemble(&root_key, &objects, &edges)?;
        metrics::histogram!("tree_build_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(root = %root_key, nodes = objects.len(), took_ms = %t0.elapsed().as_millis(), "tree built");
        Ok(BuiltTree { tree, objects })
    }
}

fn assemble(key: &ObjectRef, objects: &ObjectSet, edges: &BTreeMap<ObjectRef, Vec<ObjectRef>>) -> Result<ObjectTreeNode> {
    let obj = objects.get(key).ok_or_else(|| Error::ReferenceIntegrity(format!("tree edge to unknown {}", key)))?;
    let mut node = ObjectTreeNode::new(ObjectReference::of(obj)?);
    if let Some(children) = edges.get(key) {
        node.secondaries = children.iter().map(|c| assemble(c, objects, edges)).collect::<Result<_>>()?;
        node.secondaries.sort_by_key(|n| n.primary.sort_key());
    }
    Ok(node)
}

/// Resolve every node of a persisted tree against the store. Snapshots lost to a
/// restart are replaced by placeholders carrying only the reference fields.
pub fn objects_from_tree(tree: &ObjectTreeNode, store: &RevisionStore) -> Result<ObjectSet> {
    let mut out = ObjectSet::new();
    for reference in tree.references() {
        let key = reference.to_ref();
        let obj = match store.get(&key, reference.revision()) {
            Ok(snapshot) => (*snapshot).clone(),
            Err(Error::NotFound(_)) => {
                debug!(object = %key, revision = %reference.resource_version, "snapshot missing; using placeholder");
                placeholder(reference)
            }
            Err(e) => return Err(e),
        };
        out.insert(key, obj);
    }
    Ok(out)
}
