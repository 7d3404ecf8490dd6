//! Ownership rules: which secondary types a primary type owns, and how to find them.

use std::collections::{BTreeMap, BTreeSet};

use kview_core::{Error, ObjectType, Result, TypeRegistry};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Whether a candidate secondary must point back at the primary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationType {
    /// An owner reference to the primary with `controller: true`.
    #[default]
    Controller,
    /// Any owner reference to the primary.
    Owner,
    None,
}

/// Relationships that cannot be expressed as labels or owner references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinRelationship {
    /// PersistentVolumeClaim `spec.volumeName` names the PersistentVolume.
    ClaimToVolume,
    /// PersistentVolume `spec.claimRef` names the PersistentVolumeClaim.
    VolumeToClaim,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPath {
    pub path: String,
}

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipCriteria {
    /// Field on the primary holding a label map (or a LabelSelector with `matchLabels`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_criteria: Option<FieldPath>,
    /// Label selector template; values may use `$(primary.name)`, `$(primary.namespace)`
    /// and `$(primary)` (the primary's own value for the same label key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_criteria: Option<BTreeMap<String, String>>,
    /// Field on the primary whose value is the secondary's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specified_name_criteria: Option<FieldPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<BuiltinRelationship>,
    #[serde(default)]
    pub validation: ValidationType,
}

impl OwnershipCriteria {
    pub fn labels<const N: usize>(pairs: [(&str, &str); N], validation: ValidationType) -> Self {
        Self {
            label_criteria: Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            validation,
            ..Default::default()
        }
    }

    pub fn specified_name(path: &str, validation: ValidationType) -> Self {
        Self { specified_name_criteria: Some(FieldPath::new(path)), validation, ..Default::default() }
    }

    pub fn builtin(rel: BuiltinRelationship) -> Self {
        Self { builtin: Some(rel), validation: ValidationType::None, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedResource {
    pub secondary: ObjectType,
    pub criteria: OwnershipCriteria,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRule {
    pub primary: ObjectType,
    pub owned_resources: Vec<OwnedResource>,
}

/// A rule set. Rules sharing a primary type are all applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnershipRules {
    rules: Vec<OwnershipRule>,
}

impl OwnershipRules {
    pub fn new(rules: Vec<OwnershipRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[OwnershipRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Owned-resource entries whose primary is `primary`.
    pub fn owned_by<'a>(&'a self, primary: &'a ObjectType) -> impl Iterator<Item = &'a OwnedResource> + 'a {
        self.rules.iter().filter(move |r| &r.primary == primary).flat_map(|r| r.owned_resources.iter())
    }

    /// `(primary type, entry)` pairs in which `secondary` is owned.
    pub fn owners_of<'a>(&'a self, secondary: &'a ObjectType) -> impl Iterator<Item = (&'a ObjectType, &'a OwnedResource)> + 'a {
        self.rules
            .iter()
            .flat_map(|r| r.owned_resources.iter().map(move |o| (&r.primary, o)))
            .filter(move |(_, o)| &o.secondary == secondary)
    }

    /// Every type mentioned, as primary or secondary.
    pub fn types(&self) -> BTreeSet<ObjectType> {
        let mut out = BTreeSet::new();
        for r in &self.rules {
            out.insert(r.primary.clone());
            out.extend(r.owned_resources.iter().map(|o| o.secondary.clone()));
        }
        out
    }

    /// Types reachable from `root` (including it).
    pub fn reachable_from(&self, root: &ObjectType) -> BTreeSet<ObjectType> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![root.clone()];
        while let Some(ty) = stack.pop() {
            if !seen.insert(ty.clone()) {
                continue;
            }
            stack.extend(self.owned_by(&ty).map(|o| o.secondary.clone()));
        }
        seen
    }

    /// Reject rule sets in which a type (transitively) owns itself, and malformed types.
    pub fn validate(&self) -> Result<()> {
        for r in &self.rules {
            r.primary.gvk()?;
            for o in &r.owned_resources {
                o.secondary.gvk()?;
                let c = &o.criteria;
                let forms = [c.selector_criteria.is_some(), c.label_criteria.is_some(), c.specified_name_criteria.is_some(), c.builtin.is_some()];
                if forms.iter().filter(|f| **f).count() > 1 {
                    return Err(Error::SelectorResolution(format!(
                        "{} -> {}: criteria must use exactly one selection form",
                        r.primary, o.secondary
                    )));
                }
            }
        }
        let mut graph: BTreeMap<&ObjectType, BTreeSet<&ObjectType>> = BTreeMap::new();
        for r in &self.rules {
            graph.entry(&r.primary).or_default().extend(r.owned_resources.iter().map(|o| &o.secondary));
        }
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Active,
            Done,
        }
        let mut marks: BTreeMap<&ObjectType, Mark> = BTreeMap::new();
        fn children<'a>(graph: &BTreeMap<&'a ObjectType, BTreeSet<&'a ObjectType>>, n: &ObjectType) -> Vec<&'a ObjectType> {
            graph.get(n).map(|s| s.iter().copied().collect()).unwrap_or_default()
        }
        for &start in graph.keys() {
            if marks.contains_key(start) {
                continue;
            }
            // Iterative DFS; each frame is (node, children, next child index).
            let mut stack: Vec<(&ObjectType, Vec<&ObjectType>, usize)> = vec![(start, children(&graph, start), 0)];
            marks.insert(start, Mark::Active);
            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let Some(&next) = frame.1.get(frame.2) else {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                };
                frame.2 += 1;
                match marks.get(next) {
                    Some(Mark::Active) => {
                        return Err(Error::SelectorResolution(format!("ownership cycle: {} (transitively) owns itself", next)));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::Active);
                        stack.push((next, children(&graph, next), 0));
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop entries naming types the cluster does not serve; drop rules left empty.
    pub fn filter_unsupported(&self, registry: &TypeRegistry) -> Self {
        let mut rules = Vec::with_capacity(self.rules.len());
        for r in &self.rules {
            if !registry.is_served(&r.primary) {
                info!(gvk = %r.primary, "dropping ownership rule for unserved primary");
                continue;
            }
            let owned: Vec<_> = r
                .owned_resources
                .iter()
                .filter(|o| {
                    let served = registry.is_served(&o.secondary);
                    if !served {
                        info!(primary = %r.primary, gvk = %o.secondary, "dropping unserved secondary");
                    }
                    served
                })
                .cloned()
                .collect();
            if !owned.is_empty() {
                rules.push(OwnershipRule { primary: r.primary.clone(), owned_resources: owned });
            }
        }
        Self { rules }
    }
}
