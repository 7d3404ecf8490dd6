//! kview core types: object identity, trees, change records and dry-run results.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

pub mod client;
pub mod error;
pub mod memory;
pub mod object;
pub mod registry;
pub mod selector;

pub use client::{ListQuery, ObjectClient, ObjectReader};
pub use error::{Error, EvalStage, Result};
pub use memory::MemoryCluster;
pub use registry::{TypeInfo, TypeRegistry};
pub use selector::Labels;

/// Comparable version marker derived from `metadata.resourceVersion`.
pub type Revision = i64;

/// Immutable copy of an object at one revision.
pub type Snapshot = Arc<DynamicObject>;

pub mod prelude {
    pub use super::{
        ChangeSummary, ChangeType, DryRunPhase, DryRunResult, Error, EventAttributes, ListQuery,
        ObjectChange, ObjectClient, ObjectReader, ObjectRef, ObjectReference, ObjectSummary,
        ObjectTreeNode, ObjectType, ReconciliationCycleState, Result, Revision, Snapshot, WatchEvent,
    };
}

/// One observation from a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
}

impl WatchEvent {
    pub fn object(&self) -> &DynamicObject {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        }
    }

    pub fn into_object(self) -> DynamicObject {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, WatchEvent::Deleted(_))
    }

    pub fn revision(&self) -> Revision {
        object::revision_of(self.object())
    }
}

/// Parse a resource version into a revision. Non-numeric versions map to 0.
pub fn parse_revision(resource_version: &str) -> Revision {
    resource_version.parse::<i64>().unwrap_or(0)
}

/// An object type, addressed the way manifests address it (`apiVersion` + `kind`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectType {
    pub api_version: String,
    pub kind: String,
}

impl ObjectType {
    pub fn event() -> Self {
        Self::new("v1", "Event")
    }

    pub fn is_event(&self) -> bool {
        self.api_version == "v1" && self.kind == "Event"
    }

    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// Split `apiVersion` into `(group, version)`; the core group is empty.
    pub fn group_version(&self) -> Result<(&str, &str)> {
        let parts: Vec<&str> = self.api_version.split('/').collect();
        match parts.as_slice() {
            [version] if !version.is_empty() => Ok(("", version)),
            [group, version] if !group.is_empty() && !version.is_empty() => Ok((group, version)),
            _ => Err(Error::SelectorResolution(format!(
                "unparseable group-version {:?} for kind {}",
                self.api_version, self.kind
            ))),
        }
    }

    pub fn gvk(&self) -> Result<GroupVersionKind> {
        let (group, version) = self.group_version()?;
        if self.kind.is_empty() {
            return Err(Error::SelectorResolution(format!("empty kind for {}", self.api_version)));
        }
        Ok(GroupVersionKind::gvk(group, version, &self.kind))
    }

    /// Read the type of a dynamic object from its `apiVersion`/`kind`.
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| {
            Error::SelectorResolution(format!(
                "object {} carries no apiVersion/kind",
                obj.metadata.name.as_deref().unwrap_or("<unnamed>")
            ))
        })?;
        Ok(Self::new(types.api_version.clone(), types.kind.clone()))
    }

    /// Key form used on the command line: `v1/Kind` or `group/v1/Kind`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }

    /// Inverse of [`ObjectType::key`].
    pub fn parse_key(key: &str) -> Result<Self> {
        let (api_version, kind) = key
            .rsplit_once('/')
            .ok_or_else(|| Error::SelectorResolution(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)))?;
        let ty = Self::new(api_version, kind);
        ty.gvk()?;
        Ok(ty)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Revision-independent identity of a tracked object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(flatten)]
    pub object_type: ObjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(object_type: ObjectType, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            object_type,
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.into(),
        }
    }

    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let object_type = ObjectType::of(obj)?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::SelectorResolution(format!("{} object missing metadata.name", object_type)))?;
        Ok(Self::new(object_type, obj.metadata.namespace.as_deref(), name))
    }

    pub fn group(&self) -> &str {
        self.object_type.group_version().map(|(g, _)| g).unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.object_type.group_version().map(|(_, v)| v).unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        &self.object_type.kind
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.object_type, ns, self.name),
            None => write!(f, "{} {}", self.object_type, self.name),
        }
    }
}

/// Status form of an object reference, pinned to one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

impl ObjectReference {
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let key = ObjectRef::of(obj)?;
        Ok(Self::from_ref(
            &key,
            obj.metadata.uid.as_deref().unwrap_or(""),
            obj.metadata.resource_version.as_deref().unwrap_or(""),
        ))
    }

    pub fn from_ref(key: &ObjectRef, uid: &str, resource_version: &str) -> Self {
        Self {
            api_version: key.object_type.api_version.clone(),
            kind: key.object_type.kind.clone(),
            namespace: key.namespace.clone().unwrap_or_default(),
            name: key.name.clone(),
            uid: uid.to_string(),
            resource_version: resource_version.to_string(),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        ObjectType::new(self.api_version.clone(), self.kind.clone())
    }

    pub fn to_ref(&self) -> ObjectRef {
        ObjectRef::new(self.object_type(), Some(self.namespace.as_str()), self.name.clone())
    }

    pub fn revision(&self) -> Revision {
        parse_revision(&self.resource_version)
    }

    /// Ordering key for sibling nodes in a tree.
    pub fn sort_key(&self) -> String {
        [self.kind.as_str(), self.namespace.as_str(), self.name.as_str(), self.api_version.as_str()].concat()
    }
}

/// Shape of the owned-resource graph at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTreeNode {
    pub primary: ObjectReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondaries: Vec<ObjectTreeNode>,
}

impl ObjectTreeNode {
    pub fn new(primary: ObjectReference) -> Self {
        Self { primary, secondaries: Vec::new() }
    }

    /// Sort children (recursively) into their canonical order.
    pub fn sort(&mut self) {
        self.secondaries.sort_by_key(|n| n.primary.sort_key());
        for child in self.secondaries.iter_mut() {
            child.sort();
        }
    }

    /// Number of nodes, including this one.
    pub fn len(&self) -> usize {
        1 + self.secondaries.iter().map(|s| s.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Pre-order walk over every reference in the tree.
    pub fn references(&self) -> Vec<&ObjectReference> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(&node.primary);
            for child in node.secondaries.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Drop everything deeper than `depth` levels below this node; 0 keeps the whole tree.
    pub fn truncate(&mut self, depth: usize) {
        fn cut(node: &mut ObjectTreeNode, remaining: usize) {
            if remaining == 0 {
                node.secondaries.clear();
                return;
            }
            for child in node.secondaries.iter_mut() {
                cut(child, remaining - 1);
            }
        }
        if depth > 0 {
            cut(self, depth);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeType {
    Creation,
    Update,
    Deletion,
    Event,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Creation => "Creation",
            ChangeType::Update => "Update",
            ChangeType::Deletion => "Deletion",
            ChangeType::Event => "Event",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttributes {
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub reason: String,
}

/// One observed (or simulated) change of a tracked object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectChange {
    pub object_reference: ObjectReference,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_attributes: Option<EventAttributes>,
    /// Globally comparable; defines the order of a change log.
    pub revision: Revision,
    /// Controller wall-clock time. Not ordered across changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_description: Option<String>,
    /// Evaluated settled-state of the object after this change, for root-type changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
}

/// Stable sort by revision; the order of a change log.
pub fn sort_changes(changes: &mut [ObjectChange]) {
    changes.sort_by_key(|c| c.revision);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub object_type: ObjectType,
    pub total: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<ChangeSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTreeDiffSummary {
    #[serde(default)]
    pub object_summaries: Vec<ObjectSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationCycleState {
    #[serde(default)]
    pub summary: ObjectTreeDiffSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_tree: Option<ObjectTreeNode>,
    #[serde(default)]
    pub changes: Vec<ObjectChange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DryRunPhase {
    #[default]
    Succeeded,
    Failed,
}

pub const REASON_TIMEOUT: &str = "Timeout";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";

/// Outcome of one plan generation. Replaces any prior result wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResult {
    pub phase: DryRunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub desired_spec_revision: String,
    #[serde(default)]
    pub observed_target_generation: i64,
    #[serde(default)]
    pub spec_diff: String,
    #[serde(default)]
    pub plan: ReconciliationCycleState,
}

impl DryRunResult {
    pub fn failed(reason: &str, message: impl Into<String>) -> Self {
        Self {
            phase: DryRunPhase::Failed,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.phase == DryRunPhase::Succeeded
    }
}
