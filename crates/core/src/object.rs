//! Helpers over `DynamicObject`: conversion, ownership checks and placeholders.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::{DynamicObject, TypeMeta};
use serde_json::Value;

use crate::{parse_revision, ObjectRef, ObjectReference, ObjectType, Result, Revision};

pub fn new_object(object_type: &ObjectType, namespace: Option<&str>, name: &str, data: Value) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: object_type.api_version.clone(), kind: object_type.kind.clone() }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        },
        data,
    }
}

/// Full JSON form (`apiVersion`, `kind`, `metadata` and the rest of the body).
pub fn to_value(obj: &DynamicObject) -> Result<Value> {
    Ok(serde_json::to_value(obj)?)
}

pub fn from_value(value: Value) -> Result<DynamicObject> {
    Ok(serde_json::from_value(value)?)
}

/// Remove fields that only add noise to stored snapshots.
pub fn sanitize(obj: &mut DynamicObject) {
    #[cfg(feature = "strip-managed-fields")]
    {
        obj.metadata.managed_fields = None;
    }
    #[cfg(not(feature = "strip-managed-fields"))]
    let _ = obj;
}

pub fn revision_of(obj: &DynamicObject) -> Revision {
    obj.metadata.resource_version.as_deref().map(parse_revision).unwrap_or(0)
}

pub fn generation_of(obj: &DynamicObject) -> i64 {
    obj.metadata.generation.unwrap_or(0)
}

pub fn owner_references(obj: &DynamicObject) -> &[OwnerReference] {
    obj.metadata.owner_references.as_deref().unwrap_or(&[])
}

/// True when `obj` names `owner_uid` among its owners. With `controller_only`
/// the reference must also carry `controller: true`.
pub fn is_owned_by(obj: &DynamicObject, owner_uid: &str, controller_only: bool) -> bool {
    owner_references(obj)
        .iter()
        .any(|r| r.uid == owner_uid && (!controller_only || r.controller == Some(true)))
}

/// Stand-in for an object whose snapshot is gone. Carries identity only.
pub fn placeholder(reference: &ObjectReference) -> DynamicObject {
    let key: ObjectRef = reference.to_ref();
    let mut obj = new_object(&key.object_type, key.namespace.as_deref(), &key.name, Value::Object(Default::default()));
    if !reference.uid.is_empty() {
        obj.metadata.uid = Some(reference.uid.clone());
    }
    if !reference.resource_version.is_empty() {
        obj.metadata.resource_version = Some(reference.resource_version.clone());
    }
    obj
}

/// Compare two snapshots ignoring bookkeeping the server rewrites on every write.
pub fn same_content(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.data == b.data
        && a.metadata.labels == b.metadata.labels
        && a.metadata.annotations == b.metadata.annotations
        && a.metadata.owner_references == b.metadata.owner_references
        && a.metadata.finalizers == b.metadata.finalizers
        && a.metadata.deletion_timestamp == b.metadata.deletion_timestamp
}

/// Strip the fields that change on every write so two bodies can be diffed.
pub fn strip_noisy(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "generation", "uid", "creationTimestamp"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
}
