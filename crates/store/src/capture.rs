//! Change capture: an object overlay that turns every write into an `ObjectChange`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use kube::core::DynamicObject;
use kview_core::object::{revision_of, same_content, sanitize};
use kview_core::{
    sort_changes, ChangeType, Error, EventAttributes, ObjectChange, ObjectRef, ObjectReference, ObjectType, Result,
    Revision,
};
use tracing::debug;
use uuid::Uuid;

use crate::describe::DescriptionFormatter;

pub type ObjectSet = BTreeMap<ObjectRef, DynamicObject>;

/// Overlay of objects seeded from a real baseline, mutated only through [`CaptureStore::write`].
pub struct CaptureStore {
    objects: ObjectSet,
    baseline: ObjectSet,
    tombstones: BTreeSet<ObjectRef>,
    changes: Vec<ObjectChange>,
    next_revision: Revision,
    formatter: DescriptionFormatter,
}

impl CaptureStore {
    pub fn new(formatter: DescriptionFormatter) -> Self {
        Self {
            objects: ObjectSet::new(),
            baseline: ObjectSet::new(),
            tombstones: BTreeSet::new(),
            changes: Vec::new(),
            next_revision: 1,
            formatter,
        }
    }

    /// Seed a real object into the overlay. Records no change.
    pub fn load(&mut self, obj: DynamicObject) -> Result<()> {
        let key = ObjectRef::of(&obj)?;
        self.next_revision = self.next_revision.max(revision_of(&obj) + 1);
        self.baseline.insert(key.clone(), obj.clone());
        self.objects.insert(key, obj);
        Ok(())
    }

    pub fn get(&self, key: &ObjectRef) -> Option<&DynamicObject> {
        self.objects.get(key)
    }

    /// True when the overlay deleted `key`; reads must not fall back to the real cluster.
    pub fn is_deleted(&self, key: &ObjectRef) -> bool {
        self.tombstones.contains(key)
    }

    /// Overlay objects of one type that were written or loaded.
    pub fn of_type<'a>(&'a self, object_type: &'a ObjectType) -> impl Iterator<Item = (&'a ObjectRef, &'a DynamicObject)> + 'a {
        self.objects.iter().filter(move |(k, _)| &k.object_type == object_type)
    }

    /// Apply a write: `Some(obj)` creates or updates, `None` deletes.
    ///
    /// Stamps a fresh revision (and uid/generation where the server would) on the
    /// stored object and appends one change. A write that changes nothing records
    /// nothing and returns the current object.
    pub fn write(&mut self, key: &ObjectRef, new: Option<DynamicObject>) -> Result<Option<DynamicObject>> {
        let old = self.objects.get(key).cloned();
        let (change_type, stored) = match (old.as_ref(), new) {
            (None, None) => return Err(Error::not_found(key)),
            (Some(_), None) => (ChangeType::Deletion, None),
            (None, Some(mut obj)) => {
                let revision = self.allocate_revision();
                if obj.metadata.uid.is_none() {
                    obj.metadata.uid = Some(Uuid::from_u128(revision as u128).to_string());
                }
                obj.metadata.resource_version = Some(revision.to_string());
                obj.metadata.generation = Some(1);
                (ChangeType::Creation, Some(obj))
            }
            (Some(current), Some(mut obj)) => {
                if same_content(current, &obj) {
                    return Ok(Some(current.clone()));
                }
                let revision = self.allocate_revision();
                obj.metadata.uid = current.metadata.uid.clone();
                obj.metadata.resource_version = Some(revision.to_string());
                let generation = current.metadata.generation.unwrap_or(1);
                obj.metadata.generation = Some(if spec_of(current) != spec_of(&obj) { generation + 1 } else { generation });
                (ChangeType::Update, Some(obj))
            }
        };

        match stored {
            Some(mut obj) => {
                sanitize(&mut obj);
                self.tombstones.remove(key);
                self.objects.insert(key.clone(), obj.clone());
                let revision = revision_of(&obj);
                if let Some(change) = make_change(&key.object_type, &obj, change_type, revision, &self.formatter)? {
                    self.changes.push(change);
                }
                debug!(object = %key, change = %change_type, revision, "captured write");
                Ok(Some(obj))
            }
            None => {
                let Some(old) = self.objects.remove(key) else { return Err(Error::not_found(key)) };
                self.tombstones.insert(key.clone());
                let revision = self.allocate_revision();
                if let Some(change) = make_change(&key.object_type, &old, change_type, revision, &self.formatter)? {
                    self.changes.push(change);
                }
                debug!(object = %key, revision, "captured delete");
                Ok(None)
            }
        }
    }

    /// The append-only change log, in revision order.
    pub fn changes(&self) -> &[ObjectChange] {
        &self.changes
    }

    /// Current materialized object set.
    pub fn all(&self) -> &ObjectSet {
        &self.objects
    }

    /// The set as it was before any write.
    pub fn baseline(&self) -> &ObjectSet {
        &self.baseline
    }

    pub fn formatter(&self) -> &DescriptionFormatter {
        &self.formatter
    }

    fn allocate_revision(&mut self) -> Revision {
        let r = self.next_revision;
        self.next_revision += 1;
        r
    }
}

fn spec_of(obj: &DynamicObject) -> serde_json::Value {
    let mut v = obj.data.clone();
    if let Some(o) = v.as_object_mut() {
        o.remove("status");
    }
    v
}

/// Turn one observed object change into a change record. Event deletions yield `None`.
pub fn make_change(
    object_type: &ObjectType,
    obj: &DynamicObject,
    change_type: ChangeType,
    revision: Revision,
    formatter: &DescriptionFormatter,
) -> Result<Option<ObjectChange>> {
    if object_type.is_event() {
        if change_type == ChangeType::Deletion {
            return Ok(None);
        }
        let involved = obj
            .data
            .get("involvedObject")
            .cloned()
            .ok_or_else(|| Error::ReferenceIntegrity(format!("event {:?} has no involvedObject", obj.metadata.name)))?;
        let object_reference: ObjectReference = serde_json::from_value(involved)?;
        let (description, local_description) = formatter.describe(object_type, obj, ChangeType::Event);
        let str_field = |k: &str| obj.data.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();
        return Ok(Some(ObjectChange {
            object_reference,
            change_type: ChangeType::Event,
            event_attributes: Some(EventAttributes {
                name: obj.metadata.name.clone().unwrap_or_default(),
                event_type: str_field("type"),
                reason: str_field("reason"),
            }),
            revision,
            timestamp: Some(Utc::now()),
            description,
            local_description,
            state: None,
        }));
    }
    let (description, local_description) = formatter.describe(object_type, obj, change_type);
    Ok(Some(ObjectChange {
        object_reference: ObjectReference::of(obj)?,
        change_type,
        event_attributes: None,
        revision,
        timestamp: Some(Utc::now()),
        description,
        local_description,
        state: None,
    }))
}

/// Changes that turn `old` into `new`. Updates count only when the resource version
/// moved. Output is sorted by revision.
pub fn build_changes(old: &ObjectSet, new: &ObjectSet, formatter: &DescriptionFormatter) -> Vec<ObjectChange> {
    let mut out = Vec::new();
    let mut push = |key: &ObjectRef, obj: &DynamicObject, change_type: ChangeType| {
        match make_change(&key.object_type, obj, change_type, revision_of(obj), formatter) {
            Ok(Some(change)) => out.push(change),
            Ok(None) => {}
            Err(e) => tracing::warn!(object = %key, error = %e, "dropping change"),
        }
    };
    for (key, obj) in new {
        match old.get(key) {
            None => push(key, obj, ChangeType::Creation),
            Some(prev) if prev.metadata.resource_version != obj.metadata.resource_version => {
                push(key, obj, ChangeType::Update)
            }
            Some(_) => {}
        }
    }
    for (key, obj) in old {
        if !new.contains_key(key) {
            push(key, obj, ChangeType::Deletion);
        }
    }
    sort_changes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kview_core::object::new_object;
    use serde_json::json;

    fn cm(name: &str, rv: Option<&str>, value: &str) -> DynamicObject {
        let mut o = new_object(&ObjectType::new("v1", "ConfigMap"), Some("ns"), name, json!({"data": {"k": value}}));
        o.metadata.resource_version = rv.map(str::to_string);
        o
    }

    #[test]
    fn writes_classify_and_stamp_revisions() {
        let mut c = CaptureStore::new(DescriptionFormatter::default());
        c.load(cm("a", Some("100"), "1")).unwrap();
        assert!(c.changes().is_empty());

        let key_a = ObjectRef::of(&cm("a", None, "")).unwrap();
        let key_b = ObjectRef::of(&cm("b", None, "")).unwrap();
        let unchanged = c.write(&key_a, Some(cm("a", Some("100"), "1"))).unwrap().unwrap();
        assert_eq!(unchanged.metadata.resource_version.as_deref(), Some("100"));
        assert!(c.changes().is_empty());

        let created = c.write(&key_b, Some(cm("b", None, "x"))).unwrap().unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("101"));
        assert_eq!(created.metadata.uid, Some(Uuid::from_u128(101).to_string()));
        c.write(&key_a, Some(cm("a", None, "2"))).unwrap();
        c.write(&key_b, None).unwrap();

        let kinds: Vec<_> = c.changes().iter().map(|ch| (ch.change_type, ch.revision)).collect();
        assert_eq!(kinds, vec![(ChangeType::Creation, 101), (ChangeType::Update, 102), (ChangeType::Deletion, 103)]);
        assert!(c.is_deleted(&key_b));
        assert!(c.get(&key_b).is_none());
        assert_eq!(c.all().len(), 1);
        assert_eq!(c.baseline().len(), 1);
        assert!(c.write(&key_b, None).unwrap_err().is_not_found());
    }

    #[test]
    fn events_reference_involved_object() {
        let mut c = CaptureStore::new(DescriptionFormatter::default());
        let ev = new_object(
            &ObjectType::event(),
            Some("ns"),
            "pod.1",
            json!({"type": "Normal", "reason": "Started", "message": "Started container",
                   "involvedObject": {"apiVersion": "v1", "kind": "Pod", "namespace": "ns", "name": "p"}}),
        );
        let key = ObjectRef::of(&ev).unwrap();
        c.write(&key, Some(ev)).unwrap();
        c.write(&key, None).unwrap();
        assert_eq!(c.changes().len(), 1);
        let change = &c.changes()[0];
        assert_eq!(change.change_type, ChangeType::Event);
        assert_eq!(change.object_reference.kind, "Pod");
        assert_eq!(change.description, "Started container");
        assert_eq!(change.event_attributes.as_ref().unwrap().reason, "Started");
    }

    #[test]
    fn build_changes_between_sets() {
        let mut old = ObjectSet::new();
        let mut new = ObjectSet::new();
        for (name, rv) in [("same", "5"), ("moved", "6"), ("gone", "7")] {
            let o = cm(name, Some(rv), "v");
            old.insert(ObjectRef::of(&o).unwrap(), o);
        }
        for (name, rv) in [("same", "5"), ("moved", "9"), ("fresh", "8")] {
            let o = cm(name, Some(rv), "v");
            new.insert(ObjectRef::of(&o).unwrap(), o);
        }
        let changes = build_changes(&old, &new, &DescriptionFormatter::default());
        let got: Vec<_> = changes.iter().map(|c| (c.object_reference.name.as_str(), c.change_type)).collect();
        assert_eq!(got, vec![("gone", ChangeType::Deletion), ("fresh", ChangeType::Creation), ("moved", ChangeType::Update)]);
    }
}
