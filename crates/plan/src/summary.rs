//! Per-type summaries of the difference between two object sets.

use std::collections::BTreeMap;

use kview_core::object::revision_of;
use kview_core::{ChangeSummary, ObjectSummary, ObjectType};
use kview_store::ObjectSet;

/// Summaries for every type with at least one added, updated or deleted object,
/// sorted by apiVersion then kind. `total` counts the type's objects in `new`.
/// An object counts as updated only when its resourceVersion moved.
pub fn build_object_summaries(initial: &ObjectSet, new: &ObjectSet) -> Vec<ObjectSummary> {
    let mut by_type: BTreeMap<ObjectType, (i32, ChangeSummary)> = BTreeMap::new();
    let bump = |slot: &mut Option<i32>| *slot.get_or_insert(0) += 1;

    for (key, obj) in new {
        let (total, changes) = by_type.entry(key.object_type.clone()).or_default();
        *total += 1;
        match initial.get(key) {
            None => bump(&mut changes.added),
            Some(old) if revision_of(old) != revision_of(obj) => bump(&mut changes.updated),
            Some(_) => {}
        }
    }
    for key in initial.keys().filter(|k| !new.contains_key(*k)) {
        let (_, changes) = by_type.entry(key.object_type.clone()).or_default();
        bump(&mut changes.deleted);
    }

    // BTreeMap order on ObjectType is (apiVersion, kind).
    by_type
        .into_iter()
        .filter(|(_, (_, c))| c.added.is_some() || c.updated.is_some() || c.deleted.is_some())
        .map(|(object_type, (total, changes))| ObjectSummary { object_type, total, change_summary: Some(changes) })
        .collect()
}
