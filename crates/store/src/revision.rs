//! Revision-addressed snapshot store with per-owner reference counting.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use kube::core::DynamicObject;
use kview_core::object::{revision_of, sanitize};
use kview_core::{Error, ObjectRef, ObjectType, Result, Revision, Snapshot};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

struct Entry {
    snapshot: Snapshot,
    owners: SmallVec<[String; 2]>,
}

type Revisions = BTreeMap<Revision, Entry>;

/// Snapshots keyed by `(ref, revision)`, shared by many owners (views).
///
/// Readers of different refs never contend; writers serialize per ref. The outer
/// map is only write-locked to add or drop a ref. Inserts hold the outer read
/// lock while writing their slot, so a ref is never dropped under a writer.
#[derive(Default)]
pub struct RevisionStore {
    objects: RwLock<FxHashMap<ObjectRef, Arc<RwLock<Revisions>>>>,
}

impl RevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `obj` at its revision on behalf of `owner`. Existing snapshots are
    /// never rewritten; a repeat insert only adds `owner` if it is new.
    pub fn insert(&self, obj: &DynamicObject, owner: &str) -> Result<()> {
        let key = ObjectRef::of(obj)?;
        let revision = revision_of(obj);
        loop {
            let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = objects.get(&key) {
                let mut revisions = slot.write().unwrap_or_else(PoisonError::into_inner);
                record(&mut revisions, obj, revision, owner);
                return Ok(());
            }
            drop(objects);
            self.objects.write().unwrap_or_else(PoisonError::into_inner).entry(key.clone()).or_default();
        }
    }

    /// Snapshot of `key` at exactly `revision`; `NotFound` when history is missing.
    pub fn get(&self, key: &ObjectRef, revision: Revision) -> Result<Snapshot> {
        let slot = self.slot(key).ok_or_else(|| Error::not_found(format!("{} (no history)", key)))?;
        let revisions = slot.read().unwrap_or_else(PoisonError::into_inner);
        revisions
            .get(&revision)
            .map(|e| Arc::clone(&e.snapshot))
            .ok_or_else(|| Error::not_found(format!("{} at revision {}", key, revision)))
    }

    /// Latest snapshot of `key` whose revision is at most `revision`.
    pub fn get_at_or_before(&self, key: &ObjectRef, revision: Revision) -> Option<Snapshot> {
        let slot = self.slot(key)?;
        let revisions = slot.read().unwrap_or_else(PoisonError::into_inner);
        revisions.range(..=revision).next_back().map(|(_, e)| Arc::clone(&e.snapshot))
    }

    /// All retained snapshots of one type, by ref then revision.
    pub fn list(&self, object_type: &ObjectType) -> BTreeMap<ObjectRef, BTreeMap<Revision, Snapshot>> {
        let slots: Vec<(ObjectRef, Arc<RwLock<Revisions>>)> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| &k.object_type == object_type)
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        slots
            .into_iter()
            .filter_map(|(k, slot)| {
                let revisions = slot.read().unwrap_or_else(PoisonError::into_inner);
                let map: BTreeMap<_, _> = revisions.iter().map(|(r, e)| (*r, Arc::clone(&e.snapshot))).collect();
                (!map.is_empty()).then_some((k, map))
            })
            .collect()
    }

    /// Release `owner`'s hold on `(key, revision)`; the snapshot goes away with its last owner.
    pub fn delete(&self, key: &ObjectRef, owner: &str, revision: Revision) {
        let Some(slot) = self.slot(key) else { return };
        let now_empty = {
            let mut revisions = slot.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = revisions.get_mut(&revision) {
                entry.owners.retain(|o| o != owner);
                if entry.owners.is_empty() {
                    revisions.remove(&revision);
                    debug!(object = %key, revision, "revision released");
                    metrics::counter!("revision_store_releases_total", 1u64);
                }
            }
            revisions.is_empty()
        };
        if now_empty {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            let still_empty = objects
                .get(key)
                .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).is_empty())
                .unwrap_or(false);
            if still_empty {
                objects.remove(key);
            }
        }
    }

    /// Release every hold `owner` has, e.g. when its view is deleted.
    pub fn release_owner(&self, owner: &str) {
        let all: Vec<(ObjectRef, Vec<Revision>)> = {
            let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
            objects
                .iter()
                .map(|(k, slot)| {
                    let revisions = slot.read().unwrap_or_else(PoisonError::into_inner);
                    let held = revisions
                        .iter()
                        .filter(|(_, e)| e.owners.iter().any(|o| o == owner))
                        .map(|(r, _)| *r)
                        .collect();
                    (k.clone(), held)
                })
                .collect()
        };
        for (key, revisions) in all {
            for revision in revisions {
                self.delete(&key, owner, revision);
            }
        }
    }

    /// Number of retained `(ref, revision)` snapshots.
    pub fn len(&self) -> usize {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects.values().map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &ObjectRef) -> Option<Arc<RwLock<Revisions>>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }
}

fn record(revisions: &mut Revisions, obj: &DynamicObject, revision: Revision, owner: &str) {
    match revisions.get_mut(&revision) {
        Some(entry) => {
            if !entry.owners.iter().any(|o| o == owner) {
                entry.owners.push(owner.to_string());
            }
        }
        None => {
            let mut snapshot = obj.clone();
            sanitize(&mut snapshot);
            let mut owners = SmallVec::new();
            owners.push(owner.to_string());
            revisions.insert(revision, Entry { snapshot: Arc::new(snapshot), owners });
            metrics::counter!("revision_store_inserts_total", 1u64);
        }
    }
}
