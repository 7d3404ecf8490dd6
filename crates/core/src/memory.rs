//! In-memory cluster used by tests and offline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use tracing::debug;
use uuid::Uuid;

use crate::client::{ListQuery, ObjectClient, ObjectReader};
use crate::object::{from_value, sanitize, to_value};
use crate::{Error, ObjectRef, ObjectType, Result, Revision};

/// Server-side behaviour that matters to the planner: resource versions from a
/// single counter, generation bumps on body changes, uid assignment and merge patch.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    objects: RwLock<BTreeMap<ObjectRef, DynamicObject>>,
    last_revision: AtomicI64,
    fail_reads: AtomicBool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start resource versions after `revision`.
    pub fn starting_at(revision: Revision) -> Self {
        let c = Self::default();
        c.last_revision.store(revision, Ordering::SeqCst);
        c
    }

    pub fn current_revision(&self) -> Revision {
        self.last_revision.load(Ordering::SeqCst)
    }

    /// Make every read fail with a cluster error; lets callers test hard-failure paths.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Insert or replace an object as-is, assigning uid and resourceVersion only when absent.
    pub fn seed(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectRef::of(&obj)?;
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        match obj.metadata.resource_version.as_deref().map(crate::parse_revision) {
            Some(rev) if rev > 0 => {
                self.last_revision.fetch_max(rev, Ordering::SeqCst);
            }
            _ => obj.metadata.resource_version = Some(self.next_revision().to_string()),
        }
        obj.metadata.generation.get_or_insert(1);
        sanitize(&mut obj);
        self.write().insert(key, obj.clone());
        Ok(obj)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn next_revision(&self) -> Revision {
        self.last_revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ObjectRef, DynamicObject>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ObjectRef, DynamicObject>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::cluster("memory cluster: reads disabled"));
        }
        Ok(())
    }

    fn spec_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
        let strip = |v: &serde_json::Value| {
            let mut v = v.clone();
            if let Some(o) = v.as_object_mut() {
                o.remove("status");
            }
            v
        };
        strip(&old.data) != strip(&new.data)
    }
}

#[async_trait]
impl ObjectReader for MemoryCluster {
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject> {
        self.check_reads()?;
        self.read().get(key).cloned().ok_or_else(|| Error::not_found(key))
    }

    async fn list(&self, object_type: &ObjectType, query: &ListQuery) -> Result<Vec<DynamicObject>> {
        self.check_reads()?;
        Ok(self
            .read()
            .iter()
            .filter(|(k, o)| &k.object_type == object_type && query.matches(o))
            .map(|(_, o)| o.clone())
            .collect())
    }
}

#[async_trait]
impl ObjectClient for MemoryCluster {
    async fn create(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectRef::of(&obj)?;
        let mut objects = self.write();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        obj.metadata.uid = Some(Uuid::new_v4().to_string());
        obj.metadata.resource_version = Some(self.next_revision().to_string());
        obj.metadata.generation = Some(1);
        obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        sanitize(&mut obj);
        objects.insert(key.clone(), obj.clone());
        debug!(object = %key, "memory cluster create");
        Ok(obj)
    }

    async fn update(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = ObjectRef::of(&obj)?;
        let mut objects = self.write();
        let current = objects.get(&key).ok_or_else(|| Error::not_found(&key))?;
        obj.metadata.uid = current.metadata.uid.clone();
        obj.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        let generation = current.metadata.generation.unwrap_or(1);
        obj.metadata.generation = Some(if Self::spec_changed(current, &obj) { generation + 1 } else { generation });
        obj.metadata.resource_version = Some(self.next_revision().to_string());
        sanitize(&mut obj);
        objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn patch(&self, key: &ObjectRef, patch: &serde_json::Value) -> Result<DynamicObject> {
        let current = self.get(key).await?;
        let mut doc = to_value(&current)?;
        json_patch::merge(&mut doc, patch);
        let patched = from_value(doc)?;
        if ObjectRef::of(&patched)? != *key {
            return Err(Error::InvalidPatch(format!("patch may not change identity of {}", key)));
        }
        self.update(patched).await
    }

    async fn delete(&self, key: &ObjectRef) -> Result<()> {
        match self.write().remove(key) {
            Some(_) => {
                self.next_revision();
                Ok(())
            }
            None => Err(Error::not_found(key)),
        }
    }
}
