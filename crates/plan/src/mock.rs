//! Mock Cluster Client: reads fall through to the real cluster, writes stay in
//! the capture overlay.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::core::DynamicObject;
use kview_core::object::{from_value, to_value};
use kview_core::{Error, ListQuery, ObjectChange, ObjectClient, ObjectReader, ObjectRef, ObjectType, Result};
use kview_store::{CaptureStore, ObjectSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct MockClient<'a> {
    real: &'a dyn ObjectReader,
    capture: Mutex<CaptureStore>,
    cancel: CancellationToken,
}

impl<'a> MockClient<'a> {
    pub fn new(real: &'a dyn ObjectReader, capture: CaptureStore, cancel: CancellationToken) -> Self {
        Self { real, capture: Mutex::new(capture), cancel }
    }

    pub fn change_count(&self) -> usize {
        self.lock().changes().len()
    }

    pub fn changes(&self) -> Vec<ObjectChange> {
        self.lock().changes().to_vec()
    }

    /// Keys currently present in the overlay.
    pub fn keys(&self) -> Vec<ObjectRef> {
        self.lock().all().keys().cloned().collect()
    }

    pub fn contains(&self, key: &ObjectRef) -> bool {
        self.lock().get(key).is_some()
    }

    /// `(baseline, current)` object sets.
    pub fn object_sets(&self) -> (ObjectSet, ObjectSet) {
        let capture = self.lock();
        (capture.baseline().clone(), capture.all().clone())
    }

    pub fn into_capture(self) -> CaptureStore {
        self.capture.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, CaptureStore> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Pull a real object into the overlay before its first simulated write, so
    /// the write is classified against what the cluster holds.
    async fn ensure_loaded(&self, key: &ObjectRef) -> Result<bool> {
        {
            let capture = self.lock();
            if capture.get(key).is_some() {
                return Ok(true);
            }
            if capture.is_deleted(key) {
                return Ok(false);
            }
        }
        match self.real.get_opt(key).await? {
            Some(obj) => {
                let mut capture = self.lock();
                // A concurrent write may have landed while the real read was in flight.
                if capture.get(key).is_none() && !capture.is_deleted(key) {
                    capture.load(obj)?;
                }
                Ok(capture.get(key).is_some())
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl<'a> ObjectReader for MockClient<'a> {
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject> {
        self.check_cancelled()?;
        {
            let capture = self.lock();
            if let Some(obj) = capture.get(key) {
                return Ok(obj.clone());
            }
            if capture.is_deleted(key) {
                return Err(Error::not_found(key));
            }
        }
        self.real.get(key).await
    }

    async fn list(&self, object_type: &ObjectType, query: &ListQuery) -> Result<Vec<DynamicObject>> {
        self.check_cancelled()?;
        let real = match self.real.list(object_type, query).await {
            Ok(items) => items,
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let capture = self.lock();
        let mut merged = BTreeMap::new();
        for obj in real {
            let key = ObjectRef::of(&obj)?;
            if !capture.is_deleted(&key) {
                merged.insert(key, obj);
            }
        }
        for (key, obj) in capture.of_type(object_type) {
            if query.matches(obj) {
                merged.insert(key.clone(), obj.clone());
            } else {
                // Overlay state wins even when it no longer matches the query.
                merged.remove(key);
            }
        }
        Ok(merged.into_values().collect())
    }
}

#[async_trait]
impl<'a> ObjectClient for MockClient<'a> {
    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject> {
        self.check_cancelled()?;
        let key = ObjectRef::of(&obj)?;
        if self.ensure_loaded(&key).await? {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        let stored = self.lock().write(&key, Some(obj))?;
        debug!(object = %key, "simulated create");
        stored.ok_or_else(|| Error::not_found(&key))
    }

    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject> {
        self.check_cancelled()?;
        let key = ObjectRef::of(&obj)?;
        if !self.ensure_loaded(&key).await? {
            return Err(Error::not_found(&key));
        }
        let stored = self.lock().write(&key, Some(obj))?;
        stored.ok_or_else(|| Error::not_found(&key))
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
        self.check_cancelled()?;
        if !self.ensure_loaded(key).await? {
            return Err(Error::not_found(key));
        }
        self.lock().write(key, None)?;
        debug!(object = %key, "simulated delete");
        Ok(())
    }
}
