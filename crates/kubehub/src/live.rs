//! `ObjectClient` over a real API server.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use kview_core::object::sanitize;
use kview_core::{Error, ListQuery, ObjectClient, ObjectReader, ObjectRef, ObjectType, Result, TypeRegistry};

use crate::{api_for, Discovered};

#[derive(Clone)]
pub struct LiveClient {
    client: Client,
    discovered: Arc<Discovered>,
}

impl LiveClient {
    pub fn new(client: Client, discovered: Arc<Discovered>) -> Self {
        Self { client, discovered }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.discovered.registry
    }

    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn resource(&self, object_type: &ObjectType) -> Result<(&ApiResource, bool)> {
        let ar = self
            .discovered
            .resources
            .get(object_type)
            .ok_or_else(|| Error::SelectorResolution(format!("type {} is not served by the cluster", object_type)))?;
        Ok((ar, self.discovered.registry.is_namespaced(object_type)))
    }

    fn api(&self, object_type: &ObjectType, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resource(object_type)?;
        Ok(api_for(self.client.clone(), ar, namespaced, namespace))
    }

    /// Api for a type, all namespaces; used by watchers.
    pub fn api_all(&self, object_type: &ObjectType) -> Result<Api<DynamicObject>> {
        self.api(object_type, None)
    }

    fn api_for_object(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String)> {
        let key = ObjectRef::of(obj)?;
        Ok((self.api(&key.object_type, key.namespace.as_deref())?, key.name))
    }
}

fn selector_string(query: &ListQuery) -> Option<String> {
    if query.labels.is_empty() {
        return None;
    }
    Some(query.labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(","))
}

#[async_trait]
impl ObjectReader for LiveClient {
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject> {
        let api = self.api(&key.object_type, key.namespace.as_deref())?;
        let mut obj = api.get(&key.name).await?;
        sanitize(&mut obj);
        Ok(obj)
    }

    async fn list(&self, object_type: &ObjectType, query: &ListQuery) -> Result<Vec<DynamicObject>> {
        let api = self.api(object_type, query.namespace.as_deref())?;
        let mut lp = ListParams::default();
        if let Some(sel) = selector_string(query) {
            lp = lp.labels(&sel);
        }
        let list = api.list(&lp).await?;
        Ok(list
            .items
            .into_iter()
            .map(|mut o| {
                sanitize(&mut o);
                o
            })
            .collect())
    }
}

#[async_trait]
impl ObjectClient for LiveClient {
    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let (api, _) = self.api_for_object(&obj)?;
        Ok(api.create(&PostParams::default(), &obj).await?)
    }

    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let (api, name) = self.api_for_object(&obj)?;
        Ok(api.replace(&name, &PostParams::default(), &obj).await?)
    }

    async fn patch(&self, key: &ObjectRef, patch: &serde_json::Value) -> Result<DynamicObject> {
        let api = self.api(&key.object_type, key.namespace.as_deref())?;
        Ok(api.patch(&key.name, &PatchParams::default(), &Patch::Merge(patch)).await?)
    }

    async fn delete(&self, key: &ObjectRef) -> Result<()> {
        let api = self.api(&key.object_type, key.namespace.as_deref())?;
        api.delete(&key.name, &DeleteParams::default()).await?;
        Ok(())
    }
}
