//! kview kubehub: discovery, live object access and watch wiring

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use kview_core::{object::sanitize, ObjectType, TypeInfo, TypeRegistry, WatchEvent};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod informer;
pub mod live;

pub use informer::{InformerManager, LiveWatchFactory, WatchFactory};
pub use live::LiveClient;

/// Served resources: the registry plus the `ApiResource` needed to build an `Api` per type.
#[derive(Clone, Default)]
pub struct Discovered {
    pub registry: TypeRegistry,
    pub resources: FxHashMap<ObjectType, ApiResource>,
}

pub async fn connect() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Discovered> {
    let t0 = std::time::Instant::now();
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out = Discovered::default();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let ty = ObjectType::new(ar.api_version.clone(), ar.kind.clone());
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            out.registry.insert(ty.clone(), TypeInfo { plural: ar.plural.clone(), namespaced });
            out.resources.insert(ty, ar);
        }
    }
    info!(types = out.registry.len(), took_ms = %t0.elapsed().as_millis(), "discovery ok");
    Ok(out)
}

pub fn api_for(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

fn event_from(mut obj: DynamicObject, deleted: bool) -> WatchEvent {
    sanitize(&mut obj);
    if deleted {
        WatchEvent::Deleted(obj)
    } else {
        WatchEvent::Applied(obj)
    }
}

/// Start list+watch for one type across all namespaces and forward events into `tx`.
pub async fn start_watcher(api: Api<DynamicObject>, object_type: ObjectType, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %object_type, "watcher started");
    while let Some(ev) = stream.try_next().await.map_err(|e| anyhow!("watch {}: {}", object_type, e))? {
        let batch = match ev {
            Event::Applied(o) => vec![event_from(o, false)],
            Event::Deleted(o) => vec![event_from(o, true)],
            Event::Restarted(list) => {
                debug!(gvk = %object_type, count = list.len(), "watch restart");
                list.into_iter().map(|o| event_from(o, false)).collect()
            }
        };
        for ev in batch {
            metrics::counter!("watch_events_total", 1u64, "gvk" => object_type.key());
            if tx.send(ev).await.is_err() {
                debug!(gvk = %object_type, "event receiver gone; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(gvk = %object_type, "watcher stream ended");
    Ok(())
}
