//! Reference-counted type subscriptions shared by many watchers.
//!
//! A watch on a type starts when its first watcher registers and stops when the
//! last one leaves. One mutex guards the whole table.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use kview_core::{ObjectType, WatchEvent};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{start_watcher, LiveClient};

/// Starts the underlying watch for a type.
pub trait WatchFactory: Send + Sync {
    fn spawn(&self, object_type: &ObjectType, events: mpsc::Sender<WatchEvent>) -> JoinHandle<()>;
}

pub struct LiveWatchFactory {
    client: LiveClient,
}

impl LiveWatchFactory {
    pub fn new(client: LiveClient) -> Self {
        Self { client }
    }
}

impl WatchFactory for LiveWatchFactory {
    fn spawn(&self, object_type: &ObjectType, events: mpsc::Sender<WatchEvent>) -> JoinHandle<()> {
        let api = self.client.api_all(object_type);
        let ty = object_type.clone();
        tokio::spawn(async move {
            let res = match api {
                Ok(api) => start_watcher(api, ty.clone(), events).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = res {
                warn!(gvk = %ty, error = %e, "watcher failed");
            }
        })
    }
}

struct Subscription {
    watchers: BTreeSet<String>,
    handle: JoinHandle<()>,
}

pub struct InformerManager {
    factory: Arc<dyn WatchFactory>,
    events: mpsc::Sender<WatchEvent>,
    table: Mutex<FxHashMap<ObjectType, Subscription>>,
}

impl InformerManager {
    pub fn new(factory: Arc<dyn WatchFactory>, events: mpsc::Sender<WatchEvent>) -> Self {
        Self { factory, events, table: Mutex::new(FxHashMap::default()) }
    }

    /// Register `watcher` for `object_type`. Returns true when this started a new watch.
    pub fn watch(&self, watcher: &str, object_type: &ObjectType) -> bool {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sub) = table.get_mut(object_type) {
            sub.watchers.insert(watcher.to_string());
            return false;
        }
        let handle = self.factory.spawn(object_type, self.events.clone());
        let mut watchers = BTreeSet::new();
        watchers.insert(watcher.to_string());
        table.insert(object_type.clone(), Subscription { watchers, handle });
        info!(gvk = %object_type, watcher = %watcher, "watch started");
        metrics::gauge!("watch_types_active", table.len() as f64);
        true
    }

    /// Deregister `watcher`. Returns true when this stopped the watch.
    pub fn unwatch(&self, watcher: &str, object_type: &ObjectType) -> bool {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sub) = table.get_mut(object_type) else { return false };
        sub.watchers.remove(watcher);
        if !sub.watchers.is_empty() {
            return false;
        }
        if let Some(sub) = table.remove(object_type) {
            sub.handle.abort();
        }
        info!(gvk = %object_type, watcher = %watcher, "watch stopped");
        metrics::gauge!("watch_types_active", table.len() as f64);
        true
    }

    /// Drop every registration of `watcher`.
    pub fn unwatch_all(&self, watcher: &str) {
        for ty in self.watched_types() {
            self.unwatch(watcher, &ty);
        }
    }

    pub fn watched_types(&self) -> Vec<ObjectType> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = table.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn watcher_count(&self, object_type: &ObjectType) -> usize {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.get(object_type).map(|s| s.watchers.len()).unwrap_or(0)
    }
}

impl Drop for InformerManager {
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, sub) in table.drain() {
            sub.handle.abort();
        }
    }
}
