//! The hosting control loop: one `select!` over view events, batched watch
//! events, finished updates and a flush ticker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use kube::ResourceExt;
use kview_core::{Error, ObjectReader, ObjectRef, ObjectType, Result, TypeRegistry, WatchEvent};
use kview_eval::StateEvaluator;
use kview_kubehub::InformerManager;
use kview_ownership::{RootFinder, TreeConfig, ViewIndex};
use kview_plan::{PlanConfig, ReconcilerSet};
use kview_store::RevisionStore;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::resources::{target_ref, view_key, Definition, ReconciliationView, ReconciliationViewStatus};
use crate::status::{StatusWriter, ViewContext, ViewState};
use crate::ControllerConfig;

/// Inputs to the loop besides object watch events.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    ViewApplied(ReconciliationView),
    ViewDeleted(ReconciliationView),
    DefinitionApplied { name: String, definition: Definition },
    DefinitionDeleted(String),
}

struct Tracked {
    view: ReconciliationView,
    root: Option<ObjectRef>,
    cancel: CancellationToken,
    /// `None` while an update task holds it.
    state: Option<ViewState>,
    events: Vec<DynamicObject>,
    /// Types this view is registered for with the informers.
    watched: BTreeSet<ObjectType>,
    written: bool,
    retry_at: Option<Instant>,
}

impl Tracked {
    fn new(view: ReconciliationView) -> Self {
        Self {
            view,
            root: None,
            cancel: CancellationToken::new(),
            state: Some(ViewState::default()),
            events: Vec::new(),
            watched: BTreeSet::new(),
            written: false,
            retry_at: None,
        }
    }
}

struct Done {
    key: String,
    state: ViewState,
    events: Vec<DynamicObject>,
    outcome: Result<ReconciliationViewStatus>,
}

struct Views {
    tracked: BTreeMap<String, Tracked>,
    definitions: BTreeMap<String, Definition>,
    builtin: Definition,
    index: ViewIndex,
    dirty: BTreeSet<String>,
}

fn lookup<'a>(definitions: &'a BTreeMap<String, Definition>, builtin: &'a Definition, name: Option<&str>) -> Option<&'a Definition> {
    match name {
        Some(name) => definitions.get(name),
        None => Some(builtin),
    }
}

impl Views {
    fn definition_for(&self, view: &ReconciliationView) -> Option<&Definition> {
        lookup(&self.definitions, &self.builtin, view.spec.view_definition.as_deref())
    }

    fn definitions_in_use(&self) -> Vec<Definition> {
        let names: BTreeSet<Option<&str>> = self.tracked.values().map(|t| t.view.spec.view_definition.as_deref()).collect();
        names.into_iter().filter_map(|n| lookup(&self.definitions, &self.builtin, n)).cloned().collect()
    }
}

pub struct ViewController {
    config: ControllerConfig,
    registry: Arc<TypeRegistry>,
    store: Arc<RevisionStore>,
    evaluator: Arc<StateEvaluator>,
    reconcilers: Arc<ReconcilerSet>,
    plan: PlanConfig,
    tree: TreeConfig,
    builtin: Definition,
    live: Arc<dyn ObjectReader>,
    writer: Arc<dyn StatusWriter>,
    informers: Arc<InformerManager>,
}

impl ViewController {
    pub fn new(registry: Arc<TypeRegistry>, live: Arc<dyn ObjectReader>, writer: Arc<dyn StatusWriter>, informers: Arc<InformerManager>) -> Self {
        let mut builtin = Definition::builtin();
        if !registry.is_empty() {
            builtin.rules = Arc::new(builtin.rules.filter_unsupported(&registry));
        }
        Self {
            config: ControllerConfig::default(),
            registry,
            store: Arc::new(RevisionStore::new()),
            evaluator: Arc::new(StateEvaluator::default()),
            reconcilers: Arc::new(ReconcilerSet::default()),
            plan: PlanConfig::default(),
            tree: TreeConfig::default(),
            builtin,
            live,
            writer,
            informers,
        }
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reconcilers(mut self, reconcilers: Arc<ReconcilerSet>) -> Self {
        self.reconcilers = reconcilers;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<StateEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_plan_config(mut self, plan: PlanConfig) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_tree_config(mut self, tree: TreeConfig) -> Self {
        self.tree = tree;
        self
    }

    /// Definition used by views that name none.
    pub fn with_default_definition(mut self, definition: Definition) -> Self {
        self.builtin = definition;
        self
    }

    pub fn store(&self) -> Arc<RevisionStore> {
        Arc::clone(&self.store)
    }

    /// Run until `shutdown` fires or the event stream closes. Every view is
    /// updated by at most one task at a time.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ControllerEvent>,
        mut batches: mpsc::Receiver<Vec<WatchEvent>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let (done_tx, mut done_rx) = mpsc::channel::<Done>(self.config.queue_cap.max(1));
        let mut ticker = tokio::time::interval(self.config.batch.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut views = Views {
            tracked: BTreeMap::new(),
            definitions: BTreeMap::new(),
            builtin: self.builtin.clone(),
            index: ViewIndex::default(),
            dirty: BTreeSet::new(),
        };
        info!(batch_ms = %self.config.batch.as_millis(), "view controller started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe = events.recv() => match maybe {
                    Some(ev) => self.on_event(&mut views, ev),
                    None => {
                        info!("view event stream closed");
                        break;
                    }
                },
                Some(batch) = batches.recv() => self.on_batch(&mut views, &batch).await,
                Some(done) = done_rx.recv() => self.on_done(&mut views, done),
                _ = ticker.tick() => self.schedule(&mut views, &done_tx),
            }
        }
        for t in views.tracked.values() {
            t.cancel.cancel();
        }
        info!(views = views.tracked.len(), "view controller stopped");
        Ok(())
    }

    fn on_event(&self, views: &mut Views, event: ControllerEvent) {
        match event {
            ControllerEvent::ViewApplied(view) => self.track(views, view, false),
            ControllerEvent::ViewDeleted(view) => self.forget(views, &view_key(&view)),
            ControllerEvent::DefinitionApplied { name, definition } => {
                info!(definition = %name, root = %definition.root_type, "view definition loaded");
                views.definitions.insert(name.clone(), definition);
                let users: Vec<ReconciliationView> = views
                    .tracked
                    .values()
                    .filter(|t| t.view.spec.view_definition.as_deref() == Some(name.as_str()))
                    .map(|t| t.view.clone())
                    .collect();
                for view in users {
                    self.track(views, view, true);
                }
            }
            ControllerEvent::DefinitionDeleted(name) => {
                views.definitions.remove(&name);
                let users = views.tracked.values().filter(|t| t.view.spec.view_definition.as_deref() == Some(name.as_str())).count();
                warn!(definition = %name, views = users, "view definition removed; dependent views keep their last status");
            }
        }
        metrics::gauge!("views_tracked", views.tracked.len() as f64);
    }

    fn track(&self, views: &mut Views, view: ReconciliationView, force: bool) {
        let key = view_key(&view);
        let (root, wanted) = match views.definition_for(&view) {
            Some(definition) => match target_ref(&view, definition) {
                Ok(root) => {
                    let mut types = definition.rules.types();
                    types.insert(definition.root_type.clone());
                    types.insert(ObjectType::event());
                    (Some(root), types)
                }
                Err(e) => {
                    warn!(view = %key, error = %e, "view not tracked");
                    (None, BTreeSet::new())
                }
            },
            None => {
                warn!(view = %key, definition = ?view.spec.view_definition, "view definition not found; waiting for it");
                (None, BTreeSet::new())
            }
        };

        let tracked = views.tracked.entry(key.clone()).or_insert_with(|| Tracked::new(view.clone()));
        for ty in tracked.watched.difference(&wanted) {
            self.informers.unwatch(&key, ty);
        }
        for ty in wanted.difference(&tracked.watched) {
            self.informers.watch(&key, ty);
        }
        tracked.watched = wanted;
        let changed = force || tracked.root.is_none() || tracked.view.spec != view.spec;
        // Our own status writes come back through the watch; the in-memory copy is newer.
        let ours = if tracked.written { tracked.view.status.take() } else { None };
        tracked.view = view;
        if ours.is_some() {
            tracked.view.status = ours;
        }
        if tracked.root != root {
            views.index.remove_view(&key);
            if let Some(r) = &root {
                views.index.insert(r.clone(), &key);
            }
            tracked.root = root;
        }
        if changed && tracked.root.is_some() {
            debug!(view = %key, "view queued");
            views.dirty.insert(key);
        }
    }

    fn forget(&self, views: &mut Views, key: &str) {
        if let Some(t) = views.tracked.remove(key) {
            t.cancel.cancel();
        }
        views.index.remove_view(key);
        views.dirty.remove(key);
        self.informers.unwatch_all(key);
        self.store.release_owner(key);
        info!(view = %key, "view released");
    }

    /// Map each changed object to the views whose trees contain it.
    async fn on_batch(&self, views: &mut Views, batch: &[WatchEvent]) {
        if views.index.is_empty() {
            return;
        }
        let root_types = views.index.root_types();
        let definitions = views.definitions_in_use();
        for event in batch {
            let obj = event.object();
            let mut roots = BTreeSet::new();
            let mut unplaced = None;
            for definition in &definitions {
                let finder = RootFinder::new(&definition.rules, &self.registry, &root_types, self.tree);
                match finder.find_roots(obj, self.live.as_ref()).await {
                    Ok(found) => roots.extend(found),
                    Err(e @ Error::ReferenceIntegrity(_)) => unplaced = Some(e),
                    Err(e) => warn!(object = ?obj.metadata.name, error = %e, "root lookup failed"),
                }
            }
            if roots.is_empty() {
                if let Some(e) = unplaced {
                    warn!(object = ?obj.metadata.name, error = %e, "dropping change");
                }
                continue;
            }
            let is_event = ObjectType::of(obj).map(|t| t.is_event()).unwrap_or(false);
            for key in views.index.views_for(roots.iter()) {
                if let Some(t) = views.tracked.get_mut(&key) {
                    if is_event && !event.is_deleted() {
                        t.events.push(obj.clone());
                    }
                    views.dirty.insert(key);
                }
            }
        }
    }

    fn schedule(&self, views: &mut Views, done_tx: &mpsc::Sender<Done>) {
        let now = Instant::now();
        let ready: Vec<String> = views
            .dirty
            .iter()
            .filter(|k| views.tracked.get(*k).is_some_and(|t| t.state.is_some() && t.retry_at.map_or(true, |at| at <= now)))
            .cloned()
            .collect();
        for key in ready {
            let Some(t) = views.tracked.get_mut(&key) else { continue };
            let Some(definition) = lookup(&views.definitions, &views.builtin, t.view.spec.view_definition.as_deref()).cloned() else {
                continue;
            };
            let Some(mut state) = t.state.take() else { continue };
            views.dirty.remove(&key);

            let ctx = self.context(definition);
            let view = t.view.clone();
            let events = std::mem::take(&mut t.events);
            let cancel = t.cancel.clone();
            let live = Arc::clone(&self.live);
            let writer = Arc::clone(&self.writer);
            let done = done_tx.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    r = state.update_view_status(&view, &ctx, live.as_ref(), &events, &cancel) => r,
                };
                let outcome = match outcome {
                    Ok(status) => {
                        let (namespace, name) = (view.namespace().unwrap_or_default(), view.name_any());
                        let written = writer.patch_status(&namespace, &name, &status).await;
                        written.map(|()| status)
                    }
                    Err(e) => Err(e),
                };
                let _ = done.send(Done { key, state, events, outcome }).await;
            });
        }
    }

    fn on_done(&self, views: &mut Views, done: Done) {
        let Done { key, state, events, outcome } = done;
        let Some(t) = views.tracked.get_mut(&key) else {
            // Deleted while the update ran.
            self.store.release_owner(&key);
            return;
        };
        t.state = Some(state);
        match outcome {
            Ok(status) => {
                debug!(view = %key, changes = status.current_state.changes.len(), "view status written");
                t.view.status = Some(status);
                t.written = true;
                t.retry_at = None;
            }
            Err(Error::Cancelled) => {}
            Err(e) => {
                if e.is_soft() {
                    warn!(view = %key, error = %e, "view update failed; retrying");
                } else {
                    error!(view = %key, error = %e, "view update failed; retrying");
                }
                metrics::counter!("view_update_failures_total", 1u64);
                let mut requeued = events;
                requeued.append(&mut t.events);
                t.events = requeued;
                t.retry_at = Some(Instant::now() + self.config.retry);
                views.dirty.insert(key);
            }
        }
    }

    fn context(&self, definition: Definition) -> ViewContext {
        ViewContext {
            definition,
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            evaluator: Arc::clone(&self.evaluator),
            reconcilers: Arc::clone(&self.reconcilers),
            plan: self.plan,
            tree: self.tree,
        }
    }
}
