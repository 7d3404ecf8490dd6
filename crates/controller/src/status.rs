//! View status updater: folds each observation of a root's live tree into the
//! view's status, trims the change log at reconciliation cycle boundaries and
//! refreshes the dry-run plan when its inputs moved.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::Client;
use kview_core::object::{generation_of, revision_of};
use kview_core::{
    sort_changes, ChangeType, DryRunResult, Error, ObjectChange, ObjectReader, ObjectRef, ObjectTreeDiffSummary, ObjectTreeNode,
    ObjectType, ReconciliationCycleState, Result, Revision, TypeRegistry,
};
use kview_eval::{latest_cycle_start, StateEvaluator};
use kview_ownership::{objects_from_tree, RevisionSource, TreeBuilder, TreeConfig};
use kview_plan::{build_object_summaries, spec_revision, PlanConfig, PlanGenerator, ReconcilerSet};
use kview_store::{build_changes, make_change, DescriptionFormatter, ObjectSet, RevisionStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resources::{target_ref, view_key, Definition, ReconciliationView, ReconciliationViewStatus};

/// Reason recorded when `spec.dryRun.desiredSpec` cannot be parsed.
pub const REASON_INVALID_DESIRED_SPEC: &str = "InvalidDesiredSpec";

/// Everything a status update needs besides the view itself.
#[derive(Clone)]
pub struct ViewContext {
    pub definition: Definition,
    pub registry: Arc<TypeRegistry>,
    pub store: Arc<RevisionStore>,
    pub evaluator: Arc<StateEvaluator>,
    pub reconcilers: Arc<ReconcilerSet>,
    pub plan: PlanConfig,
    pub tree: TreeConfig,
}

impl ViewContext {
    pub fn new(definition: Definition, registry: Arc<TypeRegistry>, store: Arc<RevisionStore>) -> Self {
        Self {
            definition,
            registry,
            store,
            evaluator: Arc::new(StateEvaluator::default()),
            reconcilers: Arc::new(ReconcilerSet::default()),
            plan: PlanConfig::default(),
            tree: TreeConfig::default(),
        }
    }

    fn builder(&self) -> TreeBuilder<'_> {
        TreeBuilder::new(&self.definition.rules, &self.registry, self.tree)
    }
}

/// Per-view memory between updates. Holds untruncated trees so depth limits in
/// status never leak into change detection. Empty after a restart, in which case
/// the trees persisted in status are used.
#[derive(Debug, Default)]
pub struct ViewState {
    current: Option<ObjectTreeNode>,
    initial: Option<ObjectTreeNode>,
}

impl ViewState {
    /// Compute the next status of `view` from its previous status and the live tree.
    ///
    /// `events` are Kubernetes Events known to concern this view's root; ones
    /// already in the change log are skipped.
    pub async fn update_view_status(
        &mut self,
        view: &ReconciliationView,
        ctx: &ViewContext,
        live: &dyn ObjectReader,
        events: &[DynamicObject],
        cancel: &CancellationToken,
    ) -> Result<ReconciliationViewStatus> {
        let t0 = Instant::now();
        let owner = view_key(view);
        let root_ref = target_ref(view, &ctx.definition)?;
        let prev = view.status.clone().unwrap_or_default();
        let formatter = DescriptionFormatter::new(ctx.definition.locale.clone(), view.spec.locale.clone());

        let root = live.get_opt(&root_ref).await?;
        let (current_tree, current_objects) = match &root {
            Some(root) => {
                let built = ctx.builder().build(root, live).await?;
                (Some(built.tree), built.objects)
            }
            None => {
                debug!(view = %owner, root = %root_ref, "target not found");
                (None, ObjectSet::new())
            }
        };
        for obj in current_objects.values() {
            ctx.store.insert(obj, &owner)?;
        }

        let previous_tree = self.current.clone().or_else(|| prev.current_state.object_tree.clone());
        let mut fresh = match &previous_tree {
            Some(tree) => build_changes(&objects_from_tree(tree, &ctx.store)?, &current_objects, &formatter),
            // First observation: the live tree is the baseline.
            None => Vec::new(),
        };
        fresh.extend(self.event_changes(view, ctx, events, &prev.current_state.changes, &formatter)?);

        let expression = view
            .spec
            .state_evaluation_expression
            .as_ref()
            .and_then(|e| e.expression())
            .unwrap_or(&ctx.definition.expression);
        for change in fresh.iter_mut() {
            if !matches!(change.change_type, ChangeType::Creation | ChangeType::Update) || change.object_reference.to_ref() != root_ref {
                continue;
            }
            match ctx.store.get(&root_ref, change.revision) {
                Ok(snapshot) => change.state = Some(ctx.evaluator.evaluate(&snapshot, expression)?),
                Err(e) if e.is_not_found() => debug!(view = %owner, revision = change.revision, "root snapshot missing; state left unset"),
                Err(e) => return Err(e),
            }
        }

        let mut changes = prev.current_state.changes.clone();
        let appended = fresh.len();
        changes.extend(fresh);
        sort_changes(&mut changes);

        let mut initial_tree = self.initial.clone().or_else(|| prev.initial_object_tree.clone()).or_else(|| current_tree.clone());
        if let Some(at) = latest_cycle_start(&changes, &root_ref).filter(|&at| at > 0) {
            let boundary = changes[at].revision;
            let stale: Vec<ObjectChange> = changes.drain(..at).collect();
            if let Some(tree) = tree_at(ctx, &root_ref, boundary).await? {
                initial_tree = Some(tree);
            }
            let pinned = pinned_revisions([initial_tree.as_ref(), current_tree.as_ref()]);
            let releasable: Vec<ObjectChange> =
                stale.into_iter().filter(|c| !pinned.contains(&(c.object_reference.to_ref(), c.revision))).collect();
            delete_unused_revisions(&ctx.store, &releasable, &owner);
            info!(view = %owner, boundary, dropped = at, released = releasable.len(), "new reconciliation cycle");
            metrics::counter!("view_cycles_total", 1u64);
        }

        let initial_objects = match &initial_tree {
            Some(tree) => objects_from_tree(tree, &ctx.store)?,
            None => ObjectSet::new(),
        };
        let summary = build_object_summaries(&initial_objects, &current_objects);

        let depth = view.spec.depth.unwrap_or(0).max(0) as usize;
        let mut status = ReconciliationViewStatus {
            dry_run_result: prev.dry_run_result.clone(),
            initial_object_tree: truncated(initial_tree.clone(), depth),
            current_state: ReconciliationCycleState {
                summary: ObjectTreeDiffSummary { object_summaries: summary },
                object_tree: truncated(current_tree.clone(), depth),
                changes,
            },
            desired_state: prev.desired_state.clone(),
        };

        match (&view.spec.dry_run, &root) {
            (None, _) => {
                status.dry_run_result = None;
                status.desired_state = None;
            }
            (Some(dry_run), Some(root)) => {
                let revision = spec_revision(&dry_run.desired_spec);
                let generation = generation_of(root);
                let outdated = prev
                    .dry_run_result
                    .as_ref()
                    .map_or(true, |r| r.desired_spec_revision != revision || r.observed_target_generation != generation);
                if outdated {
                    let mut result = dry_run_for(ctx, &root_ref, &dry_run.desired_spec, live, &formatter, cancel).await?;
                    result.desired_spec_revision = revision;
                    result.observed_target_generation = generation;
                    result.plan.object_tree = truncated(result.plan.object_tree.take(), depth);
                    status.desired_state = result.succeeded().then(|| result.plan.clone());
                    status.dry_run_result = Some(result);
                }
            }
            // Keep the last plan while the root is gone.
            (Some(_), None) => {}
        }

        // Only a completed update replaces the remembered trees.
        self.current = current_tree;
        self.initial = initial_tree;

        metrics::counter!("view_updates_total", 1u64);
        metrics::histogram!("view_update_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(view = %owner, appended, took_ms = %t0.elapsed().as_millis(), "view status computed");
        Ok(status)
    }

    fn event_changes(
        &self,
        view: &ReconciliationView,
        ctx: &ViewContext,
        events: &[DynamicObject],
        recorded: &[ObjectChange],
        formatter: &DescriptionFormatter,
    ) -> Result<Vec<ObjectChange>> {
        let owner = view_key(view);
        let mut out: Vec<ObjectChange> = Vec::new();
        for event in events {
            let revision = revision_of(event);
            let name = event.metadata.name.as_deref().unwrap_or_default();
            let seen = recorded.iter().chain(out.iter()).any(|c| {
                c.change_type == ChangeType::Event
                    && c.revision == revision
                    && c.event_attributes.as_ref().is_some_and(|a| a.name == name)
            });
            if seen {
                continue;
            }
            match make_change(&ObjectType::event(), event, ChangeType::Event, revision, formatter) {
                Ok(Some(change)) => {
                    ctx.store.insert(event, &owner)?;
                    out.push(change);
                }
                Ok(None) => {}
                Err(e) => warn!(view = %owner, event = %name, error = %e, "dropping event"),
            }
        }
        Ok(out)
    }
}

async fn dry_run_for(
    ctx: &ViewContext,
    root: &ObjectRef,
    desired_spec: &str,
    live: &dyn ObjectReader,
    formatter: &DescriptionFormatter,
    cancel: &CancellationToken,
) -> Result<DryRunResult> {
    let planner = PlanGenerator::new(Arc::clone(&ctx.definition.rules), Arc::clone(&ctx.registry), Arc::clone(&ctx.reconcilers))
        .with_config(ctx.plan)
        .with_tree_config(ctx.tree)
        .with_formatter(formatter.clone());
    match planner.generate(root, desired_spec, live, cancel).await {
        Ok(result) => Ok(result),
        Err(Error::InvalidPatch(message)) => {
            warn!(root = %root, %message, "desired spec rejected");
            Ok(DryRunResult::failed(REASON_INVALID_DESIRED_SPEC, message))
        }
        Err(e) => Err(e),
    }
}

/// Tree of `root` as it stood at `revision`, from retained snapshots.
async fn tree_at(ctx: &ViewContext, root: &ObjectRef, revision: Revision) -> Result<Option<ObjectTreeNode>> {
    let Some(snapshot) = ctx.store.get_at_or_before(root, revision) else { return Ok(None) };
    let source = RevisionSource::new(&ctx.store, revision);
    Ok(Some(ctx.builder().build(&snapshot, &source).await?.tree))
}

fn pinned_revisions<'a>(trees: impl IntoIterator<Item = Option<&'a ObjectTreeNode>>) -> BTreeSet<(ObjectRef, Revision)> {
    trees.into_iter().flatten().flat_map(|t| t.references()).map(|r| (r.to_ref(), r.revision())).collect()
}

fn truncated(tree: Option<ObjectTreeNode>, depth: usize) -> Option<ObjectTreeNode> {
    tree.map(|mut t| {
        t.truncate(depth);
        t
    })
}

/// Release `owner`'s hold on the snapshot behind each change. Event changes
/// point at their involved object, so the event itself is looked up by name.
pub fn delete_unused_revisions(store: &RevisionStore, changes: &[ObjectChange], owner: &str) {
    for change in changes {
        let key = match (&change.change_type, &change.event_attributes) {
            (ChangeType::Event, Some(attrs)) => {
                let ns = Some(change.object_reference.namespace.as_str()).filter(|ns| !ns.is_empty());
                ObjectRef::new(ObjectType::event(), ns, attrs.name.clone())
            }
            _ => change.object_reference.to_ref(),
        };
        store.delete(&key, owner, change.revision);
    }
}

/// Persists computed status.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn patch_status(&self, namespace: &str, name: &str, status: &ReconciliationViewStatus) -> Result<()>;
}

/// JSON merge patch body for a status. Absent optional sections are sent as
/// `null` so they are cleared rather than left untouched.
pub fn status_patch(status: &ReconciliationViewStatus) -> Result<serde_json::Value> {
    let mut body = serde_json::to_value(status)?;
    if let Some(o) = body.as_object_mut() {
        for key in ["dryRunResult", "initialObjectTree", "desiredState"] {
            o.entry(key).or_insert(serde_json::Value::Null);
        }
    }
    Ok(serde_json::json!({ "status": body }))
}

pub struct KubeStatusWriter {
    client: Client,
    timeout: Duration,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client, timeout: Duration::from_secs(10) }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn patch_status(&self, namespace: &str, name: &str, status: &ReconciliationViewStatus) -> Result<()> {
        let api: Api<ReconciliationView> = Api::namespaced(self.client.clone(), namespace);
        let patch = status_patch(status)?;
        let pp = PatchParams::default();
        match tokio::time::timeout(self.timeout, api.patch_status(name, &pp, &Patch::Merge(&patch))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::cluster(format!("status patch of {namespace}/{name} timed out"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kview_core::object::new_object;
    use kview_core::{EventAttributes, ObjectReference};
    use serde_json::json;

    fn change(kind: &str, name: &str, change_type: ChangeType, revision: Revision) -> ObjectChange {
        ObjectChange {
            object_reference: ObjectReference {
                api_version: "v1".into(),
                kind: kind.into(),
                namespace: "demo".into(),
                name: name.into(),
                resource_version: revision.to_string(),
                ..Default::default()
            },
            change_type,
            event_attributes: None,
            revision,
            timestamp: None,
            description: change_type.to_string(),
            local_description: None,
            state: None,
        }
    }

    #[test]
    fn stale_revisions_are_released_per_owner() {
        let store = RevisionStore::new();
        let mut pod = new_object(&ObjectType::new("v1", "Pod"), Some("demo"), "p", json!({}));
        pod.metadata.resource_version = Some("3".into());
        store.insert(&pod, "demo/a").unwrap();
        store.insert(&pod, "demo/b").unwrap();
        let mut event = new_object(&ObjectType::event(), Some("demo"), "p.1", json!({}));
        event.metadata.resource_version = Some("4".into());
        store.insert(&event, "demo/a").unwrap();

        let mut ev = change("Pod", "p", ChangeType::Event, 4);
        ev.event_attributes = Some(EventAttributes { name: "p.1".into(), ..Default::default() });
        delete_unused_revisions(&store, &[change("Pod", "p", ChangeType::Creation, 3), ev], "demo/a");

        let pod_key = ObjectRef::of(&pod).unwrap();
        assert!(store.get(&pod_key, 3).is_ok(), "still held by the other view");
        assert!(store.get(&ObjectRef::of(&event).unwrap(), 4).unwrap_err().is_not_found());
        delete_unused_revisions(&store, &[change("Pod", "p", ChangeType::Update, 3)], "demo/b");
        assert!(store.is_empty());
    }

    #[test]
    fn status_patch_clears_absent_sections() {
        let patch = status_patch(&ReconciliationViewStatus::default()).unwrap();
        assert_eq!(patch["status"]["dryRunResult"], serde_json::Value::Null);
        assert_eq!(patch["status"]["desiredState"], serde_json::Value::Null);
        assert!(patch["status"]["currentState"]["changes"].as_array().unwrap().is_empty());
    }
}
