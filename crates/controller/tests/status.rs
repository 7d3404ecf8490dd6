#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kview_controller::{
    DryRun, Definition, ReconciliationView, ReconciliationViewSpec, ReconciliationViewStatus, TargetObject, ViewContext, ViewState,
    REASON_INVALID_DESIRED_SPEC,
};
use kview_core::object::new_object;
use kview_core::{ChangeType, DryRunPhase, MemoryCluster, ObjectClient, ObjectRef, ObjectType, TypeRegistry};
use kview_ownership::{OwnedResource, OwnershipCriteria, OwnershipRule, OwnershipRules, ValidationType, DEFAULT_STATE_EXPRESSION};
use kview_plan::{Reconciler, ReconcilerSet};
use kview_store::RevisionStore;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const APPS: &str = "apps.kubeblocks.io/v1";
const INSTANCE: &str = "app.kubernetes.io/instance";
const COMPONENT: &str = "app.kubernetes.io/component";

fn cluster_type() -> ObjectType {
    ObjectType::new(APPS, "Cluster")
}

fn component_type() -> ObjectType {
    ObjectType::new(APPS, "Component")
}

fn pod_type() -> ObjectType {
    ObjectType::new("v1", "Pod")
}

fn root() -> ObjectRef {
    ObjectRef::new(cluster_type(), Some("demo"), "mysql")
}

fn pod_ref(i: usize) -> ObjectRef {
    ObjectRef::new(pod_type(), Some("demo"), format!("mysql-mysql-{i}"))
}

fn definition() -> Definition {
    let rules = OwnershipRules::new(vec![
        OwnershipRule {
            primary: cluster_type(),
            owned_resources: vec![OwnedResource {
                secondary: component_type(),
                criteria: OwnershipCriteria::labels([(INSTANCE, "$(primary.name)")], ValidationType::Owner),
            }],
        },
        OwnershipRule {
            primary: component_type(),
            owned_resources: vec![OwnedResource {
                secondary: pod_type(),
                criteria: OwnershipCriteria::labels([(COMPONENT, "$(primary.name)")], ValidationType::Owner),
            }],
        },
    ]);
    Definition { root_type: cluster_type(), rules: Arc::new(rules), expression: DEFAULT_STATE_EXPRESSION.to_string(), locale: None }
}

fn context(store: &Arc<RevisionStore>) -> ViewContext {
    let registry = Arc::new(TypeRegistry::builtin().with(APPS, "Cluster", true).with(APPS, "Component", true));
    ViewContext::new(definition(), registry, Arc::clone(store))
}

fn owned(mut obj: DynamicObject, labels: &[(&str, &str)], owner: &DynamicObject) -> DynamicObject {
    obj.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>());
    let types = owner.types.clone().unwrap_or_default();
    obj.metadata.owner_references = Some(vec![OwnerReference {
        api_version: types.api_version,
        kind: types.kind,
        name: owner.metadata.name.clone().unwrap_or_default(),
        uid: owner.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        ..Default::default()
    }]);
    obj
}

/// Cluster at revision 1, component at 2, pods from 3.
fn seed(pods: usize) -> MemoryCluster {
    let cluster = MemoryCluster::new();
    let root = cluster
        .seed(new_object(&cluster_type(), Some("demo"), "mysql", json!({"spec": {"replicas": pods}, "status": {"phase": "Running"}})))
        .unwrap();
    let comp = cluster
        .seed(owned(new_object(&component_type(), Some("demo"), "mysql-mysql", json!({"spec": {}})), &[(INSTANCE, "mysql")], &root))
        .unwrap();
    for i in 0..pods {
        cluster
            .seed(owned(new_object(&pod_type(), Some("demo"), &format!("mysql-mysql-{i}"), json!({"spec": {}})), &[(COMPONENT, "mysql-mysql")], &comp))
            .unwrap();
    }
    cluster
}

fn view(spec: ReconciliationViewSpec) -> ReconciliationView {
    let mut v = ReconciliationView::new(
        "mysql-view",
        ReconciliationViewSpec { target_object: Some(TargetObject { namespace: None, name: "mysql".into() }), ..spec },
    );
    v.metadata.namespace = Some("demo".into());
    v
}

struct Harness {
    cluster: MemoryCluster,
    store: Arc<RevisionStore>,
    ctx: ViewContext,
    state: ViewState,
    view: ReconciliationView,
}

impl Harness {
    fn new(pods: usize, spec: ReconciliationViewSpec) -> Self {
        let store = Arc::new(RevisionStore::new());
        let ctx = context(&store);
        Self { cluster: seed(pods), store, ctx, state: ViewState::default(), view: view(spec) }
    }

    /// One status update; the result is written back the way the controller does.
    async fn observe(&mut self, events: &[DynamicObject]) -> ReconciliationViewStatus {
        let status = self
            .state
            .update_view_status(&self.view, &self.ctx, &self.cluster, events, &CancellationToken::new())
            .await
            .unwrap();
        self.view.status = Some(status.clone());
        status
    }

    async fn set_phase(&self, phase: &str) {
        self.cluster.patch(&root(), &json!({"status": {"phase": phase}})).await.unwrap();
    }
}

#[tokio::test]
async fn first_observation_is_the_baseline() {
    let mut h = Harness::new(2, ReconciliationViewSpec::default());
    let status = h.observe(&[]).await;

    assert!(status.current_state.changes.is_empty());
    assert!(status.current_state.summary.object_summaries.is_empty());
    assert_eq!(status.current_state.object_tree.as_ref().map(|t| t.len()), Some(4));
    assert_eq!(status.initial_object_tree, status.current_state.object_tree);
    assert!(status.dry_run_result.is_none());
    assert!(!h.store.is_empty());
}

#[tokio::test]
async fn later_observations_append_changes() {
    let mut h = Harness::new(1, ReconciliationViewSpec::default());
    h.observe(&[]).await;

    h.cluster.patch(&pod_ref(0), &json!({"metadata": {"annotations": {"restart": "1"}}})).await.unwrap();
    let status = h.observe(&[]).await;
    let changes = &status.current_state.changes;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::Update);
    assert_eq!(changes[0].object_reference.to_ref(), pod_ref(0));
    assert_eq!(changes[0].revision, 4);
    assert_eq!(changes[0].state, None);

    let summary = &status.current_state.summary.object_summaries;
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].object_type, pod_type());
    assert_eq!(summary[0].change_summary.as_ref().and_then(|c| c.updated), Some(1));

    // Nothing moved: nothing new is recorded.
    let again = h.observe(&[]).await;
    assert_eq!(again.current_state.changes.len(), 1);
}

#[tokio::test]
async fn root_changes_carry_their_evaluated_state() {
    let mut h = Harness::new(1, ReconciliationViewSpec::default());
    h.observe(&[]).await;
    h.set_phase("Updating").await;
    let status = h.observe(&[]).await;
    assert_eq!(status.current_state.changes.len(), 1);
    assert_eq!(status.current_state.changes[0].state, Some(false));
}

#[tokio::test]
async fn a_view_expression_overrides_the_definition() {
    let spec = ReconciliationViewSpec {
        state_evaluation_expression: Some(kview_controller::StateEvaluationExpression::new(r#"object.status.phase == "Updating""#)),
        ..Default::default()
    };
    let mut h = Harness::new(1, spec);
    h.observe(&[]).await;
    h.set_phase("Updating").await;
    let status = h.observe(&[]).await;
    assert_eq!(status.current_state.changes[0].state, Some(true));
}

#[tokio::test]
async fn a_settled_root_starts_a_new_cycle() {
    let mut h = Harness::new(1, ReconciliationViewSpec::default());
    h.observe(&[]).await;

    h.set_phase("Updating").await; // rv 4
    h.observe(&[]).await;
    h.cluster.patch(&pod_ref(0), &json!({"metadata": {"annotations": {"restart": "1"}}})).await.unwrap(); // rv 5
    let mid = h.observe(&[]).await;
    assert_eq!(mid.current_state.changes.iter().map(|c| c.revision).collect::<Vec<_>>(), vec![4, 5]);

    h.set_phase("Running").await; // rv 6
    let status = h.observe(&[]).await;

    let changes = &status.current_state.changes;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].object_reference.to_ref(), root());
    assert_eq!(changes[0].revision, 6);
    assert_eq!(changes[0].state, Some(true));

    // The unsettled root snapshot is gone; the pod revision still in the tree is kept.
    assert!(h.store.get(&root(), 4).unwrap_err().is_not_found());
    assert!(h.store.get(&pod_ref(0), 5).is_ok());

    let initial = status.initial_object_tree.expect("initial tree at the boundary");
    assert_eq!(initial.primary.resource_version, "6");
    assert!(status.current_state.summary.object_summaries.is_empty());
}

#[tokio::test]
async fn trees_in_status_respect_depth() {
    let spec = ReconciliationViewSpec { depth: Some(1), ..Default::default() };
    let mut h = Harness::new(2, spec);
    let status = h.observe(&[]).await;
    assert_eq!(status.current_state.object_tree.as_ref().map(|t| t.len()), Some(2));
    assert_eq!(status.initial_object_tree.as_ref().map(|t| t.len()), Some(2));

    // Change detection still sees the pods below the cut.
    h.cluster.delete(&pod_ref(1)).await.unwrap();
    let status = h.observe(&[]).await;
    assert_eq!(status.current_state.changes.len(), 1);
    assert_eq!(status.current_state.changes[0].change_type, ChangeType::Deletion);
}

#[tokio::test]
async fn a_failed_update_keeps_the_untruncated_trees() {
    let spec = ReconciliationViewSpec { depth: Some(1), ..Default::default() };
    let mut h = Harness::new(2, spec);
    h.observe(&[]).await;

    h.set_phase("Updating").await;
    let valid = h.view.spec.state_evaluation_expression.take();
    h.view.spec.state_evaluation_expression = Some(kview_controller::StateEvaluationExpression::new("object.status.phase =="));
    let failed = h.state.update_view_status(&h.view, &h.ctx, &h.cluster, &[], &CancellationToken::new()).await;
    assert!(failed.is_err());

    h.view.spec.state_evaluation_expression = valid;
    let status = h.observe(&[]).await;
    let changes = &status.current_state.changes;
    assert!(changes.iter().all(|c| c.change_type != ChangeType::Creation), "{changes:?}");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].object_reference.to_ref(), root());
    assert_eq!(changes[0].change_type, ChangeType::Update);
}

#[tokio::test]
async fn events_are_recorded_once() {
    let mut h = Harness::new(1, ReconciliationViewSpec::default());
    h.observe(&[]).await;

    let mut event = new_object(
        &ObjectType::event(),
        Some("demo"),
        "mysql.17a",
        json!({
            "involvedObject": {"apiVersion": APPS, "kind": "Cluster", "namespace": "demo", "name": "mysql"},
            "type": "Warning",
            "reason": "BackOff"
        }),
    );
    event.metadata.resource_version = Some("40".into());

    let status = h.observe(std::slice::from_ref(&event)).await;
    let status_again = h.observe(std::slice::from_ref(&event)).await;
    for s in [&status, &status_again] {
        assert_eq!(s.current_state.changes.len(), 1);
        let change = &s.current_state.changes[0];
        assert_eq!(change.change_type, ChangeType::Event);
        assert_eq!(change.object_reference.to_ref(), root());
        let attrs = change.event_attributes.as_ref().unwrap();
        assert_eq!((attrs.name.as_str(), attrs.reason.as_str()), ("mysql.17a", "BackOff"));
    }
}

#[tokio::test]
async fn a_missing_root_empties_the_current_tree() {
    let mut h = Harness::new(1, ReconciliationViewSpec::default());
    h.observe(&[]).await;
    h.cluster.delete(&root()).await.unwrap();
    let status = h.observe(&[]).await;
    assert!(status.current_state.object_tree.is_none());
    assert!(status.current_state.changes.iter().any(|c| c.change_type == ChangeType::Deletion && c.object_reference.to_ref() == root()));
}

/// Counts reconciles of the root; never changes anything.
struct Counting(Arc<AtomicUsize>);

#[async_trait]
impl Reconciler for Counting {
    fn object_type(&self) -> ObjectType {
        cluster_type()
    }

    async fn reconcile(&self, _client: &dyn ObjectClient, _key: &ObjectRef) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn dry_runs_rerun_only_when_their_inputs_move() {
    let runs = Arc::new(AtomicUsize::new(0));
    let spec = ReconciliationViewSpec { dry_run: Some(DryRun { desired_spec: "replicas: 3".into() }), ..Default::default() };
    let mut h = Harness::new(1, spec);
    h.ctx.reconcilers = Arc::new(ReconcilerSet::new().with(Arc::new(Counting(Arc::clone(&runs)))));

    let status = h.observe(&[]).await;
    let result = status.dry_run_result.as_ref().unwrap();
    assert_eq!(result.phase, DryRunPhase::Succeeded);
    assert_eq!(result.observed_target_generation, 1);
    assert!(result.spec_diff.contains("replicas"));
    assert_eq!(status.desired_state.as_ref(), Some(&result.plan));
    let after_first = runs.load(Ordering::SeqCst);
    assert!(after_first > 0);

    // Same desired spec, same root generation.
    h.cluster.patch(&pod_ref(0), &json!({"metadata": {"annotations": {"restart": "1"}}})).await.unwrap();
    let status = h.observe(&[]).await;
    assert_eq!(runs.load(Ordering::SeqCst), after_first);
    assert!(status.dry_run_result.is_some());

    h.view.spec.dry_run = Some(DryRun { desired_spec: "replicas: 4".into() });
    h.observe(&[]).await;
    assert!(runs.load(Ordering::SeqCst) > after_first);

    h.view.spec.dry_run = None;
    let status = h.observe(&[]).await;
    assert!(status.dry_run_result.is_none());
    assert!(status.desired_state.is_none());
}

#[tokio::test]
async fn an_unparsable_desired_spec_is_a_failed_dry_run() {
    let spec = ReconciliationViewSpec { dry_run: Some(DryRun { desired_spec: "replicas: [".into() }), ..Default::default() };
    let mut h = Harness::new(1, spec);
    let status = h.observe(&[]).await;
    let result = status.dry_run_result.unwrap();
    assert_eq!(result.phase, DryRunPhase::Failed);
    assert_eq!(result.reason.as_deref(), Some(REASON_INVALID_DESIRED_SPEC));
    assert!(status.desired_state.is_none());
}
