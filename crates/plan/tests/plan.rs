#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kview_core::object::new_object;
use kview_core::{
    ChangeType, DryRunPhase, Error, ListQuery, MemoryCluster, ObjectClient, ObjectReader, ObjectRef, ObjectType, TypeRegistry,
};
use kview_ownership::{OwnedResource, OwnershipCriteria, OwnershipRule, OwnershipRules, ValidationType};
use kview_plan::{PlanConfig, PlanGenerator, Reconciler, ReconcilerSet};
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

fn registry() -> Arc<TypeRegistry> {
    Arc::new(TypeRegistry::builtin().with(APPS, "Cluster", true).with(APPS, "Component", true))
}

fn rules() -> Arc<OwnershipRules> {
    Arc::new(OwnershipRules::new(vec![
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
    ]))
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

/// Keeps one component per cluster at the cluster's replica count.
struct ClusterLogic;

#[async_trait]
impl Reconciler for ClusterLogic {
    fn object_type(&self) -> ObjectType {
        cluster_type()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, key: &ObjectRef) -> anyhow::Result<()> {
        let cluster = client.get(key).await?;
        let replicas = cluster.data["spec"]["replicas"].as_i64().unwrap_or(1);
        let name = format!("{}-mysql", key.name);
        let comp_key = ObjectRef::new(component_type(), key.namespace.as_deref(), name.clone());
        match client.get_opt(&comp_key).await? {
            None => {
                let comp = new_object(&component_type(), key.namespace.as_deref(), &name, json!({"spec": {"replicas": replicas}}));
                client.create(owned(comp, &[(INSTANCE, key.name.as_str())], &cluster)).await?;
            }
            Some(comp) if comp.data["spec"]["replicas"].as_i64() != Some(replicas) => {
                client.patch(&comp_key, &json!({"spec": {"replicas": replicas}})).await?;
            }
            Some(_) => {}
        }
        Ok(())
    }
}

/// Scales pods named `<component>-<i>` to the component's replica count.
struct ComponentLogic;

#[async_trait]
impl Reconciler for ComponentLogic {
    fn object_type(&self) -> ObjectType {
        component_type()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, key: &ObjectRef) -> anyhow::Result<()> {
        let comp = client.get(key).await?;
        let replicas = comp.data["spec"]["replicas"].as_i64().unwrap_or(0);
        let query = ListQuery::in_namespace(key.namespace.as_deref()).with_labels([(COMPONENT.to_string(), key.name.clone())].into());
        let pods = client.list(&pod_type(), &query).await?;
        for i in 0..replicas {
            let name = format!("{}-{i}", key.name);
            if !pods.iter().any(|p| p.metadata.name.as_deref() == Some(name.as_str())) {
                let pod = new_object(&pod_type(), key.namespace.as_deref(), &name, json!({"spec": {}}));
                client.create(owned(pod, &[(COMPONENT, key.name.as_str())], &comp)).await?;
            }
        }
        for pod in pods {
            let index = pod.metadata.name.as_deref().and_then(|n| n.rsplit('-').next()).and_then(|i| i.parse::<i64>().ok());
            if index.is_some_and(|i| i >= replicas) {
                client.delete(&ObjectRef::of(&pod)?).await?;
            }
        }
        Ok(())
    }
}

/// Produces a new change on every call.
struct Restless {
    pause: Duration,
}

#[async_trait]
impl Reconciler for Restless {
    fn object_type(&self) -> ObjectType {
        cluster_type()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, key: &ObjectRef) -> anyhow::Result<()> {
        tokio::time::sleep(self.pause).await;
        let cluster = client.get(key).await?;
        let tick = cluster.metadata.annotations.as_ref().and_then(|a| a.get("tick")).and_then(|t| t.parse::<u64>().ok()).unwrap_or(0);
        client.patch(key, &json!({"metadata": {"annotations": {"tick": (tick + 1).to_string()}}})).await?;
        Ok(())
    }
}

struct Hanging;

#[async_trait]
impl Reconciler for Hanging {
    fn object_type(&self) -> ObjectType {
        cluster_type()
    }

    async fn reconcile(&self, _client: &dyn ObjectClient, _key: &ObjectRef) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct Rejecting;

#[async_trait]
impl Reconciler for Rejecting {
    fn object_type(&self) -> ObjectType {
        component_type()
    }

    async fn reconcile(&self, _client: &dyn ObjectClient, _key: &ObjectRef) -> anyhow::Result<()> {
        anyhow::bail!("component spec rejected: replicas out of range")
    }
}

/// A converged cluster with two replicas.
fn seed() -> MemoryCluster {
    let cluster = MemoryCluster::new();
    let root = cluster
        .seed(new_object(&cluster_type(), Some("demo"), "mysql", json!({"spec": {"replicas": 2}, "status": {"phase": "Running"}})))
        .unwrap();
    let comp = cluster
        .seed(owned(
            new_object(&component_type(), Some("demo"), "mysql-mysql", json!({"spec": {"replicas": 2}})),
            &[(INSTANCE, "mysql")],
            &root,
        ))
        .unwrap();
    for i in 0..2 {
        cluster
            .seed(owned(new_object(&pod_type(), Some("demo"), &format!("mysql-mysql-{i}"), json!({"spec": {}})), &[(COMPONENT, "mysql-mysql")], &comp))
            .unwrap();
    }
    cluster
}

fn generator(reconcilers: ReconcilerSet) -> PlanGenerator {
    PlanGenerator::new(rules(), registry(), Arc::new(reconcilers))
}

fn controllers() -> ReconcilerSet {
    ReconcilerSet::new().with(Arc::new(ClusterLogic)).with(Arc::new(ComponentLogic))
}

#[tokio::test]
async fn scale_out_plan_lists_every_simulated_change() {
    let cluster = seed();
    let out = generator(controllers()).generate(&root(), "replicas: 3\n", &cluster, &CancellationToken::new()).await.unwrap();

    assert_eq!(out.phase, DryRunPhase::Succeeded, "{:?}", out.message);
    assert_eq!(out.observed_target_generation, 1);
    assert!(out.spec_diff.contains("+   replicas: 3,"), "{}", out.spec_diff);

    let changes: Vec<_> = out.plan.changes.iter().map(|c| (c.object_reference.kind.as_str(), c.change_type)).collect();
    assert_eq!(
        changes,
        vec![("Cluster", ChangeType::Update), ("Component", ChangeType::Update), ("Pod", ChangeType::Creation)]
    );
    assert_eq!(out.plan.changes[2].object_reference.name, "mysql-mysql-2");

    let summaries = &out.plan.summary.object_summaries;
    let kinds: Vec<_> = summaries.iter().map(|s| s.object_type.kind.as_str()).collect();
    assert_eq!(kinds, vec!["Cluster", "Component", "Pod"]);
    let pods = &summaries[2];
    assert_eq!(pods.total, 3);
    assert_eq!(pods.change_summary.as_ref().unwrap().added, Some(1));

    let tree = out.plan.object_tree.expect("tree of the simulated state");
    assert_eq!(tree.len(), 5);
    assert_eq!(tree.secondaries[0].secondaries.len(), 3);
}

#[tokio::test]
async fn scale_in_plan_records_deletions() {
    let cluster = seed();
    let out = generator(controllers()).generate(&root(), "replicas: 1", &cluster, &CancellationToken::new()).await.unwrap();
    assert!(out.succeeded());
    let deleted: Vec<_> = out
        .plan
        .changes
        .iter()
        .filter(|c| c.change_type == ChangeType::Deletion)
        .map(|c| c.object_reference.name.as_str())
        .collect();
    assert_eq!(deleted, vec!["mysql-mysql-1"]);
    let pods = out.plan.summary.object_summaries.iter().find(|s| s.object_type == pod_type()).unwrap();
    assert_eq!(pods.change_summary.as_ref().unwrap().deleted, Some(1));
    assert_eq!(pods.total, 1);
}

#[tokio::test]
async fn no_op_spec_converges_with_empty_summary() {
    let cluster = seed();
    let config = PlanConfig::default();
    let t0 = Instant::now();
    let out = generator(controllers()).generate(&root(), "replicas: 2", &cluster, &CancellationToken::new()).await.unwrap();
    assert!(out.succeeded());
    assert!(t0.elapsed() < config.timeout);
    assert!(out.plan.changes.is_empty());
    assert!(out.plan.summary.object_summaries.is_empty());
    assert!(out.spec_diff.is_empty());
    assert_eq!(out.plan.object_tree.map(|t| t.len()), Some(4));
}

#[tokio::test]
async fn restless_logic_times_out() {
    let cluster = seed();
    let config = PlanConfig { timeout: Duration::from_millis(150), max_passes: usize::MAX };
    let t0 = Instant::now();
    let out = generator(ReconcilerSet::new().with(Arc::new(Restless { pause: Duration::from_millis(5) })))
        .with_config(config)
        .generate(&root(), "replicas: 3", &cluster, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.phase, DryRunPhase::Failed);
    assert_eq!(out.reason.as_deref(), Some("Timeout"));
    assert!(t0.elapsed() < Duration::from_secs(2));
    assert!(out.plan.changes.len() > 1, "partial plan is kept");
}

#[tokio::test]
async fn pass_cap_counts_as_timeout() {
    let cluster = seed();
    let out = generator(ReconcilerSet::new().with(Arc::new(Restless { pause: Duration::ZERO })))
        .with_config(PlanConfig { timeout: Duration::from_secs(30), max_passes: 3 })
        .generate(&root(), "replicas: 3", &cluster, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.reason.as_deref(), Some("Timeout"));
    assert!(out.message.unwrap().contains("3 passes"));
}

#[tokio::test]
async fn hanging_logic_is_cut_off_by_the_budget() {
    let cluster = seed();
    let t0 = Instant::now();
    let out = generator(ReconcilerSet::new().with(Arc::new(Hanging)))
        .with_config(PlanConfig { timeout: Duration::from_millis(100), max_passes: 64 })
        .generate(&root(), "replicas: 3", &cluster, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.reason.as_deref(), Some("Timeout"));
    assert!(t0.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn reconcile_error_fails_the_plan() {
    let cluster = seed();
    let out = generator(ReconcilerSet::new().with(Arc::new(ClusterLogic)).with(Arc::new(Rejecting)))
        .generate(&root(), "replicas: 3", &cluster, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.phase, DryRunPhase::Failed);
    assert_eq!(out.reason.as_deref(), Some("ReconcileError"));
    assert!(out.message.unwrap().contains("replicas out of range"));
}

#[tokio::test]
async fn simulation_never_reaches_the_real_cluster() {
    let cluster = seed();
    let before = cluster.current_revision();
    let len = cluster.len();
    generator(controllers()).generate(&root(), "replicas: 5", &cluster, &CancellationToken::new()).await.unwrap();

    assert_eq!(cluster.current_revision(), before);
    assert_eq!(cluster.len(), len);
    let live = cluster.get(&root()).await.unwrap();
    assert_eq!(live.data["spec"]["replicas"], 2);
    let missing = ObjectRef::new(pod_type(), Some("demo"), "mysql-mysql-4");
    assert!(cluster.get_opt(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn change_log_is_ordered_by_revision() {
    let cluster = seed();
    let out = generator(controllers()).generate(&root(), "replicas: 4", &cluster, &CancellationToken::new()).await.unwrap();
    let revisions: Vec<_> = out.plan.changes.iter().map(|c| c.revision).collect();
    assert!(revisions.len() >= 4);
    assert!(revisions.windows(2).all(|w| w[0] < w[1]), "{revisions:?}");
    // Simulated revisions continue after everything that was loaded.
    assert!(revisions[0] > cluster.current_revision());
    for change in &out.plan.changes {
        if change.change_type != ChangeType::Deletion {
            assert_eq!(change.object_reference.revision(), change.revision);
        }
    }
}

#[tokio::test]
async fn cancellation_aborts_promptly() {
    let cluster = seed();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = generator(controllers()).generate(&root(), "replicas: 3", &cluster, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let t0 = Instant::now();
    let err = generator(ReconcilerSet::new().with(Arc::new(Hanging)))
        .with_config(PlanConfig { timeout: Duration::from_secs(30), max_passes: 64 })
        .generate(&root(), "replicas: 3", &cluster, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(t0.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn setup_failures_are_hard_errors() {
    let cluster = seed();
    let gen = generator(controllers());
    assert!(matches!(
        gen.generate(&root(), "replicas: [", &cluster, &CancellationToken::new()).await,
        Err(Error::InvalidPatch(_))
    ));
    let missing = ObjectRef::new(cluster_type(), Some("demo"), "nope");
    assert!(gen.generate(&missing, "replicas: 3", &cluster, &CancellationToken::new()).await.unwrap_err().is_not_found());
    cluster.set_fail_reads(true);
    assert!(matches!(
        gen.generate(&root(), "replicas: 3", &cluster, &CancellationToken::new()).await,
        Err(Error::Cluster(_))
    ));
}
