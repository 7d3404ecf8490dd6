#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kview_core::object::new_object;
use kview_core::{Error, MemoryCluster, ObjectReader, ObjectRef, ObjectType, TypeRegistry};
use kview_ownership::{
    default_rules, objects_from_tree, OwnedResource, OwnershipCriteria, OwnershipRule, OwnershipRules, RevisionSource, RootFinder,
    TreeBuilder, TreeConfig, ValidationType,
};
use kview_store::RevisionStore;
use serde_json::json;

const APPS: &str = "apps.kubeblocks.io/v1";
const WORKLOADS: &str = "workloads.kubeblocks.io/v1";

fn registry() -> TypeRegistry {
    TypeRegistry::builtin()
        .with(APPS, "Cluster", true)
        .with(APPS, "Component", true)
        .with(WORKLOADS, "InstanceSet", true)
}

fn owner(api_version: &str, kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.into(),
        kind: kind.into(),
        name: name.into(),
        uid: uid.into(),
        controller: Some(true),
        ..Default::default()
    }
}

fn obj(
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
    uid: &str,
    labels: &[(&str, &str)],
    owners: Vec<OwnerReference>,
    data: serde_json::Value,
) -> DynamicObject {
    let mut o = new_object(&ObjectType::new(api_version, kind), namespace, name, data);
    o.metadata.uid = Some(uid.into());
    o.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    o.metadata.owner_references = Some(owners);
    o
}

const KB: [(&str, &str); 2] = [("app.kubernetes.io/instance", "mysql"), ("app.kubernetes.io/managed-by", "kubeblocks")];

/// Cluster mysql → Component mysql-mysql → InstanceSet → 2 Pods, a PVC owned by both the
/// component and the instance set, bound to a PersistentVolume.
fn seed(cluster: &MemoryCluster) -> DynamicObject {
    let root = cluster
        .seed(obj(APPS, "Cluster", Some("demo"), "mysql", "c-uid", &[], vec![], json!({"spec": {"replicas": 2}})))
        .unwrap();
    cluster
        .seed(obj(APPS, "Component", Some("demo"), "mysql-mysql", "comp-uid", &KB, vec![owner(APPS, "Cluster", "mysql", "c-uid")], json!({})))
        .unwrap();
    let its_labels = [
        ("workloads.kubeblocks.io/managed-by", "InstanceSet"),
        ("workloads.kubeblocks.io/instance", "mysql-mysql"),
    ];
    let mut its_and_kb: Vec<(&str, &str)> = KB.to_vec();
    its_and_kb.extend(its_labels);
    cluster
        .seed(obj(WORKLOADS, "InstanceSet", Some("demo"), "mysql-mysql", "its-uid", &KB, vec![owner(APPS, "Component", "mysql-mysql", "comp-uid")], json!({})))
        .unwrap();
    for i in 0..2 {
        cluster
            .seed(obj(
                "v1",
                "Pod",
                Some("demo"),
                &format!("mysql-mysql-{i}"),
                &format!("pod-{i}"),
                &its_labels,
                vec![owner(WORKLOADS, "InstanceSet", "mysql-mysql", "its-uid")],
                json!({"status": {"phase": "Running"}}),
            ))
            .unwrap();
    }
    cluster
        .seed(obj(
            "v1",
            "PersistentVolumeClaim",
            Some("demo"),
            "data-mysql-mysql-0",
            "pvc-uid",
            &its_and_kb,
            vec![owner(APPS, "Component", "mysql-mysql", "comp-uid"), owner(WORKLOADS, "InstanceSet", "mysql-mysql", "its-uid")],
            json!({"spec": {"volumeName": "pv-0"}}),
        ))
        .unwrap();
    cluster
        .seed(obj("v1", "PersistentVolume", None, "pv-0", "pv-uid", &[], vec![], json!({"spec": {"claimRef": {"namespace": "demo", "name": "data-mysql-mysql-0"}}})))
        .unwrap();
    // Unrelated pod in the same namespace: matching labels but no owner reference.
    cluster
        .seed(obj("v1", "Pod", Some("demo"), "stray", "stray-uid", &its_labels, vec![], json!({})))
        .unwrap();
    root
}

#[tokio::test]
async fn builds_tree_without_revisiting_shared_objects() {
    let cluster = MemoryCluster::new();
    let root = seed(&cluster);
    let rules = default_rules();
    let reg = registry();
    let built = TreeBuilder::new(&rules, &reg, TreeConfig::default()).build(&root, &cluster).await.unwrap();

    let refs = built.tree.references();
    let unique: HashSet<_> = refs.iter().map(|r| (r.kind.clone(), r.namespace.clone(), r.name.clone())).collect();
    assert_eq!(unique.len(), refs.len(), "no object appears twice");
    assert_eq!(built.tree.len(), 7, "cluster, component, its, 2 pods, pvc, pv");
    assert_eq!(built.objects.len(), 7);
    assert!(!unique.iter().any(|(_, _, name)| name == "stray"));

    let component = &built.tree.secondaries[0];
    assert_eq!(component.primary.kind, "Component");
    // The PVC was reached first through the component, so it hangs there with its volume.
    let kinds: Vec<_> = component.secondaries.iter().map(|n| n.primary.kind.as_str()).collect();
    assert_eq!(kinds, vec!["InstanceSet", "PersistentVolumeClaim"]);
    assert_eq!(component.secondaries[1].secondaries[0].primary.name, "pv-0");
}

#[tokio::test]
async fn depth_guard_stops_expansion() {
    let cluster = MemoryCluster::new();
    let root = seed(&cluster);
    let rules = default_rules();
    let reg = registry();
    let built = TreeBuilder::new(&rules, &reg, TreeConfig { max_depth: 1 }).build(&root, &cluster).await.unwrap();
    assert_eq!(built.tree.len(), 2);
}

#[tokio::test]
async fn terminates_on_self_referencing_data() {
    // Label-only rules where a ConfigMap "owns" ConfigMaps: the rule set is cyclic,
    // but the visited set still bounds the traversal.
    let cm = ObjectType::new("v1", "ConfigMap");
    let rules = OwnershipRules::new(vec![OwnershipRule {
        primary: cm.clone(),
        owned_resources: vec![OwnedResource { secondary: cm.clone(), criteria: OwnershipCriteria::labels([("app", "x")], ValidationType::None) }],
    }]);
    assert!(rules.validate().is_err());
    let cluster = MemoryCluster::new();
    let root = cluster.seed(obj("v1", "ConfigMap", Some("demo"), "a", "a", &[("app", "x")], vec![], json!({}))).unwrap();
    for n in ["b", "c"] {
        cluster.seed(obj("v1", "ConfigMap", Some("demo"), n, n, &[("app", "x")], vec![], json!({}))).unwrap();
    }
    let reg = registry();
    let built = TreeBuilder::new(&rules, &reg, TreeConfig { max_depth: 0 }).build(&root, &cluster).await.unwrap();
    assert_eq!(built.tree.len(), 3);
}

#[tokio::test]
async fn tree_at_revision_and_placeholder_fallback() {
    let store = RevisionStore::new();
    let cluster = MemoryCluster::new();
    let root = seed(&cluster);
    let rules = default_rules();
    let reg = registry();
    let live = TreeBuilder::new(&rules, &reg, TreeConfig::default()).build(&root, &cluster).await.unwrap();
    for o in live.objects.values() {
        store.insert(o, "demo/view").unwrap();
    }
    let root_rev = kview_core::object::revision_of(&root);
    assert_eq!(root_rev, 1);
    let at_root = TreeBuilder::new(&rules, &reg, TreeConfig::default())
        .build(&root, &RevisionSource::new(&store, root_rev))
        .await
        .unwrap();
    assert_eq!(at_root.tree.len(), 1, "nothing else existed yet at the root's revision");

    let restored = objects_from_tree(&live.tree, &store).unwrap();
    assert_eq!(restored.len(), live.objects.len());

    store.release_owner("demo/view");
    let restored = objects_from_tree(&live.tree, &store).unwrap();
    let pod = restored.values().find(|o| o.metadata.name.as_deref() == Some("mysql-mysql-0")).unwrap();
    assert!(pod.data.get("status").is_none(), "placeholder carries identity only");
    assert_eq!(pod.metadata.uid.as_deref(), Some("pod-0"));
}

#[tokio::test]
async fn root_finder_walks_back_to_cluster() {
    let cluster = MemoryCluster::new();
    seed(&cluster);
    let rules = default_rules();
    let reg = registry();
    let roots: BTreeSet<_> = [ObjectType::new(APPS, "Cluster")].into();
    let finder = RootFinder::new(&rules, &reg, &roots, TreeConfig::default());
    let expected = vec![ObjectRef::new(ObjectType::new(APPS, "Cluster"), Some("demo"), "mysql")];

    let pv = cluster.get(&ObjectRef::new(ObjectType::new("v1", "PersistentVolume"), None, "pv-0"))
        .await
        .unwrap();
    assert_eq!(finder.find_roots(&pv, &cluster).await.unwrap(), expected);

    let event = new_object(&ObjectType::event(), Some("demo"), "mysql-mysql-0.1", json!({
        "reason": "Started",
        "involvedObject": {"apiVersion": "v1", "kind": "Pod", "namespace": "demo", "name": "mysql-mysql-0"}
    }));
    assert_eq!(finder.find_roots(&event, &cluster).await.unwrap(), expected);

    let stray = cluster.get(&ObjectRef::new(ObjectType::new("v1", "Pod"), Some("demo"), "stray"))
        .await
        .unwrap();
    assert!(finder.find_roots(&stray, &cluster).await.unwrap().is_empty());

    let node = new_object(&ObjectType::new("v1", "Node"), None, "n1", json!({}));
    assert!(matches!(finder.find_roots(&node, &cluster).await, Err(Error::ReferenceIntegrity(_))));
}
