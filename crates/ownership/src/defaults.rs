//! Built-in rule set for database clusters.

use kview_core::ObjectType;

use crate::rules::{OwnedResource, OwnershipCriteria, OwnershipRule, OwnershipRules, ValidationType};

pub const DEFAULT_STATE_EXPRESSION: &str = r#"has(object.status.phase) && object.status.phase == "Running""#;

const INSTANCE: &str = "app.kubernetes.io/instance";
const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const WORKLOAD_MANAGED_BY: &str = "workloads.kubeblocks.io/managed-by";
const WORKLOAD_INSTANCE: &str = "workloads.kubeblocks.io/instance";

pub const APPS: &str = "apps.kubeblocks.io/v1";
pub const CONFIG: &str = "apps.kubeblocks.io/v1alpha1";
pub const WORKLOADS: &str = "workloads.kubeblocks.io/v1";
pub const DATA_PROTECTION: &str = "dataprotection.kubeblocks.io/v1alpha1";

pub fn cluster_type() -> ObjectType {
    ObjectType::new(APPS, "Cluster")
}

fn rule(primary: (&str, &str), criteria: &OwnershipCriteria, secondaries: &[(&str, &str)]) -> OwnershipRule {
    OwnershipRule {
        primary: ObjectType::new(primary.0, primary.1),
        owned_resources: secondaries
            .iter()
            .map(|(v, k)| OwnedResource { secondary: ObjectType::new(*v, *k), criteria: criteria.clone() })
            .collect(),
    }
}

/// Cluster → Component → InstanceSet → Pod, plus services, secrets, storage,
/// RBAC, jobs and data-protection objects along the way.
pub fn default_rules() -> OwnershipRules {
    let cluster = OwnershipCriteria::labels([(INSTANCE, "$(primary.name)"), (MANAGED_BY, "kubeblocks")], ValidationType::Owner);
    let component = OwnershipCriteria::labels([(INSTANCE, "$(primary)"), (MANAGED_BY, "kubeblocks")], ValidationType::Owner);
    let instance_set =
        OwnershipCriteria::labels([(WORKLOAD_MANAGED_BY, "InstanceSet"), (WORKLOAD_INSTANCE, "$(primary.name)")], ValidationType::Owner);
    let data_protection =
        OwnershipCriteria::labels([(INSTANCE, "$(primary)"), (MANAGED_BY, "kubeblocks-dataprotection")], ValidationType::Owner);
    let claim = OwnershipCriteria::specified_name("spec.volumeName", ValidationType::None);

    OwnershipRules::new(vec![
        rule((APPS, "Cluster"), &cluster, &[(APPS, "Component"), ("v1", "Service"), ("v1", "Secret")]),
        rule(
            (APPS, "Component"),
            &component,
            &[
                (WORKLOADS, "InstanceSet"),
                ("v1", "Service"),
                ("v1", "Secret"),
                ("v1", "ConfigMap"),
                ("v1", "PersistentVolumeClaim"),
                ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
                ("rbac.authorization.k8s.io/v1", "RoleBinding"),
                ("v1", "ServiceAccount"),
                ("batch/v1", "Job"),
                (DATA_PROTECTION, "Backup"),
                (DATA_PROTECTION, "Restore"),
                (CONFIG, "Configuration"),
            ],
        ),
        rule(
            (WORKLOADS, "InstanceSet"),
            &instance_set,
            &[("v1", "Pod"), ("v1", "Service"), ("v1", "PersistentVolumeClaim"), ("v1", "ConfigMap")],
        ),
        rule((CONFIG, "Configuration"), &component, &[("v1", "ConfigMap")]),
        rule(
            (DATA_PROTECTION, "Backup"),
            &data_protection,
            &[
                ("batch/v1", "Job"),
                ("apps/v1", "StatefulSet"),
                ("snapshot.storage.k8s.io/v1", "VolumeSnapshot"),
                ("snapshot.storage.k8s.io/v1beta1", "VolumeSnapshot"),
            ],
        ),
        rule((DATA_PROTECTION, "Restore"), &data_protection, &[("batch/v1", "Job")]),
        rule(("v1", "PersistentVolumeClaim"), &claim, &[("v1", "PersistentVolume")]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_are_acyclic_and_rooted_at_cluster() {
        let rules = default_rules();
        rules.validate().unwrap();
        let reachable = rules.reachable_from(&cluster_type());
        assert!(reachable.contains(&ObjectType::new("v1", "PersistentVolume")));
        assert!(reachable.contains(&ObjectType::new("v1", "Pod")));
        assert_eq!(reachable, rules.types());
    }
}
