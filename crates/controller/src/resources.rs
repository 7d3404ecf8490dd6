//! Custom resources: `ReconciliationView` (one per tracked root) and
//! `ViewDefinition` (rules shared by every view of one root type).

use std::sync::Arc;

use kube::{CustomResource, ResourceExt};
use kview_core::{DryRunResult, Error, ObjectRef, ObjectTreeNode, ObjectType, ReconciliationCycleState, Result, TypeRegistry};
use kview_ownership::defaults::cluster_type;
use kview_ownership::{default_rules, OwnershipRule, OwnershipRules, DEFAULT_STATE_EXPRESSION};
use kview_store::LocaleResources;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "view.kview.io";
pub const VERSION: &str = "v1";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "view.kview.io",
    version = "v1",
    kind = "ReconciliationView",
    namespaced,
    status = "ReconciliationViewStatus",
    schema = "disabled",
    shortname = "rview"
)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationViewSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_object: Option<TargetObject>,
    /// `ViewDefinition` supplying rules and the default expression; the built-in
    /// database cluster definition when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<DryRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_evaluation_expression: Option<StateEvaluationExpression>,
    /// Levels of the trees written into status; 0 or unset keeps all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

/// Root of a view. The namespace defaults to the view's own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRun {
    /// YAML merged into the root's `spec`.
    pub desired_spec: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvaluationExpression {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cel_expression: Option<CelExpression>,
}

impl StateEvaluationExpression {
    pub fn new(expression: impl Into<String>) -> Self {
        Self { cel_expression: Some(CelExpression { expression: expression.into() }) }
    }

    pub fn expression(&self) -> Option<&str> {
        self.cel_expression.as_ref().map(|c| c.expression.as_str()).filter(|e| !e.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CelExpression {
    pub expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationViewStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_result: Option<DryRunResult>,
    /// Tree at the start of the current reconciliation cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_object_tree: Option<ObjectTreeNode>,
    #[serde(default)]
    pub current_state: ReconciliationCycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<ReconciliationCycleState>,
}

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(group = "view.kview.io", version = "v1", kind = "ViewDefinition", schema = "disabled", shortname = "viewdef")]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinitionSpec {
    pub root_type: ObjectType,
    pub ownership_rules: Vec<OwnershipRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_evaluation_expression: Option<StateEvaluationExpression>,
    /// ConfigMap mapping locales to change description formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale_resource: Option<ConfigMapRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapRef {
    pub namespace: String,
    pub name: String,
}

impl ConfigMapRef {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(ObjectType::new("v1", "ConfigMap"), Some(&self.namespace), self.name.clone())
    }
}

/// A validated definition ready for tree building and evaluation.
#[derive(Debug, Clone)]
pub struct Definition {
    pub root_type: ObjectType,
    pub rules: Arc<OwnershipRules>,
    pub expression: String,
    pub locale: Option<Arc<LocaleResources>>,
}

impl Definition {
    /// Database cluster rules with the default state expression.
    pub fn builtin() -> Self {
        Self {
            root_type: cluster_type(),
            rules: Arc::new(default_rules()),
            expression: DEFAULT_STATE_EXPRESSION.to_string(),
            locale: None,
        }
    }

    /// Validate a `ViewDefinition`, dropping rules for types the cluster does not serve.
    pub fn from_resource(def: &ViewDefinition, registry: &TypeRegistry, locale: Option<Arc<LocaleResources>>) -> Result<Self> {
        let rules = OwnershipRules::new(def.spec.ownership_rules.clone());
        rules.validate()?;
        let rules = if registry.is_empty() { rules } else { rules.filter_unsupported(registry) };
        let expression = def
            .spec
            .state_evaluation_expression
            .as_ref()
            .and_then(|e| e.expression())
            .unwrap_or(DEFAULT_STATE_EXPRESSION)
            .to_string();
        Ok(Self { root_type: def.spec.root_type.clone(), rules: Arc::new(rules), expression, locale })
    }
}

/// `namespace/name` of a view; also its owner id in the revision store.
pub fn view_key(view: &ReconciliationView) -> String {
    format!("{}/{}", view.namespace().unwrap_or_default(), view.name_any())
}

/// The root a view tracks under `definition`.
pub fn target_ref(view: &ReconciliationView, definition: &Definition) -> Result<ObjectRef> {
    let target = view
        .spec
        .target_object
        .as_ref()
        .filter(|t| !t.name.is_empty())
        .ok_or_else(|| Error::Config(format!("view {} has no spec.targetObject", view_key(view))))?;
    let namespace = target.namespace.clone().or_else(|| view.namespace());
    Ok(ObjectRef::new(definition.root_type.clone(), namespace.as_deref(), target.name.clone()))
}
