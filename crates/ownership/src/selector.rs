//! Turning an ownership criteria plus a concrete primary into a secondary query.

use kube::core::DynamicObject;
use kview_core::object::{is_owned_by, to_value};
use kview_core::selector::{field, field_labels, field_string, Labels};
use kview_core::{Error, ListQuery, ObjectType, Result, TypeRegistry};

use crate::rules::{BuiltinRelationship, OwnershipCriteria, ValidationType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerMatch {
    pub uid: String,
    pub controller: bool,
}

/// A materialized secondary lookup: server-side list filter plus client-side checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryQuery {
    pub list: ListQuery,
    pub name: Option<String>,
    pub owner: Option<OwnerMatch>,
    pub builtin: Option<(BuiltinRelationship, String, String)>,
}

impl SecondaryQuery {
    pub fn accepts(&self, candidate: &DynamicObject) -> bool {
        if !self.list.matches(candidate) {
            return false;
        }
        if let Some(name) = &self.name {
            if candidate.metadata.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if !is_owned_by(candidate, &owner.uid, owner.controller) {
                return false;
            }
        }
        if let Some((BuiltinRelationship::VolumeToClaim, ns, name)) = &self.builtin {
            let claim_ns = candidate.metadata.namespace.as_deref().unwrap_or("");
            if claim_ns != ns || candidate.metadata.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        true
    }
}

fn substitute(template: &str, key: &str, primary: &DynamicObject) -> String {
    let name = primary.metadata.name.as_deref().unwrap_or("");
    let namespace = primary.metadata.namespace.as_deref().unwrap_or("");
    let same_key = primary.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str).unwrap_or("");
    template
        .replace("$(primary.name)", name)
        .replace("$(primary.namespace)", namespace)
        .replace("$(primary)", same_key)
}

/// Build the query that finds `secondary` objects owned by `primary` under `criteria`.
///
/// Returns `Ok(None)` when the primary names no secondary at all (e.g. an unbound
/// claim with no `spec.volumeName`).
pub fn materialize(
    primary: &DynamicObject,
    secondary: &ObjectType,
    criteria: &OwnershipCriteria,
    registry: &TypeRegistry,
) -> Result<Option<SecondaryQuery>> {
    let namespace = if registry.is_namespaced(secondary) { primary.metadata.namespace.as_deref() } else { None };
    let mut query = SecondaryQuery { list: ListQuery::in_namespace(namespace), name: None, owner: None, builtin: None };

    if let Some(path) = &criteria.selector_criteria {
        let raw = to_value(primary)?;
        let node = field(&raw, &path.path)
            .ok_or_else(|| Error::SelectorResolution(format!("selector path {:?} not found on primary", path.path)))?;
        let labels = field_labels(node, "matchLabels")
            .or_else(|| field_labels(node, ""))
            .ok_or_else(|| Error::SelectorResolution(format!("selector path {:?} is not a label map", path.path)))?;
        query.list.labels = labels;
    }
    if let Some(template) = &criteria.label_criteria {
        let labels: Labels = template.iter().map(|(k, v)| (k.clone(), substitute(v, k, primary))).collect();
        query.list.labels = labels;
    }
    if let Some(path) = &criteria.specified_name_criteria {
        let raw = to_value(primary)?;
        match field_string(&raw, &path.path) {
            Some(name) if !name.is_empty() => query.name = Some(name),
            _ => return Ok(None),
        }
    }
    match criteria.builtin {
        Some(BuiltinRelationship::ClaimToVolume) => {
            let raw = to_value(primary)?;
            match field_string(&raw, "spec.volumeName") {
                Some(name) if !name.is_empty() => query.name = Some(name),
                _ => return Ok(None),
            }
        }
        Some(BuiltinRelationship::VolumeToClaim) => {
            let raw = to_value(primary)?;
            let ns = field_string(&raw, "spec.claimRef.namespace");
            let name = field_string(&raw, "spec.claimRef.name");
            match (ns, name) {
                (Some(ns), Some(name)) => {
                    query.list = ListQuery::in_namespace(Some(&ns));
                    query.builtin = Some((BuiltinRelationship::VolumeToClaim, ns, name));
                }
                _ => return Ok(None),
            }
        }
        None => {}
    }
    if criteria.validation != ValidationType::None {
        let uid = primary
            .metadata
            .uid
            .clone()
            .ok_or_else(|| Error::SelectorResolution("primary has no uid to validate owners against".into()))?;
        query.owner = Some(OwnerMatch { uid, controller: criteria.validation == ValidationType::Controller });
    }
    Ok(Some(query))
}

/// Whether `secondary` is owned by `primary` under `criteria`; the reverse check used by root finding.
pub fn owns(
    primary: &DynamicObject,
    secondary: &DynamicObject,
    criteria: &OwnershipCriteria,
    registry: &TypeRegistry,
) -> Result<bool> {
    let secondary_type = ObjectType::of(secondary)?;
    Ok(materialize(primary, &secondary_type, criteria, registry)?.map(|q| q.accepts(secondary)).unwrap_or(false))
}
