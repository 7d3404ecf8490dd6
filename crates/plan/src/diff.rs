//! Desired-spec parsing, spec diff rendering and revision hashing.

use std::hash::{Hash, Hasher};

use kview_core::{Error, Result};
use rustc_hash::FxHasher;
use serde_json::Value as Json;

fn max_yaml_bytes() -> usize {
    std::env::var("KVIEW_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("KVIEW_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a YAML desired spec into the JSON merge patch applied to the root's `spec`.
/// An empty document is an empty patch.
pub fn parse_desired_spec(yaml: &str) -> Result<Json> {
    if yaml.len() > max_yaml_bytes() {
        return Err(Error::InvalidPatch(format!("desired spec too large (>{} bytes)", max_yaml_bytes())));
    }
    if yaml.trim().is_empty() {
        return Ok(Json::Object(Default::default()));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| Error::InvalidPatch(format!("parsing YAML: {e}")))?;
    let json = serde_json::to_value(val).map_err(|e| Error::InvalidPatch(format!("converting YAML to JSON: {e}")))?;
    if node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(Error::InvalidPatch(format!("desired spec too complex (>{} nodes)", max_yaml_nodes())));
    }
    match json {
        Json::Object(_) => Ok(json),
        Json::Null => Ok(Json::Object(Default::default())),
        other => Err(Error::InvalidPatch(format!("desired spec must be a mapping, got {}", kind_of(&other)))),
    }
}

fn kind_of(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "sequence",
        Json::Object(_) => "mapping",
    }
}

/// Stable identifier of a desired spec text; a plan is regenerated only when it changes.
pub fn spec_revision(desired_spec: &str) -> String {
    let mut h = FxHasher::default();
    desired_spec.hash(&mut h);
    format!("{:016x}", h.finish())
}

/// Line diff of two specs. Unchanged fields keep a two-space margin, removed
/// values are prefixed with `-` and added ones with `+`. Equal specs render as
/// an empty string.
pub fn render_spec_diff(current: &Json, desired: &Json) -> String {
    if current == desired {
        return String::new();
    }
    let mut out = Vec::new();
    out.push("  {".to_string());
    diff_children(current, desired, 1, &mut out);
    out.push("  }".to_string());
    out.join("\n")
}

fn diff_children(a: &Json, b: &Json, depth: usize, out: &mut Vec<String>) {
    match (a, b) {
        (Json::Object(ao), Json::Object(bo)) => {
            let mut keys: Vec<&String> = ao.keys().chain(bo.keys()).collect();
            keys.sort();
            keys.dedup();
            for k in keys {
                diff_entry(k, ao.get(k.as_str()), bo.get(k.as_str()), depth, out);
            }
        }
        (Json::Array(aa), Json::Array(bb)) => {
            for i in 0..aa.len().max(bb.len()) {
                diff_entry(&i.to_string(), aa.get(i), bb.get(i), depth, out);
            }
        }
        _ => {}
    }
}

fn diff_entry(key: &str, a: Option<&Json>, b: Option<&Json>, depth: usize, out: &mut Vec<String>) {
    let pad = "  ".repeat(depth);
    match (a, b) {
        (Some(av), Some(bv)) if av == bv => out.push(format!("  {pad}{key}: {}", scalar(av))),
        (Some(av @ Json::Object(_)), Some(bv @ Json::Object(_))) | (Some(av @ Json::Array(_)), Some(bv @ Json::Array(_))) => {
            let (open, close) = if av.is_object() { ("{", "}") } else { ("[", "]") };
            out.push(format!("  {pad}{key}: {open}"));
            diff_children(av, bv, depth + 1, out);
            out.push(format!("  {pad}{close},"));
        }
        (a, b) => {
            if let Some(av) = a {
                out.push(format!("- {pad}{key}: {}", scalar(av)));
            }
            if let Some(bv) = b {
                out.push(format!("+ {pad}{key}: {}", scalar(bv)));
            }
        }
    }
}

fn scalar(v: &Json) -> String {
    match v {
        Json::String(s) => format!("{s},"),
        other => format!("{other},"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_yaml_and_rejects_non_mappings() {
        let patch = parse_desired_spec("componentSpecs:\n- name: mysql\n  replicas: 3\n").unwrap();
        assert_eq!(patch, json!({"componentSpecs": [{"name": "mysql", "replicas": 3}]}));
        assert_eq!(parse_desired_spec("").unwrap(), json!({}));
        assert!(matches!(parse_desired_spec("- a\n- b\n"), Err(Error::InvalidPatch(_))));
        assert!(matches!(parse_desired_spec("a: [unclosed"), Err(Error::InvalidPatch(_))));
    }

    #[test]
    fn renders_changed_fields_only_with_markers() {
        let current = json!({"replicas": 2, "terminationPolicy": "Delete", "resources": {"cpu": "500m"}});
        let desired = json!({"replicas": 3, "terminationPolicy": "Delete", "resources": {"cpu": "800m"}});
        let diff = render_spec_diff(&current, &desired);
        let lines: Vec<_> = diff.lines().collect();
        assert!(lines.contains(&"-   replicas: 2,"), "{diff}");
        assert!(lines.contains(&"+   replicas: 3,"), "{diff}");
        assert!(lines.contains(&"    terminationPolicy: Delete,"), "{diff}");
        assert!(lines.contains(&"-     cpu: 500m,"), "{diff}");
        assert_eq!(render_spec_diff(&current, &current), "");
    }

    #[test]
    fn revision_is_stable_and_sensitive() {
        assert_eq!(spec_revision("replicas: 3"), spec_revision("replicas: 3"));
        assert_ne!(spec_revision("replicas: 3"), spec_revision("replicas: 4"));
        assert_eq!(spec_revision("x").len(), 16);
    }
}
