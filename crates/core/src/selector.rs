//! Label maps and field-path lookups over raw object JSON.

use std::collections::BTreeMap;

use serde_json::Value;

pub type Labels = BTreeMap<String, String>;

/// Equality-based selector match: every selector pair must be present in `labels`.
pub fn matches(selector: &Labels, labels: Option<&BTreeMap<String, String>>) -> bool {
    if selector.is_empty() {
        return true;
    }
    let Some(labels) = labels else { return false };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Walk a dotted path (`spec.selector.matchLabels`) through nested objects.
pub fn field<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim_start_matches('.');
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Scalar at `path` rendered as a string. Objects and arrays yield `None`.
pub fn field_string(root: &Value, path: &str) -> Option<String> {
    match field(root, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// String-valued map at `path`; non-string values are skipped.
pub fn field_labels(root: &Value, path: &str) -> Option<Labels> {
    let map = field(root, path)?.as_object()?;
    Some(
        map.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_matching() {
        let mut sel = Labels::new();
        assert!(matches(&sel, None));
        sel.insert("app".into(), "db".into());
        assert!(!matches(&sel, None));
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "db".to_string());
        labels.insert("tier".to_string(), "x".to_string());
        assert!(matches(&sel, Some(&labels)));
        sel.insert("tier".into(), "y".into());
        assert!(!matches(&sel, Some(&labels)));
    }

    #[test]
    fn field_paths() {
        let v = json!({"spec": {"volumeName": "pv-1", "replicas": 3, "ports": [{"port": 80}],
            "selector": {"matchLabels": {"app": "db", "n": 1}}}});
        assert_eq!(field_string(&v, "spec.volumeName").as_deref(), Some("pv-1"));
        assert_eq!(field_string(&v, ".spec.replicas").as_deref(), Some("3"));
        assert_eq!(field_string(&v, "spec.ports.0.port").as_deref(), Some("80"));
        assert_eq!(field_string(&v, "spec.missing"), None);
        let labels = field_labels(&v, "spec.selector.matchLabels").unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels["app"], "db");
    }
}
