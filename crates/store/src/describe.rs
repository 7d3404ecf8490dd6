//! Human-readable change descriptions, optionally localized.
//!
//! A localization resource is a ConfigMap whose `data` maps a locale to lines of
//! `apiVersion/Kind/ChangeType=format`, e.g.
//! `apps.kubeblocks.io/v1/Component/Creation=Component %s/%s is created.`
//! The two `%s` are filled with the object's namespace and name. For Events the
//! key is the event message itself and the format is used verbatim.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::core::DynamicObject;
use kview_core::{ChangeType, Error, ObjectType, Result};
use rustc_hash::FxHashMap;
use tracing::debug;

pub const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Clone, Default)]
pub struct LocaleResources {
    formats: FxHashMap<String, FxHashMap<String, String>>,
}

impl LocaleResources {
    pub fn parse(data: &BTreeMap<String, String>) -> Self {
        let mut formats: FxHashMap<String, FxHashMap<String, String>> = FxHashMap::default();
        for (locale, body) in data {
            let table = formats.entry(locale.clone()).or_default();
            for line in body.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
                match line.split_once('=') {
                    Some((key, format)) => {
                        table.insert(key.trim().to_string(), format.trim().to_string());
                    }
                    None => debug!(locale = %locale, line = %line, "skipping malformed localization line"),
                }
            }
        }
        Self { formats }
    }

    /// Read the resource out of a ConfigMap object.
    pub fn from_config_map(cm: &DynamicObject) -> Result<Self> {
        let data = cm
            .data
            .get("data")
            .and_then(|d| d.as_object())
            .ok_or_else(|| Error::Config("localization ConfigMap has no data".into()))?;
        let data: BTreeMap<String, String> =
            data.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect();
        Ok(Self::parse(&data))
    }

    pub fn lookup(&self, key: &str, locale: &str) -> Option<&str> {
        self.formats.get(locale)?.get(key).map(String::as_str)
    }
}

/// Renders change descriptions; cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct DescriptionFormatter {
    resources: Option<Arc<LocaleResources>>,
    locale: Option<String>,
}

impl DescriptionFormatter {
    pub fn new(resources: Option<Arc<LocaleResources>>, locale: Option<String>) -> Self {
        Self { resources, locale: locale.filter(|l| !l.is_empty()) }
    }

    /// `(description, localized description)` for one change of `obj`.
    pub fn describe(&self, object_type: &ObjectType, obj: &DynamicObject, change: ChangeType) -> (String, Option<String>) {
        let (key, fallback, fill) = if object_type.is_event() {
            let message = obj.data.get("message").and_then(|m| m.as_str()).unwrap_or(change.as_str()).to_string();
            (message.clone(), message, false)
        } else {
            (format!("{}/{}/{}", object_type.api_version, object_type.kind, change), change.to_string(), true)
        };
        let render = |locale: &str| -> Option<String> {
            let format = self.resources.as_ref()?.lookup(&key, locale)?;
            Some(if fill {
                fill_placeholders(format, obj.metadata.namespace.as_deref().unwrap_or(""), obj.metadata.name.as_deref().unwrap_or(""))
            } else {
                format.to_string()
            })
        };
        let description = render(DEFAULT_LOCALE).unwrap_or_else(|| fallback.clone());
        let local = self.locale.as_deref().map(|l| render(l).unwrap_or(fallback));
        (description, local)
    }
}

fn fill_placeholders(format: &str, namespace: &str, name: &str) -> String {
    let mut out = String::with_capacity(format.len() + namespace.len() + name.len());
    let mut args = [namespace, name].into_iter();
    let mut rest = format;
    while let Some(idx) = rest.find("%s") {
        out.push_str(&rest[..idx]);
        out.push_str(args.next().unwrap_or(""));
        rest = &rest[idx + 2..];
    }
    out.push_str(rest);
    out
}
