//! Chart-backed deployable units and value overrides.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Default per-component timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Identity of a component: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentKey {
    pub namespace: String,
    pub name: String,
}

impl ComponentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A named, versioned, chart-backed deployable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    pub namespace: String,
    pub chart_ref: String,
    pub version: String,
    /// Chart values, passed through to the engine untouched.
    #[serde(default)]
    pub values: Json,
    /// Ascending order = installed earlier.
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub force_upgrade: bool,
    /// Timeout in seconds for a single engine call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Component {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, chart_ref: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            chart_ref: chart_ref.into(),
            version: version.into(),
            values: Json::Null,
            order: 0,
            force_upgrade: false,
            timeout: None,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self { self.order = order; self }
    pub fn with_values(mut self, values: Json) -> Self { self.values = values; self }
    pub fn with_force_upgrade(mut self, force: bool) -> Self { self.force_upgrade = force; self }

    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(&self.namespace, &self.name)
    }

    /// Condition type recording this component's progress.
    pub fn condition_type(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Structural equality for no-op detection. `order` is a scheduling hint,
    /// not part of the release, so it is ignored here.
    pub fn same_release(&self, other: &Component) -> bool {
        self.name == other.name
            && self.namespace == other.namespace
            && self.chart_ref == other.chart_ref
            && self.version == other.version
            && self.values == other.values
            && self.force_upgrade == other.force_upgrade
            && self.timeout == other.timeout
    }

    /// Copy of this component with `patch` merged over its values.
    pub fn with_override(&self, patch: &Json) -> Component {
        let mut out = self.clone();
        out.values = apply_override(&self.values, patch);
        out
    }
}

/// Merge `patch` over `base` and return the result.
///
/// Objects merge key by key, recursively. Any other patch value replaces the
/// base value, and a `null` in a patch object removes that key.
pub fn apply_override(base: &Json, patch: &Json) -> Json {
    match (base, patch) {
        (Json::Object(b), Json::Object(p)) => {
            let mut merged = b.clone();
            for (k, pv) in p {
                if pv.is_null() {
                    merged.remove(k);
                    continue;
                }
                let next = match merged.get(k) {
                    Some(bv) => apply_override(bv, pv),
                    None => strip_nulls(pv),
                };
                merged.insert(k.clone(), next);
            }
            Json::Object(merged)
        }
        (_, Json::Null) => base.clone(),
        (_, p) => strip_nulls(p),
    }
}

fn strip_nulls(v: &Json) -> Json {
    match v {
        Json::Object(m) => Json::Object(m.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), strip_nulls(v))).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn order_does_not_affect_equality() {
        let a = Component::new("ns", "x", "repo/x", "1.0.0").with_order(1);
        let b = a.clone().with_order(7);
        assert!(a.same_release(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn values_change_breaks_equality() {
        let a = Component::new("ns", "x", "repo/x", "1.0.0").with_values(json!({"replicas": 1}));
        let b = a.clone().with_values(json!({"replicas": 2}));
        assert!(!a.same_release(&b));
    }

    #[test]
    fn condition_type_is_namespace_dash_name() {
        let c = Component::new("registry", "docker-registry", "repo/registry", "2.2.3");
        assert_eq!(c.condition_type(), "registry-docker-registry");
        assert_eq!(c.key().to_string(), "registry/docker-registry");
    }

    #[test]
    fn override_merges_nested_objects() {
        let base = json!({"image": {"repo": "a", "tag": "1"}, "replicas": 1, "keep": true});
        let patch = json!({"image": {"tag": "2"}, "replicas": 3, "keep": null, "extra": [1, 2]});
        let merged = apply_override(&base, &patch);
        assert_eq!(merged, json!({"image": {"repo": "a", "tag": "2"}, "replicas": 3, "extra": [1, 2]}));
        // inputs untouched
        assert_eq!(base["replicas"], 1);
    }

    #[test]
    fn override_with_null_patch_is_identity() {
        let base = json!({"a": 1});
        assert_eq!(apply_override(&base, &Json::Null), base);
    }

    #[test]
    fn deserializes_from_yaml_style_json() {
        let c: Component = serde_json::from_value(json!({
            "name": "openebs", "namespace": "openebs", "chartRef": "oci://charts/openebs",
            "version": "4.1.0", "order": 1, "timeout": 600
        })).unwrap();
        assert_eq!(c.timeout_duration(), Duration::from_secs(600));
        assert!(!c.force_upgrade);
        assert!(c.values.is_null());
    }
}
