//! Field-path sets over untyped Kubernetes objects.
//!
//! A declared-fields snapshot is the set of dotted leaf paths a reconciler
//! claims authority over for one object. The admission gate intersects this
//! set with the diff between old and new objects to decide whether an update
//! touches managed fields; the remediator uses the same intersection to
//! detect drift worth reverting.
//!
//! Arrays are treated as leaves: replacing, reordering, or appending to a
//! list shows up as a single path. That matches how the applier declares
//! whole lists via server-side apply.

use serde_json::Value;
use std::collections::BTreeSet;

/// An ordered set of dotted field paths, e.g. `spec.template.spec.containers`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldSet(BTreeSet<String>);

impl FieldSet {
    pub fn new() -> Self {
        FieldSet(BTreeSet::new())
    }

    pub fn insert(&mut self, path: impl Into<String>) {
        self.0.insert(path.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    /// Paths present in both sets.
    pub fn intersection(&self, other: &FieldSet) -> FieldSet {
        FieldSet(self.0.intersection(&other.0).cloned().collect())
    }

    /// Paths present in either set.
    pub fn union(&self, other: &FieldSet) -> FieldSet {
        FieldSet(self.0.union(&other.0).cloned().collect())
    }

    /// Paths matching a prefix (a path equal to it or nested below it).
    pub fn with_prefix(&self, prefix: &str) -> FieldSet {
        let nested = format!("{prefix}.");
        FieldSet(
            self.0
                .iter()
                .filter(|p| *p == prefix || p.starts_with(&nested))
                .cloned()
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// Serialize as a JSON array of paths for the declared-fields annotation.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0.iter().collect::<Vec<_>>()).unwrap_or_else(|_| "[]".into())
    }

    /// Parse the declared-fields annotation value.
    pub fn from_json(s: &str) -> Result<FieldSet, serde_json::Error> {
        let paths: Vec<String> = serde_json::from_str(s)?;
        Ok(FieldSet(paths.into_iter().collect()))
    }
}

impl std::fmt::Display for FieldSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for p in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<String> for FieldSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        FieldSet(iter.into_iter().collect())
    }
}

/// Dots inside a map key (annotation and label names) are escaped so that
/// a path splits unambiguously on unescaped dots.
fn join(prefix: &str, key: &str) -> String {
    let escaped = key.replace('.', "\\.");
    if prefix.is_empty() {
        escaped
    } else {
        format!("{prefix}.{escaped}")
    }
}

fn collect_leaves(prefix: &str, value: &Value, out: &mut FieldSet) {
    match value {
        Value::Object(map) => {
            if map.is_empty() && !prefix.is_empty() {
                out.insert(prefix);
                return;
            }
            for (k, v) in map {
                collect_leaves(&join(prefix, k), v, out);
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.insert(prefix);
            }
        }
    }
}

/// All leaf paths declared by an object's JSON representation.
pub fn leaf_paths(value: &Value) -> FieldSet {
    let mut out = FieldSet::new();
    collect_leaves("", value, &mut out);
    out
}

fn collect_diff(prefix: &str, old: Option<&Value>, new: Option<&Value>, out: &mut FieldSet) {
    match (old, new) {
        (None, None) => {}
        (Some(Value::Object(o)), Some(Value::Object(n))) => {
            let keys: BTreeSet<&String> = o.keys().chain(n.keys()).collect();
            for k in keys {
                collect_diff(&join(prefix, k), o.get(k.as_str()), n.get(k.as_str()), out);
            }
        }
        (Some(a), Some(b)) => {
            if a != b && !prefix.is_empty() {
                out.insert(prefix);
            } else if a != b {
                // Diff at the root with non-object values; record everything.
                collect_leaves("", a, out);
                collect_leaves("", b, out);
            }
        }
        (Some(v), None) | (None, Some(v)) => {
            if prefix.is_empty() {
                collect_leaves("", v, out);
            } else {
                // Record the whole removed/added subtree as changed.
                collect_leaves(prefix, v, out);
                out.insert(prefix);
            }
        }
    }
}

/// Paths whose values differ between two objects (added, removed, or changed).
pub fn diff_paths(old: &Value, new: &Value) -> FieldSet {
    let mut out = FieldSet::new();
    collect_diff("", Some(old), Some(new), &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn leaf_paths_nested() {
        let v = json!({
            "spec": {
                "replicas": 3,
                "template": {"spec": {"containers": [{"name": "app"}]}}
            },
            "metadata": {"name": "x"}
        });
        let set = leaf_paths(&v);
        assert!(set.contains("spec.replicas"));
        assert!(set.contains("spec.template.spec.containers"));
        assert!(set.contains("metadata.name"));
        assert!(!set.contains("spec"));
    }

    #[test]
    fn diff_detects_changed_and_removed() {
        let old = json!({"spec": {"a": 1, "b": 2}, "meta": {"x": true}});
        let new = json!({"spec": {"a": 1, "b": 3}, "extra": "y"});
        let diff = diff_paths(&old, &new);
        assert!(diff.contains("spec.b"));
        assert!(diff.contains("meta.x"));
        assert!(diff.contains("extra"));
        assert!(!diff.contains("spec.a"));
    }

    #[test]
    fn diff_treats_lists_as_leaves() {
        let old = json!({"spec": {"items": [1, 2]}});
        let new = json!({"spec": {"items": [2, 1]}});
        let diff = diff_paths(&old, &new);
        assert_eq!(diff.len(), 1);
        assert!(diff.contains("spec.items"));
    }

    #[test]
    fn annotation_round_trip() {
        let v = json!({"spec": {"a": 1}, "data": {"k": "v"}});
        let set = leaf_paths(&v);
        let parsed = FieldSet::from_json(&set.to_json()).unwrap();
        assert_eq!(set, parsed);
    }

    #[test]
    fn annotation_keys_are_escaped() {
        let v = json!({
            "metadata": {"annotations": {"example.com/owner": "a"}}
        });
        let set = leaf_paths(&v);
        assert!(set.contains("metadata.annotations.example\\.com/owner"));
    }

    #[test]
    fn prefix_filter() {
        let mut set = FieldSet::new();
        set.insert("metadata.labels.app");
        set.insert("metadata.name");
        set.insert("spec.replicas");
        let meta = set.with_prefix("metadata");
        assert_eq!(meta.len(), 2);
        assert!(meta.contains("metadata.name"));
        assert!(!meta.contains("spec.replicas"));
        // A prefix is not a substring match.
        assert!(set.with_prefix("meta").is_empty());
    }
}
