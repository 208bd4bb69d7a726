use crate::resource::JsonObject;

use serde_json::Value;

use std::fmt::{self, Display, Write};

static NULL: Value = Value::Null;

/// Decides whether an existing child has diverged from its desired manifest. This is the only
/// place where that decision is made.
#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonPolicy {
    /// Every field of the rendered and bound manifest must be present and equal in the existing
    /// child. Fields that only the server sets are ignored.
    AllRenderedFields,
    /// Only the values at the given json pointers are compared. Pointers that don't resolve in
    /// the desired manifest are skipped.
    SelectedPaths(&'static [&'static str]),
}

impl ComparisonPolicy {
    /// Compares only the replica count and the image of the first container, and so never
    /// finds a Service or Ingress to be diverged. Children that drift in any other field are
    /// left alone, and reconciliation is only idempotent if nothing else changes.
    pub const LEGACY_WORKLOAD_FIELDS: ComparisonPolicy = ComparisonPolicy::SelectedPaths(&[
        "/spec/replicas",
        "/spec/template/spec/containers/0/image",
    ]);

    pub fn diff<'a>(&self, existing: &'a Value, desired: &'a Value) -> Diffs<'a> {
        match self {
            ComparisonPolicy::AllRenderedFields => compare_values(existing, desired),
            ComparisonPolicy::SelectedPaths(pointers) => {
                let mut diffs = Vec::new();
                for pointer in pointers.iter() {
                    let desired_val = match desired.pointer(pointer) {
                        Some(val) => val,
                        None => continue,
                    };
                    let existing_val = existing.pointer(pointer).unwrap_or(&NULL);
                    let mut path = Vec::with_capacity(8);
                    path.extend(pointer.split('/').skip(1).map(Segment::Key));
                    compare(&mut diffs, &mut path, existing_val, desired_val);
                }
                Diffs(diffs)
            }
        }
    }
}

impl Default for ComparisonPolicy {
    fn default() -> ComparisonPolicy {
        ComparisonPolicy::AllRenderedFields
    }
}

#[derive(Debug, PartialEq)]
pub struct Diff<'a> {
    pub path: String,
    pub existing: &'a Value,
    pub desired: &'a Value,
}

impl<'a> Display for Diff<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "'{}' existing: {}, desired: {}",
            self.path, self.existing, self.desired
        )
    }
}

pub struct Diffs<'a>(Vec<Diff<'a>>);

impl<'a> Diffs<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|d| d.path.as_str())
    }
}

impl<'a> Display for Diffs<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        write!(f, "{} differences: ", self.0.len())?;
        for (i, diff) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            Display::fmt(diff, f)?;
        }
        Ok(())
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Returns a diff for every value in `desired` that is missing from, or different in, `existing`.
/// Values that are only present in `existing` are ignored, since those are typically defaults and
/// status that the api server fills in.
///
/// Arrays where every desired item is an object with a string `name` field are compared as
/// associative arrays, which is how Kubernetes models containers, ports, env vars and such. Items
/// are matched up by name, so their order doesn't matter. All other arrays are compared by index.
pub fn compare_values<'a>(existing: &'a Value, desired: &'a Value) -> Diffs<'a> {
    let mut diffs = Vec::new();
    let mut path = Vec::with_capacity(8);
    compare(&mut diffs, &mut path, existing, desired);
    Diffs(diffs)
}

fn compare<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: &'a Value,
    desired: &'a Value,
) {
    match (existing, desired) {
        (Value::Object(existing_map), Value::Object(desired_map)) => {
            compare_objects(diffs, path, existing_map, desired_map);
        }
        (Value::Array(existing_items), Value::Array(desired_items)) => {
            if is_associative(desired_items) {
                compare_associative_arrays(diffs, path, existing_items, desired_items);
            } else {
                compare_indexed_arrays(diffs, path, existing_items, desired_items);
            }
        }
        (e, d) if e != d => diffs.push(diff(path, e, d)),
        _ => {}
    }
}

fn compare_objects<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: &'a JsonObject,
    desired: &'a JsonObject,
) {
    for (key, desired_val) in desired.iter() {
        path.push(Segment::Key(key.as_str()));
        match existing.get(key) {
            Some(existing_val) => compare(diffs, path, existing_val, desired_val),
            None => diffs.push(diff(path, &NULL, desired_val)),
        }
        path.pop();
    }
}

fn compare_indexed_arrays<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: &'a [Value],
    desired: &'a [Value],
) {
    for (i, desired_item) in desired.iter().enumerate() {
        path.push(Segment::Index(i));
        match existing.get(i) {
            Some(existing_item) => compare(diffs, path, existing_item, desired_item),
            None => diffs.push(diff(path, &NULL, desired_item)),
        }
        path.pop();
    }
}

fn compare_associative_arrays<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: &'a [Value],
    desired: &'a [Value],
) {
    for (i, desired_item) in desired.iter().enumerate() {
        path.push(Segment::Index(i));
        let name = item_name(desired_item);
        let existing_item = existing
            .iter()
            .find(|e| name.is_some() && item_name(e) == name);
        match existing_item {
            Some(existing_match) => compare(diffs, path, existing_match, desired_item),
            None => diffs.push(diff(path, &NULL, desired_item)),
        }
        path.pop();
    }
}

fn item_name(item: &Value) -> Option<&str> {
    item.get("name").and_then(Value::as_str)
}

fn is_associative(desired: &[Value]) -> bool {
    !desired.is_empty() && desired.iter().all(|v| v.is_object() && item_name(v).is_some())
}

fn diff<'a>(path: &[Segment], existing: &'a Value, desired: &'a Value) -> Diff<'a> {
    let mut p = String::with_capacity(32);
    for segment in path.iter() {
        p.push('.');
        match segment {
            Segment::Key(k) => p.push_str(k),
            Segment::Index(i) => {
                let _ = write!(p, "{}", i);
            }
        }
    }
    Diff {
        path: p,
        existing,
        desired,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn fields_only_present_in_existing_are_ignored() {
        let existing = json!({
            "spec": { "replicas": 3, "strategy": { "type": "RollingUpdate" } },
            "status": { "readyReplicas": 3 },
        });
        let desired = json!({ "spec": { "replicas": 3 } });
        assert!(compare_values(&existing, &desired).is_empty());
    }

    #[test]
    fn returns_diffs_for_changed_and_missing_fields() {
        let existing = json!({
            "key1": { "nested1": "same", "nested2": "existing2" },
            "key3": 7,
        });
        let desired = json!({
            "key1": { "nested1": "same", "nested2": "desired2" },
            "key3": 8,
            "newKey": true,
        });

        let diffs = compare_values(&existing, &desired);
        let mut paths = diffs.paths().collect::<Vec<_>>();
        paths.sort();
        assert_eq!(vec![".key1.nested2", ".key3", ".newKey"], paths);
    }

    #[test]
    fn associative_arrays_are_matched_by_name() {
        let existing = json!({
            "containers": [
                { "name": "sidecar", "image": "proxy:1" },
                { "name": "app", "image": "app:1.0", "imagePullPolicy": "IfNotPresent" },
            ],
            "args": ["a", "b"],
        });
        let desired = json!({
            "containers": [
                { "name": "app", "image": "app:2.0" },
            ],
            "args": ["a", "c"],
        });

        let diffs = compare_values(&existing, &desired);
        let paths = diffs.paths().collect::<Vec<_>>();
        assert_eq!(2, diffs.len(), "diffs: {}", diffs);
        assert!(paths.contains(&".containers.0.image"));
        assert!(paths.contains(&".args.1"));
    }

    #[test]
    fn all_rendered_fields_catches_drift_outside_replicas_and_image() {
        let existing = json!({
            "spec": {
                "replicas": 3,
                "template": { "spec": { "containers": [
                    { "name": "app", "image": "app:1.0", "ports": [{ "containerPort": 8000 }] }
                ]}}
            }
        });
        let desired = json!({
            "spec": {
                "replicas": 3,
                "template": { "spec": { "containers": [
                    { "name": "app", "image": "app:1.0", "ports": [{ "containerPort": 80 }] }
                ]}}
            }
        });

        let full = ComparisonPolicy::default().diff(&existing, &desired);
        assert_eq!(1, full.len());
        let legacy = ComparisonPolicy::LEGACY_WORKLOAD_FIELDS.diff(&existing, &desired);
        assert!(legacy.is_empty());
    }

    #[test]
    fn selected_paths_report_the_pointer_path() {
        let existing = json!({ "spec": { "replicas": 3 } });
        let desired = json!({ "spec": { "replicas": 5 } });
        let diffs = ComparisonPolicy::LEGACY_WORKLOAD_FIELDS.diff(&existing, &desired);
        assert_eq!(vec![".spec.replicas"], diffs.paths().collect::<Vec<_>>());
    }
}
