//! Per-run storage of task results and dotted-path reference resolution.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{EngineError, ErrorKind};
use crate::result::TaskResult;

/// Resolution context for reference paths: which task is resolving, and its
/// dependencies in declaration order (needed for the `prev*` aliases).
#[derive(Debug, Clone, Copy)]
pub struct RefScope<'a> {
    pub instance_id: &'a str,
    pub dependencies: &'a [String],
}

impl<'a> RefScope<'a> {
    pub fn new(instance_id: &'a str, dependencies: &'a [String]) -> Self {
        RefScope {
            instance_id,
            dependencies,
        }
    }

    /// Rewrite a `prev*` alias into an absolute path.
    ///
    /// `prev` binds to the dependency declared last for the current task;
    /// `prevN` walks N entries back from the end of the declaration order.
    /// This is a deliberate contract, not an accident of iteration order.
    pub fn absolute_path(&self, path: &str) -> Result<String, EngineError> {
        let (first, rest) = match path.split_once('.') {
            Some((first, rest)) => (first, Some(rest)),
            None => (path, None),
        };
        let Some(suffix) = first.strip_prefix("prev") else {
            return Ok(path.to_string());
        };
        let steps_back = if suffix.is_empty() {
            1
        } else {
            match suffix.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => return Ok(path.to_string()),
            }
        };
        if steps_back > self.dependencies.len() {
            return Err(EngineError::new(
                ErrorKind::Reference,
                format!(
                    "alias '{}' needs {} dependencies but task '{}' declares {}",
                    first,
                    steps_back,
                    self.instance_id,
                    self.dependencies.len()
                ),
            ));
        }
        let target = &self.dependencies[self.dependencies.len() - steps_back];
        Ok(match rest {
            Some(rest) => format!("{}.{}", target, rest),
            None => target.clone(),
        })
    }
}

/// Holds the final result of every terminal task, keyed by instance id.
/// Results are immutable snapshots; writes happen only at task completion.
#[derive(Debug, Default)]
pub struct ValueStore {
    entries: HashMap<String, TaskResult>,
}

impl ValueStore {
    pub fn new() -> Self {
        ValueStore::default()
    }

    pub fn put(&mut self, instance_id: impl Into<String>, result: TaskResult) {
        self.entries.insert(instance_id.into(), result);
    }

    pub fn get(&self, instance_id: &str) -> Option<&TaskResult> {
        self.entries.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.entries.contains_key(instance_id)
    }

    pub fn into_entries(self) -> HashMap<String, TaskResult> {
        self.entries
    }

    /// Resolve a dotted reference path against the stored results.
    ///
    /// The first segment names a task (or a `prev*` alias). `success`,
    /// `output`, and `error` address the result envelope directly; any other
    /// second segment dereferences into the task's `output` map. Remaining
    /// segments are map keys or decimal list indices.
    pub fn resolve_path(&self, path: &str, scope: &RefScope<'_>) -> Result<Value, EngineError> {
        let absolute = scope.absolute_path(path)?;
        let mut segments = absolute.split('.');
        let instance_id = segments.next().unwrap_or_default();
        if instance_id.is_empty() {
            return Err(EngineError::new(
                ErrorKind::Reference,
                format!("empty reference path '{}'", path),
            ));
        }
        let result = self.entries.get(instance_id).ok_or_else(|| {
            EngineError::new(
                ErrorKind::Reference,
                format!("reference '{}' names unknown or unfinished task '{}'", path, instance_id),
            )
        })?;

        let rest: Vec<&str> = segments.collect();
        let (root, remaining): (Value, &[&str]) = match rest.first() {
            None => return Ok(result.output.clone()),
            Some(&"success") => (Value::Bool(result.success), &rest[1..]),
            Some(&"output") => (result.output.clone(), &rest[1..]),
            Some(&"error") => (
                result
                    .error
                    .as_ref()
                    .map(|summary| serde_json::to_value(summary).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null),
                &rest[1..],
            ),
            Some(_) => (result.output.clone(), &rest[..]),
        };
        walk(root, remaining, &absolute)
    }
}

fn walk(mut current: Value, segments: &[&str], path: &str) -> Result<Value, EngineError> {
    for segment in segments {
        current = match current {
            Value::Object(mut map) => map.remove(*segment).ok_or_else(|| {
                EngineError::new(
                    ErrorKind::Reference,
                    format!("field '{}' not found while resolving '{}'", segment, path),
                )
            })?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().map_err(|_| {
                    EngineError::new(
                        ErrorKind::Reference,
                        format!("'{}' is not a list index in '{}'", segment, path),
                    )
                })?;
                if index >= items.len() {
                    return Err(EngineError::new(
                        ErrorKind::Reference,
                        format!("index {} out of range while resolving '{}'", index, path),
                    ));
                }
                items.swap_remove(index)
            }
            other => {
                return Err(EngineError::new(
                    ErrorKind::Reference,
                    format!(
                        "cannot descend into {} at '{}' while resolving '{}'",
                        type_name(&other),
                        segment,
                        path
                    ),
                ))
            }
        };
    }
    Ok(current)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn store_with(entries: &[(&str, Value)]) -> ValueStore {
        let mut store = ValueStore::new();
        for (id, output) in entries {
            store.put(*id, TaskResult::completed(output.clone(), Utc::now(), 1));
        }
        store
    }

    #[test]
    fn resolves_implicit_output_fields() {
        let store = store_with(&[("gen", json!({"numbers": [10, 20, 30]}))]);
        let scope = RefScope::new("stats", &[]);
        assert_eq!(
            store.resolve_path("gen.numbers", &scope).unwrap(),
            json!([10, 20, 30])
        );
        assert_eq!(store.resolve_path("gen.numbers.2", &scope).unwrap(), json!(30));
    }

    #[test]
    fn top_level_attributes_bypass_output() {
        let store = store_with(&[("gen", json!({"success": "nested"}))]);
        let scope = RefScope::new("next", &[]);
        assert_eq!(store.resolve_path("gen.success", &scope).unwrap(), json!(true));
        assert_eq!(
            store.resolve_path("gen.output.success", &scope).unwrap(),
            json!("nested")
        );
        assert_eq!(store.resolve_path("gen.error", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn bare_task_reference_yields_output() {
        let store = store_with(&[("gen", json!({"count": 3}))]);
        let scope = RefScope::new("next", &[]);
        assert_eq!(store.resolve_path("gen", &scope).unwrap(), json!({"count": 3}));
    }

    #[test]
    fn prev_aliases_walk_declaration_order() {
        let store = store_with(&[("a", json!({"v": 1})), ("b", json!({"v": 2}))]);
        let deps = vec!["a".to_string(), "b".to_string()];
        let scope = RefScope::new("c", &deps);
        assert_eq!(store.resolve_path("prev.v", &scope).unwrap(), json!(2));
        assert_eq!(store.resolve_path("prev2.v", &scope).unwrap(), json!(1));
        assert!(store.resolve_path("prev3.v", &scope).is_err());
    }

    #[test]
    fn prev_like_task_names_are_not_aliases() {
        let store = store_with(&[("preview", json!({"v": 9}))]);
        let scope = RefScope::new("next", &[]);
        assert_eq!(store.resolve_path("preview.v", &scope).unwrap(), json!(9));
    }

    #[test]
    fn missing_pieces_are_reference_errors() {
        let store = store_with(&[("gen", json!({"numbers": [1]}))]);
        let scope = RefScope::new("next", &[]);
        for path in ["ghost.field", "gen.missing", "gen.numbers.5", "gen.numbers.x"] {
            let err = store.resolve_path(path, &scope).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Reference, "path {}", path);
        }
    }
}
