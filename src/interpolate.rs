//! `${path}` substitution over nested configuration values, plus the `$.`
//! element selectors used by fan-out config templates.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::{EngineError, ErrorKind};
use crate::store::{RefScope, ValueStore};

/// Result of interpolating a config tree: the resolved value and the set of
/// task instance ids the tree actually referenced (after alias rewriting).
/// The referenced set feeds the cache fingerprint.
#[derive(Debug)]
pub struct Interpolated {
    pub value: Value,
    pub referenced: BTreeSet<String>,
}

/// Substitute every `${path}` token in `value`, preserving shape.
///
/// A string consisting of exactly one token is replaced by the resolved value
/// with its type intact; otherwise tokens are stringified and concatenated
/// with the literal segments. Literal segments of token-bearing strings have
/// `\n` and `\t` escape sequences expanded.
pub fn interpolate_value(
    value: &Value,
    store: &ValueStore,
    scope: &RefScope<'_>,
) -> Result<Interpolated, EngineError> {
    let mut referenced = BTreeSet::new();
    let value = interpolate_inner(value, store, scope, &mut referenced)?;
    Ok(Interpolated { value, referenced })
}

fn interpolate_inner(
    value: &Value,
    store: &ValueStore,
    scope: &RefScope<'_>,
    referenced: &mut BTreeSet<String>,
) -> Result<Value, EngineError> {
    match value {
        Value::String(text) => interpolate_string(text, store, scope, referenced),
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, child) in map {
                resolved.insert(key.clone(), interpolate_inner(child, store, scope, referenced)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(interpolate_inner(item, store, scope, referenced)?);
            }
            Ok(Value::Array(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate_string(
    text: &str,
    store: &ValueStore,
    scope: &RefScope<'_>,
    referenced: &mut BTreeSet<String>,
) -> Result<Value, EngineError> {
    if !text.contains("${") {
        return Ok(Value::String(text.to_string()));
    }

    // Whole-string token: insert the resolved value with its type preserved.
    if let Some(inner) = text.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        if !inner.contains("${") && !inner.contains('}') && !inner.trim().is_empty() {
            let path = inner.trim();
            record_reference(path, scope, referenced)?;
            return store.resolve_path(path, scope);
        }
    }

    let mut result = String::new();
    let mut remaining = text;
    while let Some(start) = remaining.find("${") {
        result.push_str(&expand_escapes(&remaining[..start]));
        let after_start = &remaining[start + 2..];
        let end = after_start.find('}').ok_or_else(|| {
            EngineError::new(
                ErrorKind::Validation,
                format!("missing closing '}}' in template string '{}'", text),
            )
        })?;
        let path = after_start[..end].trim();
        if path.is_empty() {
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!("empty reference in template string '{}'", text),
            ));
        }
        record_reference(path, scope, referenced)?;
        let resolved = store.resolve_path(path, scope)?;
        match resolved {
            Value::String(text) => result.push_str(&text),
            other => result.push_str(&serde_json::to_string(&other)?),
        }
        remaining = &after_start[end + 1..];
    }
    result.push_str(&expand_escapes(remaining));
    Ok(Value::String(result))
}

fn record_reference(
    path: &str,
    scope: &RefScope<'_>,
    referenced: &mut BTreeSet<String>,
) -> Result<(), EngineError> {
    let absolute = scope.absolute_path(path)?;
    let instance_id = absolute.split('.').next().unwrap_or_default();
    if !instance_id.is_empty() {
        referenced.insert(instance_id.to_string());
    }
    Ok(())
}

fn expand_escapes(segment: &str) -> String {
    segment.replace("\\n", "\n").replace("\\t", "\t")
}

/// Collect every `${path}` reference in a config tree without resolving it.
/// Used by graph validation to check paths before anything runs.
pub fn collect_references(value: &Value) -> Result<Vec<String>, EngineError> {
    let mut paths = Vec::new();
    collect_inner(value, &mut paths)?;
    Ok(paths)
}

fn collect_inner(value: &Value, paths: &mut Vec<String>) -> Result<(), EngineError> {
    match value {
        Value::String(text) => {
            let mut remaining = text.as_str();
            while let Some(start) = remaining.find("${") {
                let after_start = &remaining[start + 2..];
                let end = after_start.find('}').ok_or_else(|| {
                    EngineError::new(
                        ErrorKind::Validation,
                        format!("missing closing '}}' in template string '{}'", text),
                    )
                })?;
                let path = after_start[..end].trim();
                if path.is_empty() {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        format!("empty reference in template string '{}'", text),
                    ));
                }
                paths.push(path.to_string());
                remaining = &after_start[end + 1..];
            }
        }
        Value::Object(map) => {
            for child in map.values() {
                collect_inner(child, paths)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_inner(item, paths)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Build one fan-out child config from a config template and the current
/// element. Selectors are recognised only in top-level string values: a
/// string of the form `$.path` is replaced by the value at `path` inside the
/// element, the exact string `${item}` by the whole element, and `${item}`
/// substrings by the stringified element. Everything else passes through for
/// ordinary `${…}` interpolation afterwards.
pub fn apply_element(template: &Value, element: &Value) -> Result<Value, EngineError> {
    let map = template.as_object().ok_or_else(|| {
        EngineError::new(ErrorKind::Validation, "config_template must be a map")
    })?;
    let mut config = Map::new();
    for (key, value) in map {
        let resolved = match value {
            Value::String(text) if text == "${item}" => element.clone(),
            Value::String(text) if text.starts_with("$.") => {
                element_path(element, &text[2..]).ok_or_else(|| {
                    EngineError::new(
                        ErrorKind::Reference,
                        format!("selector '{}' not found in fan-out element", text),
                    )
                })?
            }
            Value::String(text) if text.contains("${item}") => {
                let rendered = match element {
                    Value::String(text) => text.clone(),
                    other => serde_json::to_string(other)?,
                };
                Value::String(text.replace("${item}", &rendered))
            }
            other => other.clone(),
        };
        config.insert(key.clone(), resolved);
    }
    Ok(Value::Object(config))
}

fn element_path(element: &Value, path: &str) -> Option<Value> {
    let mut current = element;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}
