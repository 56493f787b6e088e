//! Conditional-execution evaluation.
//!
//! Conditions come in two forms: a structured `{operator, value, path}`
//! record and a `"${path} <op> <literal>"` string expression. A condition
//! referencing a skipped or failed dependency evaluates to false rather than
//! erroring, so conditional chains can depend on upstream skips.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, ErrorKind};
use crate::interpolate::{collect_references, interpolate_value};
use crate::store::{RefScope, ValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
}

/// A task's run/skip gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskCondition {
    Structured {
        operator: ConditionOp,
        value: Value,
        path: String,
    },
    Expr(String),
}

impl TaskCondition {
    /// Static well-formedness check, run at graph validation time.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            TaskCondition::Structured { path, .. } => {
                if path.trim().is_empty() {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        "condition path must not be empty",
                    ));
                }
                Ok(())
            }
            TaskCondition::Expr(text) => parse_expression(text).map(|_| ()),
        }
    }

    /// Reference paths this condition reads, for graph validation.
    pub fn reference_paths(&self) -> Result<Vec<String>, EngineError> {
        match self {
            TaskCondition::Structured { path, value, .. } => {
                let mut paths = vec![path.clone()];
                paths.extend(collect_references(value)?);
                Ok(paths)
            }
            TaskCondition::Expr(text) => {
                let (path, _, _) = parse_expression(text)?;
                Ok(vec![path])
            }
        }
    }

    /// Decide whether the owning task should run.
    pub fn evaluate(&self, store: &ValueStore, scope: &RefScope<'_>) -> Result<bool, EngineError> {
        match self {
            TaskCondition::Structured {
                operator,
                value,
                path,
            } => {
                if referenced_unavailable(path, store, scope)? {
                    return Ok(false);
                }
                let actual = store.resolve_path(path, scope)?;
                let expected = match value {
                    Value::String(text) if text.contains("${") => {
                        for reference in collect_references(value)? {
                            if referenced_unavailable(&reference, store, scope)? {
                                return Ok(false);
                            }
                        }
                        interpolate_value(value, store, scope)?.value
                    }
                    other => other.clone(),
                };
                compare(*operator, &actual, &expected)
            }
            TaskCondition::Expr(text) => {
                let (path, operator, literal) = parse_expression(text)?;
                if referenced_unavailable(&path, store, scope)? {
                    return Ok(false);
                }
                let actual = store.resolve_path(&path, scope)?;
                compare(operator, &actual, &literal)
            }
        }
    }
}

/// True when the task a path points at finished as skipped or failed.
fn referenced_unavailable(
    path: &str,
    store: &ValueStore,
    scope: &RefScope<'_>,
) -> Result<bool, EngineError> {
    let absolute = scope.absolute_path(path)?;
    let instance_id = absolute.split('.').next().unwrap_or_default();
    Ok(store
        .get(instance_id)
        .map(|result| result.skipped || !result.success)
        .unwrap_or(false))
}

/// Parse `"${path} <op> <literal>"`. The literal is tried as JSON first
/// (numbers, booleans, quoted strings) and falls back to a bare string.
fn parse_expression(text: &str) -> Result<(String, ConditionOp, Value), EngineError> {
    let malformed = || {
        EngineError::new(
            ErrorKind::Condition,
            format!("malformed condition expression '{}'", text),
        )
    };
    let trimmed = text.trim();
    let after_open = trimmed.strip_prefix("${").ok_or_else(malformed)?;
    let close = after_open.find('}').ok_or_else(malformed)?;
    let path = after_open[..close].trim();
    if path.is_empty() {
        return Err(malformed());
    }
    let rest = after_open[close + 1..].trim_start();
    let op_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let operator = match &rest[..op_end] {
        "==" => ConditionOp::Eq,
        "!=" => ConditionOp::Ne,
        ">" => ConditionOp::Gt,
        "<" => ConditionOp::Lt,
        ">=" => ConditionOp::Gte,
        "<=" => ConditionOp::Lte,
        _ => return Err(malformed()),
    };
    let literal = rest[op_end..].trim();
    if literal.is_empty() {
        return Err(malformed());
    }
    let value = serde_json::from_str(literal).unwrap_or_else(|_| Value::String(literal.to_string()));
    Ok((path.to_string(), operator, value))
}

fn compare(operator: ConditionOp, left: &Value, right: &Value) -> Result<bool, EngineError> {
    match operator {
        ConditionOp::In => contains(right, left),
        ConditionOp::NotIn => contains(right, left).map(|found| !found),
        _ => {
            // Numeric comparison when both sides coerce; string comparison
            // otherwise (booleans compare by equality only).
            if let (Some(lhs), Some(rhs)) = (as_number(left), as_number(right)) {
                return Ok(match operator {
                    ConditionOp::Eq => lhs == rhs,
                    ConditionOp::Ne => lhs != rhs,
                    ConditionOp::Gt => lhs > rhs,
                    ConditionOp::Lt => lhs < rhs,
                    ConditionOp::Gte => lhs >= rhs,
                    ConditionOp::Lte => lhs <= rhs,
                    ConditionOp::In | ConditionOp::NotIn => unreachable!(),
                });
            }
            if let (Value::Bool(lhs), Value::Bool(rhs)) = (left, right) {
                return match operator {
                    ConditionOp::Eq => Ok(lhs == rhs),
                    ConditionOp::Ne => Ok(lhs != rhs),
                    _ => Err(EngineError::new(
                        ErrorKind::Condition,
                        "booleans only support eq / ne comparisons",
                    )),
                };
            }
            let lhs = stringify(left)?;
            let rhs = stringify(right)?;
            Ok(match operator {
                ConditionOp::Eq => lhs == rhs,
                ConditionOp::Ne => lhs != rhs,
                ConditionOp::Gt => lhs > rhs,
                ConditionOp::Lt => lhs < rhs,
                ConditionOp::Gte => lhs >= rhs,
                ConditionOp::Lte => lhs <= rhs,
                ConditionOp::In | ConditionOp::NotIn => unreachable!(),
            })
        }
    }
}

/// Membership test requiring a sequence on one side.
fn contains(haystack: &Value, needle: &Value) -> Result<bool, EngineError> {
    match (haystack, needle) {
        (Value::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (_, Value::Array(items)) => Ok(items.iter().any(|item| values_equal(item, haystack))),
        _ => Err(EngineError::new(
            ErrorKind::Condition,
            "'in' / 'not_in' require a sequence on one side",
        )),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(lhs), Some(rhs)) = (as_number(left), as_number(right)) {
        return lhs == rhs;
    }
    left == right
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> Result<String, EngineError> {
    Ok(match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other)?,
    })
}
