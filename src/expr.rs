//! Invocation-scoped expression scopes and input resolution.
//!
//! Task input values may reference invocation state through `{{ path }}`
//! placeholders, e.g. `"{{ tasks.fetch.output }}"` or
//! `"{{ inputs.user_id }}"`. Resolution walks a scope built from the
//! invocation snapshot, so it is pure and non-blocking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::model::Invocation;

/// Variable scope for inline expression resolution.
pub type Scope = HashMap<String, Value>;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("unknown reference '{0}' in input expression")]
    UnknownReference(String),
}

/// Per-invocation scratch space for expression variables. Scopes are
/// rebuilt from the latest snapshot on each evaluation and dropped
/// when the invocation finishes.
#[derive(Default)]
pub struct ExpressionStore {
    scopes: Mutex<HashMap<Uuid, Scope>>,
}

impl ExpressionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the scope for an invocation snapshot and retain it.
    pub fn scope_for(&self, invocation: &Invocation) -> Scope {
        let scope = build_scope(invocation);
        self.scopes
            .lock()
            .expect("scope registry poisoned")
            .insert(invocation.id, scope.clone());
        scope
    }

    pub fn delete(&self, id: Uuid) {
        self.scopes.lock().expect("scope registry poisoned").remove(&id);
    }

    pub fn len(&self) -> usize {
        self.scopes.lock().expect("scope registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_scope(invocation: &Invocation) -> Scope {
    let mut scope = Scope::new();

    let inputs: Map<String, Value> = invocation
        .spec
        .inputs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    scope.insert("inputs".to_string(), Value::Object(inputs));

    let tasks: Map<String, Value> = invocation
        .tasks
        .iter()
        .map(|(task_id, run)| {
            (
                task_id.clone(),
                json!({
                    "status": run.status.as_str(),
                    "output": run.output.clone().unwrap_or(Value::Null),
                }),
            )
        })
        .collect();
    scope.insert("tasks".to_string(), Value::Object(tasks));

    scope.insert(
        "invocation".to_string(),
        json!({
            "id": invocation.id.to_string(),
            "workflow_id": invocation.spec.workflow_id.to_string(),
            "created_at": invocation.created_at.to_rfc3339(),
        }),
    );

    scope
}

/// Resolve every value in `inputs` against `scope`, replacing
/// placeholders and recursing into arrays and objects.
pub fn resolve_inputs(
    inputs: &HashMap<String, Value>,
    scope: &Scope,
) -> Result<HashMap<String, Value>, ExprError> {
    let start = Instant::now();
    let mut resolved = HashMap::with_capacity(inputs.len());
    for (key, value) in inputs {
        resolved.insert(key.clone(), resolve_value(value, scope)?);
    }
    metrics::histogram!("headway_expr_eval_duration_seconds").record(start.elapsed().as_secs_f64());
    Ok(resolved)
}

fn resolve_value(value: &Value, scope: &Scope) -> Result<Value, ExprError> {
    match value {
        Value::String(s) => match placeholder(s) {
            Some(path) => lookup(path, scope),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, scope).map(|v| (k.clone(), v)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn placeholder(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    Some(inner.trim())
}

fn lookup(path: &str, scope: &Scope) -> Result<Value, ExprError> {
    let mut segments = path.split('.');
    let root = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ExprError::UnknownReference(path.to_string()))?;
    let mut current = scope
        .get(root)
        .ok_or_else(|| ExprError::UnknownReference(path.to_string()))?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            _ => None,
        }
        .ok_or_else(|| ExprError::UnknownReference(path.to_string()))?;
    }
    Ok(current.clone())
}
