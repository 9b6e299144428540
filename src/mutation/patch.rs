//! The patch operation grammar.
//!
//! `{op, path?, value?, overwrite?}` entries are normalized into ordered
//! writes and leaf removals before any document is loaded.

use crate::error::{Fault, FaultResult};
use crate::schema::WriteMethod;
use crate::utils::json_path;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOperation {
    /// Write a nested payload.
    Write {
        method: WriteMethod,
        payload: Value,
        overwrite: bool,
    },
    /// Remove the value at `path`, or the listed primitives from it.
    Remove { path: String, values: Option<Vec<Value>> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPatch {
    pub operations: Vec<PatchOperation>,
    /// Last value any operation writes to the top-level `type`; `Null` when
    /// an operation removes it.
    pub type_write: Option<Value>,
}

impl NormalizedPatch {
    fn push(&mut self, operation: PatchOperation) {
        match &operation {
            PatchOperation::Write { payload, .. } => {
                if let Some(value) = payload.get("type") {
                    self.type_write = Some(value.clone());
                }
            }
            PatchOperation::Remove { path, .. } if path == "type" => {
                self.type_write = Some(Value::Null);
            }
            PatchOperation::Remove { .. } => {}
        }
        self.operations.push(operation);
    }

    /// Payload handed to the type guard: `{type}` when the patch touches it.
    pub fn type_payload(&self) -> Value {
        let mut payload = Map::new();
        if let Some(value) = &self.type_write {
            payload.insert("type".to_string(), value.clone());
        }
        Value::Object(payload)
    }
}

fn prefixed(prefix: Option<&str>, path: Option<String>) -> Option<String> {
    match (prefix, path) {
        (Some(prefix), Some(path)) => Some(json_path::join(prefix, &path)),
        (Some(prefix), None) => Some(prefix.to_string()),
        (None, path) => path,
    }
}

fn is_primitive(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_) | Value::Null)
}

/// Explode an object into one removal per leaf.
fn leaf_removals(value: &Value, prefix: &str, out: &mut Vec<PatchOperation>) {
    let Value::Object(map) = value else {
        return;
    };
    for (key, child) in map {
        let path = json_path::join(prefix, &json_path::normalize(key));
        match child {
            Value::Object(_) => leaf_removals(child, &path, out),
            Value::Array(items) => out.push(PatchOperation::Remove {
                path,
                values: Some(items.clone()),
            }),
            other => out.push(PatchOperation::Remove {
                path,
                values: Some(vec![other.clone()]),
            }),
        }
    }
}

fn remove_operation(path: String, value: Option<&Value>) -> FaultResult<PatchOperation> {
    let values = match value {
        None => None,
        Some(Value::Array(items)) => Some(items.clone()),
        Some(other) => Some(vec![other.clone()]),
    };
    if let Some(values) = &values {
        if !values.iter().all(is_primitive) {
            return Err(Fault::invalid_argument("primitiveExpectedforPatchRemoveValue").with_path(path));
        }
    }
    Ok(PatchOperation::Remove { path, values })
}

/// Normalize `ops` (one entry or an array), optionally under a path prefix.
pub fn normalize_patch_operations(ops: &Value, prefix: Option<&str>) -> FaultResult<NormalizedPatch> {
    let entries: Vec<Value> = match ops {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };
    let prefix = prefix.map(json_path::normalize).filter(|p| !p.is_empty());
    let prefix = prefix.as_deref();

    let mut patch = NormalizedPatch::default();
    let mut pending: std::collections::VecDeque<Map<String, Value>> = std::collections::VecDeque::new();
    for entry in entries {
        match entry {
            Value::Object(map) => pending.push_back(map),
            _ => return Err(Fault::invalid_argument("objectExpectedForPatchOperation")),
        }
    }

    while let Some(entry) = pending.pop_front() {
        let op = entry.get("op").and_then(Value::as_str).unwrap_or_default().to_string();
        let raw_path = entry.get("path");
        let path = raw_path
            .and_then(Value::as_str)
            .map(json_path::normalize)
            .filter(|p| !p.is_empty());
        let value = entry.get("value");

        match op.as_str() {
            "unset" => {
                let Some(Value::Object(keys)) = value else {
                    return Err(Fault::invalid_argument("objectExpectedForPatchValue"));
                };
                let base = prefixed(prefix, path).unwrap_or_default();
                for key in keys.keys() {
                    let path = json_path::join(&base, &json_path::normalize(key));
                    patch.push(PatchOperation::Remove { path, values: None });
                }
            }
            "pull" | "remove" if path.is_none() && matches!(value, Some(Value::Object(_))) => {
                let mut removals = Vec::new();
                leaf_removals(value.unwrap_or(&Value::Null), prefix.unwrap_or_default(), &mut removals);
                for removal in removals {
                    if let PatchOperation::Remove {
                        path,
                        values: Some(values),
                    } = &removal
                    {
                        if !values.iter().all(is_primitive) {
                            return Err(Fault::invalid_argument("primitiveExpectedforPatchRemoveValue")
                                .with_path(path.clone()));
                        }
                    }
                    patch.push(removal);
                }
            }
            "pull" => {
                let (Some(path), Some(value)) = (path, value) else {
                    return Err(Fault::invalid_argument("pathAndValueExpectedForPullOperation"));
                };
                let path = prefixed(prefix, Some(path)).unwrap_or_default();
                patch.push(remove_operation(path, Some(value))?);
            }
            "remove" => {
                let path = prefixed(prefix, path)
                    .ok_or_else(|| Fault::invalid_argument("stringExpectedforPatchPath"))?;
                patch.push(remove_operation(path, value)?);
            }
            "set" | "push" => {
                let value = value
                    .cloned()
                    .ok_or_else(|| Fault::invalid_argument("valueExpectedForPatchValue"))?;
                if raw_path.is_some() && path.is_none() {
                    return Err(Fault::invalid_argument("stringExpectedforPatchPath"));
                }
                let single_path = prefixed(prefix, path);
                let payload = match &single_path {
                    Some(path) => json_path::path_to_payload(path, value),
                    None if value.is_object() => value,
                    None => return Err(Fault::invalid_argument("objectExpectedForPatchValue")),
                };
                let overwrite = op == "set" && entry.get("overwrite").and_then(Value::as_bool).unwrap_or(false);
                patch.push(PatchOperation::Write {
                    method: if op == "set" { WriteMethod::Put } else { WriteMethod::Post },
                    payload,
                    overwrite,
                });
            }
            other => {
                return Err(Fault::unsupported("patchOp").with_path(other.to_string()));
            }
        }
    }
    Ok(patch)
}
