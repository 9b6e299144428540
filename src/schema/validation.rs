//! Document validation after a write.

use super::typed_model::{ModelVariant, TypedModel};
use super::types::{NodeChildren, NodeId};
use crate::error::{Fault, FaultResult};
use crate::permissions::AccessContext;
use crate::utils::json_path;
use serde_json::{Map, Value};

/// Which properties to validate.
#[derive(Debug, Clone, Copy)]
pub enum ValidationScope<'a> {
    All,
    /// Only properties overlapping one of these paths.
    Modified(&'a [String]),
}

impl ValidationScope<'_> {
    fn includes(&self, path: &str) -> bool {
        match self {
            Self::All => true,
            Self::Modified(paths) => paths.iter().any(|p| json_path::overlaps(p, path)),
        }
    }
}

pub fn validate_document(
    model: &TypedModel,
    variant: ModelVariant<'_>,
    ac: &AccessContext,
    document: &Value,
    scope: ValidationScope<'_>,
) -> FaultResult<()> {
    let map = document
        .as_object()
        .ok_or_else(|| Fault::invalid_argument("objectExpected"))?;
    validate_container(model, model.variant_root(variant), ac, map, scope)
}

fn validate_container(
    model: &TypedModel,
    container: NodeId,
    ac: &AccessContext,
    map: &Map<String, Value>,
    scope: ValidationScope<'_>,
) -> FaultResult<()> {
    for child in model.node(container).properties() {
        let node = model.node(*child);
        if !scope.includes(&node.fullpath) {
            continue;
        }
        match map.get(&node.name).filter(|v| !v.is_null()) {
            Some(value) => validate_value(model, *child, ac, value, scope)?,
            None if node.required => {
                return Err(Fault::invalid_argument("required")
                    .with_reason("Required property is missing.")
                    .with_path(node.fullpath.clone()))
            }
            None => {}
        }
    }
    Ok(())
}

fn validate_value(
    model: &TypedModel,
    id: NodeId,
    ac: &AccessContext,
    value: &Value,
    scope: ValidationScope<'_>,
) -> FaultResult<()> {
    let node = model.node(id);
    for validator in &node.capabilities.validators {
        validator.validate(ac, node, value)?;
    }
    let as_array = || {
        value.as_array().ok_or_else(|| {
            Fault::invalid_argument("castError")
                .with_reason("Expected an array.")
                .with_path(node.fullpath.clone())
        })
    };
    match &node.children {
        NodeChildren::Set(set) => {
            let elements = as_array()?;
            set.validate_array(node, elements)?;
            for element in elements {
                let variant = set.discern(element)?;
                if let Some(map) = element.as_object() {
                    validate_container(model, variant.node, ac, map, scope)?;
                }
            }
        }
        NodeChildren::Properties(_) if node.array => {
            for element in as_array()? {
                if let Some(map) = element.as_object() {
                    validate_container(model, id, ac, map, scope)?;
                }
            }
        }
        NodeChildren::Properties(_) => {
            if let Some(map) = value.as_object() {
                validate_container(model, id, ac, map, scope)?;
            }
        }
        NodeChildren::Leaf => {}
    }
    Ok(())
}
