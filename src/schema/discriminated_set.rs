//! Arrays of heterogeneous sub-documents keyed by a discriminator.
//!
//! Every element carries an `_id` and a discriminator value naming the
//! [`DocumentVariant`] that validates and writes it. Elements whose
//! discriminator has no variant are rejected rather than dropped.

use super::types::{NodeId, RemovalHook, SchemaNode};
use super::typed_model::TypedModel;
use super::writer::{DocumentWriter, WriteContext};
use crate::error::{Fault, FaultResult};
use crate::permissions::AccessContext;
use crate::utils::json_path;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct DocumentVariant {
    pub name: String,
    pub node: NodeId,
    pub min_required: usize,
    pub max_allowed: Option<usize>,
    pub removal_hook: Option<Arc<dyn RemovalHook>>,
}

impl fmt::Debug for DocumentVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentVariant")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("min_required", &self.min_required)
            .field("max_allowed", &self.max_allowed)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DiscriminatedSet {
    pub discriminator_key: String,
    /// Property used to match payload elements to existing ones.
    pub unique_key: Option<String>,
    /// Property whose values must be distinct across all elements.
    pub unique_prop: Option<String>,
    pub min_items: usize,
    pub max_items: Option<usize>,
    /// Evict the oldest elements instead of overflowing `max_items`.
    pub max_shift: bool,
    pub(crate) documents: Vec<DocumentVariant>,
}

/// What a single element write did.
#[derive(Debug, Clone, PartialEq)]
pub struct SetWriteResult {
    pub id: String,
    pub position: usize,
    pub added: bool,
}

impl DiscriminatedSet {
    pub fn documents(&self) -> &[DocumentVariant] {
        &self.documents
    }

    pub fn variant(&self, discriminator: &str) -> Option<&DocumentVariant> {
        self.documents.iter().find(|d| d.name == discriminator)
    }

    fn discriminator_of<'v>(&self, element: &'v Value) -> Option<&'v str> {
        element.get(&self.discriminator_key).and_then(Value::as_str)
    }

    fn position_by_id(existing: &[Value], id: &str) -> Option<usize> {
        existing
            .iter()
            .position(|e| e.get("_id").and_then(Value::as_str) == Some(id))
    }

    /// Variant for an element already in the array.
    pub fn discern(&self, element: &Value) -> FaultResult<&DocumentVariant> {
        let discriminator = self.discriminator_of(element).ok_or_else(|| {
            Fault::invalid_argument("unspecified").with_reason("Missing discriminator key")
        })?;
        self.variant(discriminator).ok_or_else(|| {
            Fault::not_found("unspecified")
                .with_reason(format!("No document variant for discriminator '{}'", discriminator))
        })
    }

    /// Write one payload element into `existing`.
    ///
    /// The element is matched by `_id`, then by `unique_key`; an unmatched
    /// payload becomes a new element.
    pub fn write(
        &self,
        writer: &DocumentWriter<'_>,
        ac: &AccessContext,
        set_node: &SchemaNode,
        existing: &mut Vec<Value>,
        payload: Value,
        ctx: &mut WriteContext,
    ) -> FaultResult<SetWriteResult> {
        let Value::Object(mut payload) = payload else {
            return Err(Fault::invalid_argument("unspecified")
                .with_reason("Expected an object payload.")
                .with_path(set_node.fullpath.clone()));
        };

        let mut found_by_unique_key = false;
        let mut position = payload
            .get("_id")
            .and_then(Value::as_str)
            .and_then(|id| Self::position_by_id(existing, id));
        if position.is_none() {
            if let Some(key) = &self.unique_key {
                if let Some(wanted) = payload.get(key) {
                    position = existing.iter().position(|e| e.get(key) == Some(wanted));
                    found_by_unique_key = position.is_some();
                }
            }
        }

        let existing_discriminator = position
            .and_then(|p| self.discriminator_of(&existing[p]))
            .map(str::to_string);
        let discriminator = payload
            .get(&self.discriminator_key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| existing_discriminator.clone())
            .ok_or_else(|| {
                Fault::invalid_argument("unspecified")
                    .with_reason("Missing discriminator key")
                    .with_path(set_node.fullpath.clone())
            })?;
        let variant = self.variant(&discriminator).ok_or_else(|| {
            Fault::not_found("unspecified")
                .with_reason(format!("No document variant for discriminator '{}'", discriminator))
                .with_path(set_node.fullpath.clone())
        })?;

        let added = position.is_none();
        if added || existing_discriminator.as_deref() == Some(discriminator.as_str()) {
            payload.remove(&self.discriminator_key);
        }

        let (id, mut target) = match position {
            Some(p) => {
                let element = existing[p].as_object().cloned().ok_or_else(|| {
                    Fault::invalid_argument("unspecified").with_path(set_node.fullpath.clone())
                })?;
                let id = element.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
                (id, element)
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let mut element = Map::new();
                element.insert("_id".to_string(), Value::String(id.clone()));
                element.insert(self.discriminator_key.clone(), Value::String(discriminator.clone()));
                (id, element)
            }
        };

        // The working array only changes once the element write succeeded.
        let unique_key = self.unique_key.as_deref();
        let filter = |name: &str| name != "_id" && !(found_by_unique_key && Some(name) == unique_key);
        writer.write_properties(ac, variant.node, &mut target, &payload, &filter, added, ctx)?;
        if added {
            writer.apply_defaults(variant.node, &mut target);
        }

        let position = match position {
            Some(p) => {
                existing[p] = Value::Object(target);
                p
            }
            None => {
                existing.push(Value::Object(target));
                if self.max_shift {
                    if let Some(max) = self.max_items {
                        while existing.len() > max && existing.len() > 1 {
                            existing.remove(0);
                        }
                    }
                }
                existing.len() - 1
            }
        };
        ctx.mark_modified(&set_node.fullpath);

        Ok(SetWriteResult {
            id,
            position,
            added,
        })
    }

    /// Validate the array as a whole.
    pub fn validate_array(&self, set_node: &SchemaNode, elements: &[Value]) -> FaultResult<()> {
        if let Some(prop) = &self.unique_prop {
            let mut seen = HashSet::new();
            for element in elements {
                if let Some(value) = element.get(prop).filter(|v| !v.is_null()) {
                    if !seen.insert(value.to_string()) {
                        return Err(Fault::conflict("uniqueInArray")
                            .with_reason(format!("Duplicate value for {}", prop))
                            .with_path(json_path::join(&set_node.fullpath, prop)));
                    }
                }
            }
        }

        for element in elements {
            self.discern(element)
                .map_err(|fault| fault.with_path(set_node.fullpath.clone()))?;
        }

        if elements.len() < self.min_items {
            return Err(Fault::invalid_argument("minItems").with_path(set_node.fullpath.clone()));
        }
        if let Some(max) = self.max_items {
            if elements.len() > max {
                return Err(Fault::invalid_argument("maxItems").with_path(set_node.fullpath.clone()));
            }
        }

        for document in &self.documents {
            let count = elements
                .iter()
                .filter(|e| self.discriminator_of(e) == Some(document.name.as_str()))
                .count();
            if count < document.min_required {
                return Err(Fault::invalid_argument("minRequired")
                    .with_reason(format!("segment: {}", document.name))
                    .with_path(set_node.fullpath.clone()));
            }
            if let Some(max) = document.max_allowed {
                if count > max {
                    return Err(Fault::invalid_argument("maxAllowed")
                        .with_reason(format!("segment: {}", document.name))
                        .with_path(set_node.fullpath.clone()));
                }
            }
        }
        Ok(())
    }

    /// Notify the element's variant that it is being removed. An element
    /// without a known variant is logged and skipped.
    pub fn on_removing_value(&self, ac: &AccessContext, element: &Value) -> FaultResult<()> {
        match self.discern(element) {
            Ok(variant) => match &variant.removal_hook {
                Some(hook) => hook.on_removing_value(ac, element),
                None => Ok(()),
            },
            Err(fault) => {
                log::error!("set element removal without a variant: {}", fault);
                Ok(())
            }
        }
    }

    /// Schema node for `path` inside the element matched by id or index.
    pub fn discern_node(
        &self,
        model: &TypedModel,
        elements: &[Value],
        element_ref: &str,
        path: &str,
    ) -> Option<NodeId> {
        let element = Self::position_by_id(elements, element_ref)
            .or_else(|| element_ref.parse::<usize>().ok())
            .and_then(|p| elements.get(p))?;
        let variant = self.discern(element).ok()?;
        json_path::split(path)
            .into_iter()
            .try_fold(variant.node, |node, part| model.child(node, part))
    }
}
