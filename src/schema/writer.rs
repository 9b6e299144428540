//! Ordered writes and removals against a compiled model.
//!
//! Payload properties are applied in schema declaration order. Every written
//! path is recorded in the [`WriteContext`] so validation can be limited to
//! what changed.

use super::typed_model::{ModelVariant, TypedModel};
use super::types::{NodeChildren, NodeId, NodeType, SchemaNode};
use crate::error::{Fault, FaultResult};
use crate::permissions::AccessContext;
use crate::utils::json_path;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    /// Replace values (arrays included).
    Put,
    /// Append to arrays.
    Post,
}

#[derive(Debug, Clone)]
pub struct WriteContext {
    pub method: WriteMethod,
    pub is_new: bool,
    /// Replace whole sets and document arrays instead of merging by `_id`.
    pub overwrite: bool,
    modified: Vec<String>,
}

impl WriteContext {
    pub fn create() -> Self {
        Self {
            method: WriteMethod::Put,
            is_new: true,
            overwrite: false,
            modified: Vec::new(),
        }
    }

    pub fn update(method: WriteMethod) -> Self {
        Self {
            method,
            is_new: false,
            overwrite: false,
            modified: Vec::new(),
        }
    }

    pub fn mark_modified(&mut self, path: &str) {
        if !self.modified.iter().any(|p| p == path) {
            self.modified.push(path.to_string());
        }
    }

    pub fn modified(&self) -> &[String] {
        &self.modified
    }

    pub fn is_modified(&self, path: &str) -> bool {
        self.modified.iter().any(|p| json_path::overlaps(p, path))
    }
}

fn cast_error(node: &SchemaNode) -> Fault {
    Fault::invalid_argument("castError")
        .with_reason(format!("Expected {}", node.node_type))
        .with_path(node.fullpath.clone())
}

fn not_writable(node: &SchemaNode) -> Fault {
    Fault::access_denied("propertyUpdate")
        .with_reason("Property is not writable.")
        .with_path(node.fullpath.clone())
}

fn cast_scalar(node: &SchemaNode, value: &Value) -> FaultResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match node.node_type {
        NodeType::String => value.as_str().map(|_| value.clone()).ok_or_else(|| cast_error(node)),
        NodeType::Number => value.is_number().then(|| value.clone()).ok_or_else(|| cast_error(node)),
        NodeType::Boolean => value.is_boolean().then(|| value.clone()).ok_or_else(|| cast_error(node)),
        NodeType::Date => value
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|date| Value::String(date.with_timezone(&chrono::Utc).to_rfc3339()))
            .ok_or_else(|| cast_error(node)),
        NodeType::ObjectId => value
            .as_str()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(|id| Value::String(id.to_string()))
            .ok_or_else(|| cast_error(node)),
        NodeType::Reference => {
            let id = value
                .as_str()
                .or_else(|| value.get("_id").and_then(Value::as_str))
                .ok_or_else(|| cast_error(node))?;
            let mut reference = Map::new();
            reference.insert("_id".to_string(), Value::String(id.to_string()));
            Ok(Value::Object(reference))
        }
        NodeType::List => Err(Fault::unsupported("unspecified")
            .with_reason("Lists cannot be written directly.")
            .with_path(node.fullpath.clone())),
        NodeType::Any | NodeType::Document | NodeType::Set => Ok(value.clone()),
    }
}

fn cast_value(node: &SchemaNode, value: &Value) -> FaultResult<Value> {
    if !node.array || value.is_null() {
        return cast_scalar(node, value);
    }
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| cast_scalar(node, item))
            .collect::<FaultResult<Vec<_>>>()
            .map(Value::Array),
        other => Ok(Value::Array(vec![cast_scalar(node, other)?])),
    }
}

fn array_items(node: &SchemaNode, value: &Value) -> FaultResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(_) => Ok(vec![value.clone()]),
        Value::Null => Ok(Vec::new()),
        _ => Err(cast_error(node)),
    }
}

fn element_position(elements: &[Value], element_ref: &str) -> Option<usize> {
    elements
        .iter()
        .position(|e| e.get("_id").and_then(Value::as_str) == Some(element_ref))
        .or_else(|| element_ref.parse::<usize>().ok().filter(|i| *i < elements.len()))
}

/// Writes payloads through one variant of a model.
pub struct DocumentWriter<'m> {
    model: &'m TypedModel,
    root: NodeId,
}

impl<'m> DocumentWriter<'m> {
    pub fn new(model: &'m TypedModel, variant: ModelVariant<'_>) -> Self {
        Self {
            model,
            root: model.variant_root(variant),
        }
    }

    pub fn model(&self) -> &'m TypedModel {
        self.model
    }

    pub fn write(
        &self,
        ac: &AccessContext,
        document: &mut Value,
        payload: &Value,
        ctx: &mut WriteContext,
    ) -> FaultResult<()> {
        let payload = payload.as_object().ok_or_else(|| {
            Fault::invalid_argument("objectExpected").with_reason("Expected an object payload.")
        })?;
        let target = document
            .as_object_mut()
            .ok_or_else(|| Fault::invalid_argument("objectExpected"))?;
        let creating = ctx.is_new;
        self.write_properties(ac, self.root, target, payload, &|_| true, creating, ctx)?;
        if creating {
            self.apply_defaults(self.root, target);
        }
        Ok(())
    }

    /// Write the payload keys accepted by `filter` into `target`, in the
    /// order `container` declares its properties.
    #[allow(clippy::too_many_arguments)]
    pub fn write_properties(
        &self,
        ac: &AccessContext,
        container: NodeId,
        target: &mut Map<String, Value>,
        payload: &Map<String, Value>,
        filter: &dyn Fn(&str) -> bool,
        creating: bool,
        ctx: &mut WriteContext,
    ) -> FaultResult<()> {
        let container_node = self.model.node(container);
        if let Some(unknown) = payload
            .keys()
            .find(|key| filter(key) && self.model.child(container, key).is_none())
        {
            return Err(Fault::not_found("property")
                .with_path(json_path::join(&container_node.fullpath, unknown)));
        }
        for child in container_node.properties() {
            let name = &self.model.node(*child).name;
            if !filter(name) {
                continue;
            }
            if let Some(value) = payload.get(name) {
                self.write_property(ac, *child, target, value, creating, ctx)?;
            }
        }
        Ok(())
    }

    fn write_property(
        &self,
        ac: &AccessContext,
        id: NodeId,
        target: &mut Map<String, Value>,
        value: &Value,
        creating: bool,
        ctx: &mut WriteContext,
    ) -> FaultResult<()> {
        let node = self.model.node(id);
        if !(node.writable || (creating && node.creatable)) {
            return Err(not_writable(node));
        }
        if !node.has_write_access(ac) {
            return Err(Fault::access_denied("propertyUpdate").with_path(node.fullpath.clone()));
        }

        match &node.children {
            NodeChildren::Set(set) => {
                let items = array_items(node, value)?;
                let mut existing = match target.remove(&node.name) {
                    Some(Value::Array(elements)) => elements,
                    _ => Vec::new(),
                };
                if ctx.overwrite || (value.is_null() && ctx.method == WriteMethod::Put) {
                    for removed in existing.drain(..) {
                        set.on_removing_value(ac, &removed)?;
                    }
                }
                let outcome = items
                    .into_iter()
                    .try_for_each(|item| set.write(self, ac, node, &mut existing, item, ctx).map(|_| ()));
                target.insert(node.name.clone(), Value::Array(existing));
                outcome?;
                ctx.mark_modified(&node.fullpath);
            }
            NodeChildren::Properties(_) if node.array => {
                let items = array_items(node, value)?;
                let mut existing = match target.remove(&node.name) {
                    Some(Value::Array(elements)) if !ctx.overwrite => elements,
                    _ => Vec::new(),
                };
                let outcome = items
                    .iter()
                    .try_for_each(|item| self.write_array_element(ac, node, &mut existing, item, ctx));
                target.insert(node.name.clone(), Value::Array(existing));
                outcome?;
                ctx.mark_modified(&node.fullpath);
            }
            NodeChildren::Properties(_) => {
                if value.is_null() {
                    target.insert(node.name.clone(), Value::Null);
                    ctx.mark_modified(&node.fullpath);
                    return Ok(());
                }
                let payload = value.as_object().ok_or_else(|| cast_error(node))?;
                let was_missing = !matches!(target.get(&node.name), Some(Value::Object(_)));
                if was_missing {
                    target.insert(node.name.clone(), Value::Object(Map::new()));
                }
                if let Some(Value::Object(sub)) = target.get_mut(&node.name) {
                    self.write_properties(ac, id, sub, payload, &|_| true, creating || was_missing, ctx)?;
                    if was_missing {
                        self.apply_defaults(id, sub);
                    }
                }
                ctx.mark_modified(&node.fullpath);
            }
            NodeChildren::Leaf => {
                let mut cast = cast_value(node, value)?;
                if let Some(writer) = &node.capabilities.writer {
                    cast = writer.write(ac, node, cast)?;
                }
                let appended = match (node.array, ctx.method, cast, target.get_mut(&node.name)) {
                    (true, WriteMethod::Post, Value::Array(items), Some(Value::Array(current))) => {
                        current.extend(items);
                        None
                    }
                    (_, _, cast, _) => Some(cast),
                };
                if let Some(cast) = appended {
                    target.insert(node.name.clone(), cast);
                }
                ctx.mark_modified(&node.fullpath);
            }
        }
        Ok(())
    }

    fn write_array_element(
        &self,
        ac: &AccessContext,
        node: &SchemaNode,
        existing: &mut Vec<Value>,
        item: &Value,
        ctx: &mut WriteContext,
    ) -> FaultResult<()> {
        let payload = item.as_object().ok_or_else(|| cast_error(node))?;
        let position = payload
            .get("_id")
            .and_then(Value::as_str)
            .and_then(|id| element_position(existing, id));
        let (position, added) = match position {
            Some(p) => (p, false),
            None => {
                let mut element = Map::new();
                element.insert("_id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
                existing.push(Value::Object(element));
                (existing.len() - 1, true)
            }
        };
        if let Some(Value::Object(element)) = existing.get_mut(position) {
            self.write_properties(ac, node.id, element, payload, &|name| name != "_id", added, ctx)?;
            if added {
                self.apply_defaults(node.id, element);
            }
        }
        Ok(())
    }

    /// Fill declared defaults for properties absent from `target`.
    pub fn apply_defaults(&self, container: NodeId, target: &mut Map<String, Value>) {
        for child in self.model.node(container).properties() {
            let node = self.model.node(*child);
            if let Some(default) = &node.default_value {
                target
                    .entry(node.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }

    /// Remove the value at `path`.
    ///
    /// The last segment may name a property, a set or document-array element
    /// (by `_id` or index), or a scalar inside a primitive array.
    pub fn remove(
        &self,
        ac: &AccessContext,
        document: &mut Value,
        path: &str,
        ctx: &mut WriteContext,
    ) -> FaultResult<()> {
        let parts = json_path::split(path);
        if parts.is_empty() {
            return Err(Fault::invalid_argument("stringExpectedforPatchPath"));
        }
        let target = document
            .as_object_mut()
            .ok_or_else(|| Fault::invalid_argument("objectExpected"))?;
        self.remove_in(ac, self.root, target, &parts, path, ctx)
    }

    fn remove_in(
        &self,
        ac: &AccessContext,
        container: NodeId,
        target: &mut Map<String, Value>,
        parts: &[&str],
        full_path: &str,
        ctx: &mut WriteContext,
    ) -> FaultResult<()> {
        let missing = || Fault::not_found("property").with_path(full_path.to_string());
        let (head, rest) = parts.split_first().ok_or_else(missing)?;
        let id = self.model.child(container, head).ok_or_else(missing)?;
        let node = self.model.node(id);
        if !node.has_write_access(ac) {
            return Err(Fault::access_denied("propertyUpdate").with_path(node.fullpath.clone()));
        }

        if rest.is_empty() {
            if !node.writable || (node.required && !node.removable) {
                return Err(not_writable(node));
            }
            if let (Some(set), Some(Value::Array(elements))) = (node.set(), target.get(&node.name)) {
                for element in elements {
                    set.on_removing_value(ac, element)?;
                }
            }
            if target.remove(&node.name).is_some() {
                ctx.mark_modified(&node.fullpath);
            }
            return Ok(());
        }

        match &node.children {
            NodeChildren::Set(set) => {
                let Some(Value::Array(elements)) = target.get_mut(&node.name) else {
                    return Err(missing());
                };
                let element_ref = rest[0];
                let position = element_position(elements, element_ref).ok_or_else(missing)?;
                if rest.len() == 1 {
                    let removed = elements.remove(position);
                    set.on_removing_value(ac, &removed)?;
                    ctx.mark_modified(&node.fullpath);
                    return Ok(());
                }
                let variant_node = set
                    .discern_node(self.model, elements, element_ref, "")
                    .ok_or_else(missing)?;
                match elements.get_mut(position) {
                    Some(Value::Object(element)) => {
                        self.remove_in(ac, variant_node, element, &rest[1..], full_path, ctx)
                    }
                    _ => Err(missing()),
                }
            }
            NodeChildren::Properties(_) if node.array => {
                let Some(Value::Array(elements)) = target.get_mut(&node.name) else {
                    return Err(missing());
                };
                let position = element_position(elements, rest[0]).ok_or_else(missing)?;
                if rest.len() == 1 {
                    elements.remove(position);
                    ctx.mark_modified(&node.fullpath);
                    return Ok(());
                }
                match elements.get_mut(position) {
                    Some(Value::Object(element)) => {
                        self.remove_in(ac, id, element, &rest[1..], full_path, ctx)
                    }
                    _ => Err(missing()),
                }
            }
            NodeChildren::Properties(_) => match target.get_mut(&node.name) {
                Some(Value::Object(sub)) => self.remove_in(ac, id, sub, rest, full_path, ctx),
                _ => Err(missing()),
            },
            NodeChildren::Leaf if node.array && rest.len() == 1 => {
                if let Some(Value::Array(items)) = target.get_mut(&node.name) {
                    let before = items.len();
                    items.retain(|item| !json_path::scalar_matches(item, rest[0]));
                    if items.len() != before {
                        ctx.mark_modified(&node.fullpath);
                    }
                }
                Ok(())
            }
            NodeChildren::Leaf if node.node_type == NodeType::Any => {
                let mut current = target.get_mut(&node.name);
                for part in &rest[..rest.len() - 1] {
                    current = current.and_then(|value| value.get_mut(*part));
                }
                if let Some(Value::Object(map)) = current {
                    if map.remove(rest[rest.len() - 1]).is_some() {
                        ctx.mark_modified(&node.fullpath);
                    }
                }
                Ok(())
            }
            NodeChildren::Leaf => Err(missing()),
        }
    }
}
