//! Access-checked reads of stored values through schema nodes.

use super::typed_model::TypedModel;
use super::types::{NodeChildren, NodeId};
use crate::error::{Fault, FaultCategory, FaultResult};
use crate::permissions::AccessContext;
use crate::reporting::metrics::names;
use crate::reporting::MetricsSink;
use serde_json::{Map, Value};
use std::time::Instant;

/// Read `parent[key]` through node `id`.
///
/// Unreadable nodes are `notFound.property`; insufficient access is
/// `accessDenied.propertyRead`. Nested properties the caller cannot see are
/// omitted from the returned value.
pub fn read_property(
    model: &TypedModel,
    id: NodeId,
    ac: &AccessContext,
    parent: &Value,
    key: &str,
    metrics: &dyn MetricsSink,
) -> FaultResult<Option<Value>> {
    let node = model.node(id);
    if !node.readable {
        return Err(Fault::not_found("property").with_path(node.fullpath.clone()));
    }
    if !node.has_read_access(ac) {
        return Err(Fault::access_denied("propertyRead").with_path(node.fullpath.clone()));
    }
    metrics.increment(names::PROPERTY_READ, 1);
    let raw = parent.get(key);
    if let Some(reader) = &node.capabilities.reader {
        let started = Instant::now();
        let value = reader.read(ac, node, parent, raw);
        metrics.observe(names::READER_DURATION, started.elapsed());
        return value;
    }
    raw.map(|value| read_value(model, id, ac, value, metrics)).transpose()
}

fn read_value(
    model: &TypedModel,
    id: NodeId,
    ac: &AccessContext,
    value: &Value,
    metrics: &dyn MetricsSink,
) -> FaultResult<Value> {
    let node = model.node(id);
    match (&node.children, value) {
        (NodeChildren::Set(set), Value::Array(elements)) => {
            let mut out = Vec::with_capacity(elements.len());
            for element in elements {
                match set.discern(element) {
                    Ok(variant) => out.push(read_container(model, variant.node, ac, element, metrics)?),
                    Err(fault) => log::warn!("skipping set element at {}: {}", node.fullpath, fault),
                }
            }
            Ok(Value::Array(out))
        }
        (NodeChildren::Properties(_), Value::Array(elements)) if node.array => elements
            .iter()
            .map(|element| read_container(model, id, ac, element, metrics))
            .collect::<FaultResult<Vec<_>>>()
            .map(Value::Array),
        (NodeChildren::Properties(_), _) => read_container(model, id, ac, value, metrics),
        _ => Ok(value.clone()),
    }
}

/// Read every visible property of a document-shaped value.
pub fn read_container(
    model: &TypedModel,
    container: NodeId,
    ac: &AccessContext,
    value: &Value,
    metrics: &dyn MetricsSink,
) -> FaultResult<Value> {
    if !value.is_object() {
        return Ok(value.clone());
    }
    let mut out = Map::new();
    for child in model.node(container).properties() {
        let node = model.node(*child);
        match read_property(model, *child, ac, value, &node.name, metrics) {
            Ok(Some(read)) => {
                out.insert(node.name.clone(), read);
            }
            Ok(None) => {}
            Err(fault)
                if matches!(fault.category, FaultCategory::NotFound | FaultCategory::AccessDenied) => {}
            Err(fault) => return Err(fault),
        }
    }
    Ok(Value::Object(out))
}

/// Read a whole subject document through the variant matching its type.
pub fn read_document(
    model: &TypedModel,
    ac: &AccessContext,
    document: &Value,
    metrics: &dyn MetricsSink,
) -> FaultResult<Value> {
    let root = model.variant_root(model.variant_for_document(document));
    read_container(model, root, ac, document, metrics)
}
