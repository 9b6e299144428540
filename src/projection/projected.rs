//! Projected outputs and their serve-time reads.
//!
//! A projected value keeps the schema nodes that can produce it. Reads go
//! through those nodes so access is re-checked per document; when the
//! producing node cannot be pinned down the read fails instead of guessing.

use super::expression::query_error;
use crate::error::{Fault, FaultCategory, FaultResult};
use crate::permissions::{AccessContext, AccessLevel};
use crate::reporting::MetricsSink;
use crate::schema::{reader, NodeId, NodeType, SchemaNode, TypedModel};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// A concrete schema node in one of the candidate models.
#[derive(Clone)]
pub struct SourceRef {
    pub model: Arc<TypedModel>,
    pub node: NodeId,
}

impl SourceRef {
    pub fn new(model: Arc<TypedModel>, node: NodeId) -> Self {
        Self { model, node }
    }

    pub fn node(&self) -> &SchemaNode {
        self.model.node(self.node)
    }

    pub fn same_as(&self, other: &SourceRef) -> bool {
        Arc::ptr_eq(&self.model, &other.model) && self.node == other.node
    }

    /// The node or one of its ancestors carries a direct ACL.
    pub fn has_direct_acl(&self) -> bool {
        self.model
            .path_to_root(self.node)
            .into_iter()
            .any(|id| !self.model.node(id).acl.is_empty())
    }

    fn has_custom_read(&self) -> bool {
        let node = self.node();
        node.has_reader() || node.has_group_reader() || node.is_virtual
    }

    /// Read `parent[key]` through this source, whatever name the node has.
    fn read(&self, ac: &AccessContext, parent: &Value, key: &str, metrics: &dyn MetricsSink) -> FaultResult<Option<Value>> {
        let node = self.node();
        if node.name == key || !parent.is_object() {
            return reader::read_property(&self.model, self.node, ac, parent, &node.name, metrics);
        }
        let mut shim = parent.as_object().cloned().unwrap_or_default();
        match parent.get(key) {
            Some(value) => shim.insert(node.name.clone(), value.clone()),
            None => shim.remove(&node.name),
        };
        reader::read_property(&self.model, self.node, ac, &Value::Object(shim), &node.name, metrics)
    }
}

impl fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceRef({})", self.node().fqpp)
    }
}

/// Keep sources applicable to a raw document's `object` and `type`, then
/// prefer type overrides over the base nodes they replace.
fn relevant_sources<'s>(sources: &'s [SourceRef], raw: &Value) -> Vec<&'s SourceRef> {
    let object = raw.get("object").and_then(Value::as_str);
    let type_name = raw.get("type").and_then(Value::as_str);
    let applicable: Vec<&SourceRef> = sources
        .iter()
        .filter(|s| object.map_or(true, |o| s.model.object_name() == o))
        .filter(|s| match (&s.node().variant, type_name) {
            (None, _) => true,
            (Some(variant), Some(t)) => variant == t,
            (Some(_), None) => false,
        })
        .collect();
    applicable
        .iter()
        .copied()
        .filter(|candidate| {
            !applicable.iter().any(|other| {
                Arc::ptr_eq(&other.model, &candidate.model) && other.node().master == Some(candidate.node)
            })
        })
        .collect()
}

/// Narrow set-document sources by the discriminator found on the raw value
/// or the raw document.
fn discriminated<'s>(sources: &[&'s SourceRef], element: Option<&Value>, raw: &Value) -> Vec<&'s SourceRef> {
    let mut kept = Vec::new();
    for source in sources {
        let Some((set_node, discriminator)) = source.model.enclosing_set(source.node) else {
            return Vec::new();
        };
        let Some(set) = set_node.set() else {
            return Vec::new();
        };
        let key = &set.discriminator_key;
        let found = element
            .and_then(|e| e.get(key))
            .or_else(|| raw.get(key))
            .and_then(Value::as_str);
        if found == Some(discriminator) {
            kept.push(*source);
        }
    }
    kept
}

fn is_primitive(value: &Value) -> bool {
    match value {
        Value::Object(_) => false,
        Value::Array(items) => items.iter().all(is_primitive),
        _ => true,
    }
}

fn omitted(fault: &Fault) -> bool {
    matches!(fault.category, FaultCategory::NotFound | FaultCategory::AccessDenied)
}

#[derive(Debug, Clone)]
pub struct ProjectedNode {
    pub path: String,
    pub node_type: Option<NodeType>,
    pub array: bool,
    pub read_access: AccessLevel,
    /// Empty for computed values and amalgamated group keys.
    pub sources: Vec<SourceRef>,
}

impl ProjectedNode {
    pub fn computed<S: Into<String>>(path: S, read_access: AccessLevel) -> Self {
        Self {
            path: path.into(),
            node_type: None,
            array: false,
            read_access,
            sources: Vec::new(),
        }
    }

    pub fn single_source(&self) -> Option<&SourceRef> {
        match self.sources.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Read the output value `parent[key]` of a document whose raw form is `raw`.
    pub fn read(
        &self,
        ac: &AccessContext,
        raw: &Value,
        parent: &Value,
        key: &str,
        metrics: &dyn MetricsSink,
    ) -> FaultResult<Option<Value>> {
        let value = parent.get(key);
        if self.sources.is_empty() {
            if !ac.has_access(self.read_access) {
                return Err(Fault::access_denied("propertyRead").with_path(self.path.clone()));
            }
            return Ok(value.cloned());
        }
        if let Some(source) = self.single_source() {
            return source.read(ac, parent, key, metrics);
        }

        let mut relevant = relevant_sources(&self.sources, raw);
        if relevant.len() > 1 {
            let narrowed = discriminated(&relevant, value, raw);
            if !narrowed.is_empty() {
                relevant = narrowed;
            }
        }
        match relevant.as_slice() {
            [] => Ok(None),
            [only] => only.read(ac, parent, key, metrics),
            many => {
                let Some(value) = value else {
                    return Ok(None);
                };
                if is_primitive(value) && !many.iter().any(|s| s.has_custom_read()) {
                    let required = many
                        .iter()
                        .map(|s| s.node().read_access)
                        .fold(self.read_access, AccessLevel::max);
                    if !ac.has_access(required) {
                        return Err(Fault::access_denied("propertyRead").with_path(self.path.clone()));
                    }
                    return Ok(Some(value.clone()));
                }
                log::debug!("ambiguous projection {} across {} sources", self.path, many.len());
                Err(query_error("Ambiguous projection.").with_path(self.path.clone()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectedDocument {
    pub path: String,
    /// Computed sub-documents list their fields.
    pub children: Vec<(String, Projected)>,
    /// Model roots for natural (whole document) projections.
    pub sources: Vec<SourceRef>,
    pub read_access: AccessLevel,
}

impl ProjectedDocument {
    pub fn read(
        &self,
        ac: &AccessContext,
        raw: &Value,
        parent: &Value,
        key: &str,
        metrics: &dyn MetricsSink,
    ) -> FaultResult<Option<Value>> {
        let Some(value) = parent.get(key) else {
            return Ok(None);
        };
        if !self.children.is_empty() {
            return read_fields(&self.children, ac, raw, value, metrics).map(Some);
        }
        let relevant = relevant_sources(&self.sources, value);
        match relevant.as_slice() {
            [] => Ok(None),
            [root] => {
                let model = &root.model;
                let variant_root = model.variant_root(model.variant_for_document(value));
                reader::read_container(model, variant_root, ac, value, metrics).map(Some)
            }
            _ => Err(query_error("Ambiguous projection.").with_path(self.path.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Projected {
    Node(ProjectedNode),
    Document(ProjectedDocument),
}

impl Projected {
    pub fn path(&self) -> &str {
        match self {
            Self::Node(node) => &node.path,
            Self::Document(document) => &document.path,
        }
    }

    pub fn sources(&self) -> &[SourceRef] {
        match self {
            Self::Node(node) => &node.sources,
            Self::Document(document) => &document.sources,
        }
    }

    pub fn read_access(&self) -> AccessLevel {
        match self {
            Self::Node(node) => node.read_access,
            Self::Document(document) => document.read_access,
        }
    }

    pub fn read(
        &self,
        ac: &AccessContext,
        raw: &Value,
        parent: &Value,
        key: &str,
        metrics: &dyn MetricsSink,
    ) -> FaultResult<Option<Value>> {
        match self {
            Self::Node(node) => node.read(ac, raw, parent, key, metrics),
            Self::Document(document) => document.read(ac, raw, parent, key, metrics),
        }
    }
}

/// Read projected fields out of `value`, omitting what the caller cannot see.
pub(crate) fn read_fields(
    fields: &[(String, Projected)],
    ac: &AccessContext,
    raw: &Value,
    value: &Value,
    metrics: &dyn MetricsSink,
) -> FaultResult<Value> {
    let mut out = Map::new();
    for (name, projected) in fields {
        match projected.read(ac, raw, value, name, metrics) {
            Ok(Some(read)) => {
                out.insert(name.clone(), read);
            }
            Ok(None) => {}
            Err(fault) if omitted(&fault) => {}
            Err(fault) => return Err(fault),
        }
    }
    Ok(Value::Object(out))
}
