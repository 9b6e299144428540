//! A compiled object definition and its type variants.
//!
//! Base properties are shared by reference into every variant tree, so a
//! path defined on the base resolves to the same node whichever variant it is
//! looked up through. Variant-only properties and overrides of `overridable`
//! base properties are separate nodes owned by the variant.

use super::types::{DeleteHook, NodeChildren, NodeId, NodeType, SchemaNode};
use crate::error::{Fault, FaultResult};
use crate::permissions::AclEntry;
use crate::utils::json_path;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TypeVariant {
    pub id: String,
    pub name: String,
    pub root: NodeId,
    /// Variant-owned nodes (own properties and overrides).
    pub properties: Vec<NodeId>,
}

/// Result of resolving a type id or name.
#[derive(Debug, Clone, Copy)]
pub enum ModelVariant<'a> {
    Base,
    Typed(&'a TypeVariant),
}

impl<'a> ModelVariant<'a> {
    pub fn type_name(&self) -> Option<&'a str> {
        match self {
            Self::Base => None,
            Self::Typed(variant) => Some(variant.name.as_str()),
        }
    }
}

/// Outcome of the type guard for a write.
#[derive(Debug, Clone, Copy)]
pub struct TypeSelection<'a> {
    pub variant: ModelVariant<'a>,
    /// The document had a null type and is being typed now.
    pub retyped_from_null: bool,
}

pub struct TypedModel {
    pub(crate) object_name: String,
    pub(crate) label: Option<String>,
    pub(crate) typed: bool,
    pub(crate) unmanaged: bool,
    pub(crate) deletable: bool,
    pub(crate) obey_object_mode: bool,
    pub(crate) has_feeds: bool,
    pub(crate) migrating: bool,
    pub(crate) default_acl: Vec<AclEntry>,
    pub(crate) create_acl: Vec<AclEntry>,
    pub(crate) nodes: Vec<SchemaNode>,
    pub(crate) root: NodeId,
    pub(crate) variants: Vec<TypeVariant>,
    pub(crate) delete_hooks: Vec<Arc<dyn DeleteHook>>,
}

impl fmt::Debug for TypedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedModel")
            .field("object_name", &self.object_name)
            .field("typed", &self.typed)
            .field("unmanaged", &self.unmanaged)
            .field("nodes", &self.nodes.len())
            .field("variants", &self.variants)
            .finish()
    }
}

impl TypedModel {
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.object_name)
    }

    /// Documents of this model live in a collection named after the object.
    pub fn collection(&self) -> &str {
        &self.object_name
    }

    pub fn is_typed(&self) -> bool {
        self.typed
    }

    pub fn is_unmanaged(&self) -> bool {
        self.unmanaged
    }

    pub fn is_deletable(&self) -> bool {
        self.deletable
    }

    pub fn obeys_object_mode(&self) -> bool {
        self.obey_object_mode
    }

    pub fn has_feeds(&self) -> bool {
        self.has_feeds
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating
    }

    pub fn default_acl(&self) -> &[AclEntry] {
        &self.default_acl
    }

    pub fn create_acl(&self) -> &[AclEntry] {
        &self.create_acl
    }

    pub fn delete_hooks(&self) -> &[Arc<dyn DeleteHook>] {
        &self.delete_hooks
    }

    pub fn variants(&self) -> &[TypeVariant] {
        &self.variants
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &SchemaNode {
        &self.nodes[id.0]
    }

    pub fn variant_root(&self, variant: ModelVariant<'_>) -> NodeId {
        match variant {
            ModelVariant::Base => self.root,
            ModelVariant::Typed(variant) => variant.root,
        }
    }

    /// Look a variant up by id, then by name.
    pub fn variant_named(&self, type_id_or_name: &str) -> Option<&TypeVariant> {
        self.variants
            .iter()
            .find(|v| v.id == type_id_or_name)
            .or_else(|| self.variants.iter().find(|v| v.name == type_id_or_name))
    }

    /// Untyped models, missing types and unknown types all resolve to the base.
    pub fn resolve_variant(&self, type_id_or_name: Option<&str>) -> ModelVariant<'_> {
        match type_id_or_name {
            Some(name) if self.typed => self
                .variant_named(name)
                .map_or(ModelVariant::Base, ModelVariant::Typed),
            _ => ModelVariant::Base,
        }
    }

    /// Variant matching a document's stored `type`.
    pub fn variant_for_document(&self, document: &Value) -> ModelVariant<'_> {
        self.resolve_variant(document.get("type").and_then(Value::as_str))
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)
            .properties()
            .iter()
            .copied()
            .find(|id| self.node(*id).name == name)
    }

    pub fn find_node(&self, path: &str) -> Option<NodeId> {
        self.find_node_in(ModelVariant::Base, path)
    }

    pub fn find_node_in(&self, variant: ModelVariant<'_>, path: &str) -> Option<NodeId> {
        let parts = json_path::split(path);
        let mut found = Vec::new();
        self.collect(self.variant_root(variant), &parts, &mut found);
        found.first().copied()
    }

    /// The node for `path` in the base and then each variant, without repeats.
    pub fn find_node_across_variants(&self, path: &str) -> Vec<NodeId> {
        let mut found = Vec::new();
        let candidates = std::iter::once(ModelVariant::Base)
            .chain(self.variants.iter().map(ModelVariant::Typed))
            .filter_map(|variant| self.find_node_in(variant, path));
        for id in candidates {
            if !found.contains(&id) {
                found.push(id);
            }
        }
        found
    }

    /// Every node reachable at `path` through the base, each variant and each
    /// set document variant. Traversal stops at `Any` nodes.
    pub fn find_nodes(&self, path: &str) -> Vec<NodeId> {
        let parts = json_path::split(path);
        let mut found = Vec::new();
        let roots = std::iter::once(self.root).chain(self.variants.iter().map(|v| v.root));
        for root in roots {
            let mut local = Vec::new();
            self.collect(root, &parts, &mut local);
            for id in local {
                if !found.contains(&id) {
                    found.push(id);
                }
            }
        }
        found
    }

    fn collect(&self, id: NodeId, parts: &[&str], found: &mut Vec<NodeId>) {
        let node = self.node(id);
        let Some((head, rest)) = parts.split_first() else {
            found.push(id);
            return;
        };
        match &node.children {
            NodeChildren::Properties(_) => {
                if node.array && json_path::is_element_id(head) {
                    self.collect(id, rest, found);
                } else if let Some(child) = self.child(id, head) {
                    self.collect(child, rest, found);
                }
            }
            NodeChildren::Set(set) => {
                let parts = if json_path::is_element_id(head) { rest } else { parts };
                for document in set.documents() {
                    self.collect(document.node, parts, found);
                }
            }
            NodeChildren::Leaf => {
                if node.node_type == NodeType::Any {
                    found.push(id);
                }
            }
        }
    }

    /// `id` and its ancestors, leaf first, excluding the root.
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if node.is_root() {
                break;
            }
            chain.push(node_id);
            current = node.parent;
        }
        chain
    }

    /// Visit `id` and every node beneath it, including set documents.
    pub fn walk(&self, id: NodeId, visit: &mut dyn FnMut(&SchemaNode)) {
        let node = self.node(id);
        visit(node);
        match &node.children {
            NodeChildren::Properties(ids) => {
                for child in ids {
                    self.walk(*child, visit);
                }
            }
            NodeChildren::Set(set) => {
                for document in set.documents() {
                    self.walk(document.node, visit);
                }
            }
            NodeChildren::Leaf => {}
        }
    }

    /// The set node and discriminator value when `id` lives in a set document.
    pub fn enclosing_set(&self, id: NodeId) -> Option<(&SchemaNode, &str)> {
        let document = self.node(self.node(id).parent?);
        let set = self.node(document.parent?);
        set.set().map(|_| (set, document.name.as_str()))
    }

    /// Paths of properties flagged for cascading deletes.
    pub fn cascade_properties(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let roots = std::iter::once(self.root).chain(self.variants.iter().map(|v| v.root));
        for root in roots {
            self.walk(root, &mut |node| {
                if node.cascade_delete && !paths.contains(&node.fullpath) {
                    paths.push(node.fullpath.clone());
                }
            });
        }
        paths
    }

    /// Apply the type guard for a write of `payload` onto `document`.
    ///
    /// `type` may only be written while the document is new or its stored
    /// type is null. Any payload carrying `type` against a non-null stored
    /// type is rejected, whatever the value.
    pub fn select_variant_for_write(
        &self,
        document: &Value,
        payload: &Value,
        is_new: bool,
    ) -> FaultResult<TypeSelection<'_>> {
        let stored = document.get("type").and_then(Value::as_str);
        let requested = payload.get("type");
        if !self.typed {
            return Ok(TypeSelection {
                variant: ModelVariant::Base,
                retyped_from_null: false,
            });
        }
        match requested {
            Some(requested) => {
                if !is_new && stored.is_some() {
                    return Err(Fault::invalid_argument("instanceRetyping")
                        .with_reason("The type of an existing instance cannot be changed.")
                        .with_path("type"));
                }
                let name = requested
                    .as_str()
                    .ok_or_else(|| Fault::invalid_argument("nullInstanceType").with_path("type"))?;
                let variant = self.variant_named(name).ok_or_else(|| {
                    Fault::invalid_argument("instanceTypeMismatch")
                        .with_reason(format!("Unknown type '{}'.", name))
                        .with_path("type")
                })?;
                Ok(TypeSelection {
                    variant: ModelVariant::Typed(variant),
                    retyped_from_null: !is_new,
                })
            }
            None if is_new => Err(Fault::invalid_argument("nullInstanceType").with_path("type")),
            None => Ok(TypeSelection {
                variant: self.resolve_variant(stored),
                retyped_from_null: false,
            }),
        }
    }

    /// Fullpaths of every property under a variant, shared base properties
    /// included. All of them are marked modified when a null type is set.
    pub fn variant_property_paths(&self, variant: ModelVariant<'_>) -> Vec<String> {
        let ModelVariant::Typed(variant) = variant else {
            return Vec::new();
        };
        let mut paths = Vec::new();
        self.walk(variant.root, &mut |node| {
            if !node.is_root() && !paths.contains(&node.fullpath) {
                paths.push(node.fullpath.clone());
            }
        });
        paths
    }
}
