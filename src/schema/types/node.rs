//! Compiled schema nodes.
//!
//! Nodes live in a per-model arena and refer to each other by [`NodeId`].
//! They are immutable once the model is built.

use super::capabilities::NodeCapabilities;
use crate::permissions::{AccessContext, AccessLevel, AclEntry};
use crate::schema::discriminated_set::DiscriminatedSet;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Document,
    Set,
    Reference,
    List,
    Any,
}

impl NodeType {
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::String | Self::Number | Self::Boolean | Self::Date | Self::ObjectId
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub enum NodeChildren {
    Leaf,
    Properties(Vec<NodeId>),
    Set(DiscriminatedSet),
}

#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub id: NodeId,
    pub name: String,
    /// Logical path from the model root; set documents share their set's path.
    pub fullpath: String,
    /// Unique id, `object[#type].path` with `#discriminator` after set segments.
    pub fqpp: String,
    pub node_type: NodeType,
    pub array: bool,
    pub readable: bool,
    pub writable: bool,
    /// Writable while the containing document is being created.
    pub creatable: bool,
    pub removable: bool,
    pub required: bool,
    pub is_virtual: bool,
    pub read_access: AccessLevel,
    pub write_access: AccessLevel,
    pub acl: Vec<AclEntry>,
    pub cascade_delete: bool,
    /// Applied when a document is created without this property.
    pub default_value: Option<serde_json::Value>,
    pub parent: Option<NodeId>,
    /// The base node this type-specific node overrides.
    pub master: Option<NodeId>,
    /// Type variant owning this node; `None` for base nodes.
    pub variant: Option<String>,
    pub children: NodeChildren,
    pub capabilities: NodeCapabilities,
}

impl SchemaNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn set(&self) -> Option<&DiscriminatedSet> {
        match &self.children {
            NodeChildren::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn properties(&self) -> &[NodeId] {
        match &self.children {
            NodeChildren::Properties(ids) => ids,
            _ => &[],
        }
    }

    pub fn has_reader(&self) -> bool {
        self.capabilities.reader.is_some()
    }

    pub fn has_group_reader(&self) -> bool {
        self.capabilities.group_reader.is_some()
    }

    /// Whether the caller reaches `read_access`, consulting the node ACL only
    /// when the context alone falls short.
    pub fn has_read_access(&self, ac: &AccessContext) -> bool {
        let mut resolved = ac.resolved();
        if resolved < self.read_access && !self.acl.is_empty() {
            resolved = resolved.max(ac.resolve_with_grants(&self.acl));
        }
        resolved >= self.read_access
    }

    pub fn has_write_access(&self, ac: &AccessContext) -> bool {
        let mut resolved = ac.resolved();
        if !self.acl.is_empty() {
            resolved = resolved.max(ac.resolve_with_grants(&self.acl));
        }
        resolved >= self.write_access
    }

    /// Same shape and access as `other`, ignoring capabilities.
    pub fn is_equivalent_to(&self, other: &SchemaNode) -> bool {
        self.node_type == other.node_type
            && self.array == other.array
            && self.read_access == other.read_access
            && self.write_access == other.write_access
    }
}
