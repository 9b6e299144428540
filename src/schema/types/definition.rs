//! Declarative model definitions, as stored per tenant.

use super::node::NodeType;
use crate::permissions::{AccessLevel, AclEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_true() -> bool {
    true
}

fn default_read() -> AccessLevel {
    AccessLevel::Read
}

fn default_update() -> AccessLevel {
    AccessLevel::Update
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Unmanaged models carry no creator, owner, ACL or version fields.
    #[serde(default)]
    pub unmanaged: bool,
    #[serde(default = "default_true")]
    pub deletable: bool,
    #[serde(default)]
    pub obey_object_mode: bool,
    /// Instances may have posts and comments attached.
    #[serde(default)]
    pub has_feeds: bool,
    /// A dataset migration is running; deletes are refused.
    #[serde(default)]
    pub migrating: bool,
    #[serde(default)]
    pub default_acl: Vec<AclEntry>,
    #[serde(default)]
    pub create_acl: Vec<AclEntry>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    /// Present (even empty) for typed models.
    #[serde(default)]
    pub types: Option<Vec<TypeDefinition>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub array: bool,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default = "default_true")]
    pub writable: bool,
    #[serde(default)]
    pub creatable: bool,
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    #[serde(default = "default_read")]
    pub read_access: AccessLevel,
    #[serde(default = "default_update")]
    pub write_access: AccessLevel,
    #[serde(default)]
    pub acl: Vec<AclEntry>,
    /// Type variants may redefine this property.
    #[serde(default)]
    pub overridable: bool,
    #[serde(default)]
    pub cascade_delete: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// Document properties.
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    /// Set options.
    #[serde(default)]
    pub discriminator_key: Option<String>,
    #[serde(default)]
    pub unique_key: Option<String>,
    #[serde(default)]
    pub unique_prop: Option<String>,
    #[serde(default)]
    pub min_items: usize,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub max_shift: bool,
    #[serde(default)]
    pub documents: Vec<DocumentDefinition>,
}

impl PropertyDefinition {
    /// A readable, writable property with default access levels.
    pub fn new<S: Into<String>>(name: S, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            node_type,
            array: false,
            readable: true,
            writable: true,
            creatable: false,
            removable: false,
            required: false,
            is_virtual: false,
            read_access: AccessLevel::Read,
            write_access: AccessLevel::Update,
            acl: Vec::new(),
            overridable: false,
            cascade_delete: false,
            default: None,
            properties: Vec::new(),
            discriminator_key: None,
            unique_key: None,
            unique_prop: None,
            min_items: 0,
            max_items: None,
            max_shift: false,
            documents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDefinition {
    pub name: String,
    #[serde(default)]
    pub min_required: usize,
    #[serde(default)]
    pub max_allowed: Option<usize>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}
