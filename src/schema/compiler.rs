//! Compiles a [`ModelDefinition`] into a [`TypedModel`].
//!
//! Capabilities cannot be expressed in stored definitions, so they are
//! attached by path while compiling:
//!
//! ```ignore
//! let model = ModelCompiler::new(definition)
//!     .validator("c_title", Arc::new(NonEmpty))
//!     .removal_hook("c_segments", "image", Arc::new(ReleaseFile))
//!     .compile()?;
//! ```

use super::discriminated_set::{DiscriminatedSet, DocumentVariant};
use super::typed_model::{TypeVariant, TypedModel};
use super::types::{
    DeleteHook, GroupReader, ModelDefinition, NodeCapabilities, NodeChildren, NodeId, NodeType,
    PropertyDefinition, PropertyReader, PropertyValidator, PropertyWriter, RemovalHook, SchemaNode,
};
use crate::constants::DEFAULT_DISCRIMINATOR_KEY;
use crate::error::{Fault, FaultResult};
use crate::permissions::AccessLevel;
use crate::utils::json_path;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

static PROPERTY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid property name pattern"));

/// Names the compiler adds itself; user properties may not reuse them.
const BUILT_IN_NAMES: &[&str] = &[
    "_id", "object", "org", "type", "creator", "owner", "acl", "sequence", "created", "updated", "reap",
];

fn definition_error<S: Into<String>>(reason: S) -> Fault {
    Fault::invalid_argument("schemaDefinition").with_reason(reason)
}

enum Attachment {
    Reader(Arc<dyn PropertyReader>),
    Writer(Arc<dyn PropertyWriter>),
    GroupReader(Arc<dyn GroupReader>),
    Validator(Arc<dyn PropertyValidator>),
}

pub struct ModelCompiler {
    definition: ModelDefinition,
    attachments: Vec<(String, Attachment)>,
    removal_hooks: Vec<(String, String, Arc<dyn RemovalHook>)>,
    delete_hooks: Vec<Arc<dyn DeleteHook>>,
}

impl ModelCompiler {
    pub fn new(definition: ModelDefinition) -> Self {
        Self {
            definition,
            attachments: Vec::new(),
            removal_hooks: Vec::new(),
            delete_hooks: Vec::new(),
        }
    }

    /// Attach a reader to every node at `path` (base, variants, set documents).
    #[must_use]
    pub fn reader(mut self, path: &str, reader: Arc<dyn PropertyReader>) -> Self {
        self.attachments.push((path.to_string(), Attachment::Reader(reader)));
        self
    }

    #[must_use]
    pub fn writer(mut self, path: &str, writer: Arc<dyn PropertyWriter>) -> Self {
        self.attachments.push((path.to_string(), Attachment::Writer(writer)));
        self
    }

    #[must_use]
    pub fn group_reader(mut self, path: &str, reader: Arc<dyn GroupReader>) -> Self {
        self.attachments.push((path.to_string(), Attachment::GroupReader(reader)));
        self
    }

    #[must_use]
    pub fn validator(mut self, path: &str, validator: Arc<dyn PropertyValidator>) -> Self {
        self.attachments.push((path.to_string(), Attachment::Validator(validator)));
        self
    }

    #[must_use]
    pub fn removal_hook(mut self, set_path: &str, discriminator: &str, hook: Arc<dyn RemovalHook>) -> Self {
        self.removal_hooks
            .push((set_path.to_string(), discriminator.to_string(), hook));
        self
    }

    #[must_use]
    pub fn delete_hook(mut self, hook: Arc<dyn DeleteHook>) -> Self {
        self.delete_hooks.push(hook);
        self
    }

    pub fn compile(self) -> FaultResult<TypedModel> {
        let definition = &self.definition;
        validate_name(&definition.name)?;

        let mut arena = Arena::default();
        let object = definition.name.clone();
        let root = arena.push_root(&object, object.clone(), None);

        for property in &definition.properties {
            if BUILT_IN_NAMES.contains(&property.name.as_str()) {
                return Err(definition_error(format!(
                    "'{}' is a built-in property",
                    property.name
                )));
            }
        }
        let mut base_children = Vec::new();
        for property in built_in_properties(definition)
            .iter()
            .chain(definition.properties.iter())
        {
            if arena.has_child(&base_children, &property.name) {
                return Err(definition_error(format!("Duplicate property '{}'", property.name)));
            }
            let id = arena.compile_property(property, root, "", &object, None)?;
            base_children.push(id);
        }
        arena.nodes[root.0].children = NodeChildren::Properties(base_children.clone());

        let mut variants = Vec::new();
        for type_definition in definition.types.iter().flatten() {
            validate_name(&type_definition.name)?;
            if variants.iter().any(|v: &TypeVariant| v.name == type_definition.name) {
                return Err(definition_error(format!("Duplicate type '{}'", type_definition.name)));
            }
            let type_name = type_definition.name.clone();
            let prefix = format!("{}#{}", object, type_name);
            let variant_root = arena.push_root(&object, prefix.clone(), Some(type_name.clone()));
            let mut children = base_children.clone();
            let mut own = Vec::new();
            for property in &type_definition.properties {
                if BUILT_IN_NAMES.contains(&property.name.as_str()) {
                    return Err(definition_error(format!(
                        "'{}' is a built-in property",
                        property.name
                    )));
                }
                if arena.has_child(&own, &property.name) {
                    return Err(definition_error(format!("Duplicate property '{}'", property.name)));
                }
                let id = arena.compile_property(property, variant_root, "", &prefix, Some(&type_name))?;
                let base = children
                    .iter()
                    .position(|c| arena.nodes[c.0].name == property.name);
                match base {
                    Some(position) => {
                        let master = children[position];
                        let base_node = &arena.nodes[master.0];
                        if !arena.overridable.contains(&master) {
                            return Err(definition_error(format!(
                                "Type '{}' cannot override '{}'",
                                type_name, property.name
                            )));
                        }
                        if !arena.nodes[id.0].is_equivalent_to(base_node) {
                            return Err(definition_error(format!(
                                "Override of '{}' in type '{}' must keep type and access levels",
                                property.name, type_name
                            )));
                        }
                        arena.nodes[id.0].master = Some(master);
                        children[position] = id;
                    }
                    None => children.push(id),
                }
                own.push(id);
            }
            arena.nodes[variant_root.0].children = NodeChildren::Properties(children);
            variants.push(TypeVariant {
                id: type_definition
                    .id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: type_name,
                root: variant_root,
                properties: own,
            });
        }

        let mut model = TypedModel {
            object_name: object,
            label: definition.label.clone(),
            typed: definition.types.is_some(),
            unmanaged: definition.unmanaged,
            deletable: definition.deletable,
            obey_object_mode: definition.obey_object_mode,
            has_feeds: definition.has_feeds,
            migrating: definition.migrating,
            default_acl: definition.default_acl.clone(),
            create_acl: definition.create_acl.clone(),
            nodes: arena.nodes,
            root,
            variants,
            delete_hooks: self.delete_hooks,
        };

        for (path, attachment) in self.attachments {
            let targets = model.find_nodes(&path);
            if targets.is_empty() {
                return Err(Fault::not_found("property").with_path(path));
            }
            for id in targets {
                let node = &mut model.nodes[id.0];
                let capabilities: &mut NodeCapabilities = &mut node.capabilities;
                match &attachment {
                    Attachment::Reader(_) | Attachment::GroupReader(_) if node.node_type == NodeType::Set => {
                        return Err(definition_error(format!("Sets cannot have readers ({})", path)));
                    }
                    Attachment::Reader(reader) => capabilities.reader = Some(reader.clone()),
                    Attachment::Writer(writer) => capabilities.writer = Some(writer.clone()),
                    Attachment::GroupReader(reader) => capabilities.group_reader = Some(reader.clone()),
                    Attachment::Validator(validator) => capabilities.validators.push(validator.clone()),
                }
            }
        }

        for (set_path, discriminator, hook) in self.removal_hooks {
            let targets: Vec<NodeId> = model
                .find_nodes(&set_path)
                .into_iter()
                .filter(|id| model.node(*id).node_type == NodeType::Set)
                .collect();
            if targets.is_empty() {
                return Err(Fault::not_found("property").with_path(set_path));
            }
            for id in targets {
                let variant = match &mut model.nodes[id.0].children {
                    NodeChildren::Set(set) => set.documents.iter_mut().find(|d| d.name == discriminator),
                    _ => None,
                };
                let variant = variant.ok_or_else(|| {
                    Fault::not_found("unspecified")
                        .with_reason(format!("No document variant '{}'", discriminator))
                        .with_path(set_path.clone())
                })?;
                variant.removal_hook = Some(hook.clone());
            }
        }

        log::debug!(
            "compiled model {} with {} nodes and {} types",
            model.object_name,
            model.nodes.len(),
            model.variants.len()
        );
        Ok(model)
    }
}

fn validate_name(name: &str) -> FaultResult<()> {
    if PROPERTY_NAME.is_match(name) {
        Ok(())
    } else {
        Err(definition_error(format!("Invalid name '{}'", name)))
    }
}

fn built_in(name: &str, node_type: NodeType, read_access: AccessLevel) -> PropertyDefinition {
    let mut property = PropertyDefinition::new(name, node_type);
    property.read_access = read_access;
    property.writable = false;
    property
}

/// Built-ins added to every model. Unmanaged models skip ownership, ACL and
/// versioning fields.
fn built_in_properties(definition: &ModelDefinition) -> Vec<PropertyDefinition> {
    let mut properties = vec![
        built_in("_id", NodeType::ObjectId, AccessLevel::MIN),
        built_in("object", NodeType::String, AccessLevel::MIN),
        built_in("org", NodeType::ObjectId, AccessLevel::System),
    ];
    if definition.types.is_some() {
        let mut type_property = PropertyDefinition::new("type", NodeType::String);
        type_property.read_access = AccessLevel::MIN;
        type_property.write_access = AccessLevel::MIN;
        properties.push(type_property);
    }
    properties.push(built_in("created", NodeType::Date, AccessLevel::Read));
    if !definition.unmanaged {
        properties.push(built_in("creator", NodeType::Reference, AccessLevel::Read));
        properties.push(built_in("owner", NodeType::Reference, AccessLevel::Read));
        let mut acl = built_in("acl", NodeType::Any, AccessLevel::Share);
        acl.array = true;
        properties.push(acl);
        properties.push(built_in("sequence", NodeType::Number, AccessLevel::System));
        properties.push(built_in("updated", NodeType::Date, AccessLevel::Read));
    }
    properties.push(built_in("reap", NodeType::Boolean, AccessLevel::System));
    properties
}

#[derive(Default)]
struct Arena {
    nodes: Vec<SchemaNode>,
    overridable: Vec<NodeId>,
}

impl Arena {
    fn push(&mut self, mut node: SchemaNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.id = id;
        self.nodes.push(node);
        id
    }

    fn has_child(&self, children: &[NodeId], name: &str) -> bool {
        children.iter().any(|id| self.nodes[id.0].name == name)
    }

    fn push_root(&mut self, object: &str, fqpp: String, variant: Option<String>) -> NodeId {
        self.push(blank_node(object, String::new(), fqpp, NodeType::Document, variant))
    }

    fn compile_property(
        &mut self,
        definition: &PropertyDefinition,
        parent: NodeId,
        parent_path: &str,
        fqpp_prefix: &str,
        variant: Option<&str>,
    ) -> FaultResult<NodeId> {
        validate_name(&definition.name)?;
        let fullpath = json_path::join(parent_path, &definition.name);
        let fqpp = format!("{}.{}", fqpp_prefix, definition.name);

        let mut node = blank_node(
            &definition.name,
            fullpath.clone(),
            fqpp.clone(),
            definition.node_type,
            variant.map(str::to_string),
        );
        node.array = definition.array || definition.node_type == NodeType::Set;
        node.readable = definition.readable;
        node.writable = definition.writable;
        node.creatable = definition.creatable;
        node.removable = definition.removable;
        node.required = definition.required;
        node.is_virtual = definition.is_virtual;
        node.read_access = definition.read_access;
        node.write_access = definition.write_access;
        node.acl = definition.acl.clone();
        node.cascade_delete = definition.cascade_delete;
        node.default_value = definition.default.clone();
        node.parent = Some(parent);
        let id = self.push(node);
        if definition.overridable {
            self.overridable.push(id);
        }

        let children = match definition.node_type {
            NodeType::Document => {
                let mut ids = Vec::new();
                if definition.array {
                    let element_id = built_in("_id", NodeType::ObjectId, AccessLevel::MIN);
                    ids.push(self.compile_property(&element_id, id, &fullpath, &fqpp, variant)?);
                }
                for property in &definition.properties {
                    if self.has_child(&ids, &property.name) {
                        return Err(definition_error(format!("Duplicate property '{}'", property.name)));
                    }
                    ids.push(self.compile_property(property, id, &fullpath, &fqpp, variant)?);
                }
                NodeChildren::Properties(ids)
            }
            NodeType::Set => NodeChildren::Set(self.compile_set(definition, id, &fullpath, &fqpp, variant)?),
            _ => {
                if !definition.properties.is_empty() || !definition.documents.is_empty() {
                    return Err(definition_error(format!(
                        "'{}' of type {} cannot have nested properties",
                        definition.name, definition.node_type
                    )));
                }
                NodeChildren::Leaf
            }
        };
        self.nodes[id.0].children = children;
        Ok(id)
    }

    fn compile_set(
        &mut self,
        definition: &PropertyDefinition,
        set_id: NodeId,
        fullpath: &str,
        fqpp: &str,
        variant: Option<&str>,
    ) -> FaultResult<DiscriminatedSet> {
        let key = definition
            .discriminator_key
            .clone()
            .unwrap_or_else(|| DEFAULT_DISCRIMINATOR_KEY.to_string());
        validate_name(&key)?;
        if definition.documents.is_empty() {
            return Err(definition_error(format!("Set '{}' has no documents", definition.name)));
        }

        let mut documents: Vec<DocumentVariant> = Vec::new();
        for document in &definition.documents {
            if documents.iter().any(|d| d.name == document.name) {
                return Err(definition_error(format!("Duplicate set document '{}'", document.name)));
            }
            let mut node = blank_node(
                &document.name,
                fullpath.to_string(),
                format!("{}#{}", fqpp, document.name),
                NodeType::Document,
                variant.map(str::to_string),
            );
            node.read_access = definition.read_access;
            node.write_access = definition.write_access;
            node.writable = definition.writable;
            node.parent = Some(set_id);
            let document_id = self.push(node);
            let document_fqpp = self.nodes[document_id.0].fqpp.clone();

            let mut ids = vec![self.compile_property(
                &built_in("_id", NodeType::ObjectId, AccessLevel::MIN),
                document_id,
                fullpath,
                &document_fqpp,
                variant,
            )?];
            if !document.properties.iter().any(|p| p.name == key) {
                let mut discriminator = PropertyDefinition::new(key.clone(), NodeType::String);
                discriminator.read_access = definition.read_access;
                discriminator.writable = false;
                discriminator.creatable = true;
                discriminator.required = true;
                ids.push(self.compile_property(&discriminator, document_id, fullpath, &document_fqpp, variant)?);
            }
            for property in &document.properties {
                if self.has_child(&ids, &property.name) {
                    return Err(definition_error(format!("Duplicate property '{}'", property.name)));
                }
                ids.push(self.compile_property(property, document_id, fullpath, &document_fqpp, variant)?);
            }
            self.nodes[document_id.0].children = NodeChildren::Properties(ids);
            documents.push(DocumentVariant {
                name: document.name.clone(),
                node: document_id,
                min_required: document.min_required,
                max_allowed: document.max_allowed,
                removal_hook: None,
            });
        }

        for (label, property) in [("uniqueKey", &definition.unique_key), ("uniqueProp", &definition.unique_prop)] {
            if let Some(property) = property {
                let everywhere = documents.iter().all(|d| {
                    self.nodes[d.node.0]
                        .properties()
                        .iter()
                        .any(|id| &self.nodes[id.0].name == property)
                });
                if !everywhere {
                    return Err(definition_error(format!(
                        "{} '{}' must exist in every document of '{}'",
                        label, property, definition.name
                    )));
                }
            }
        }

        Ok(DiscriminatedSet {
            discriminator_key: key,
            unique_key: definition.unique_key.clone(),
            unique_prop: definition.unique_prop.clone(),
            min_items: definition.min_items,
            max_items: definition.max_items,
            max_shift: definition.max_shift,
            documents,
        })
    }
}

fn blank_node(name: &str, fullpath: String, fqpp: String, node_type: NodeType, variant: Option<String>) -> SchemaNode {
    SchemaNode {
        id: NodeId(0),
        name: name.to_string(),
        fullpath,
        fqpp,
        node_type,
        array: false,
        readable: true,
        writable: true,
        creatable: false,
        removable: false,
        required: false,
        is_virtual: false,
        read_access: AccessLevel::MIN,
        write_access: AccessLevel::Update,
        acl: Vec::new(),
        cascade_delete: false,
        default_value: None,
        parent: None,
        master: None,
        variant,
        children: NodeChildren::Leaf,
        capabilities: NodeCapabilities::default(),
    }
}
