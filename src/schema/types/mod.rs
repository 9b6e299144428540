pub mod capabilities;
pub mod definition;
pub mod node;

pub use capabilities::{
    DeleteHook, GroupReader, NodeCapabilities, PropertyReader, PropertyValidator, PropertyWriter,
    RemovalHook,
};
pub use definition::{DocumentDefinition, ModelDefinition, PropertyDefinition, TypeDefinition};
pub use node::{NodeChildren, NodeId, NodeType, SchemaNode};
