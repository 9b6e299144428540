pub mod compiler;
pub mod discriminated_set;
pub mod reader;
pub mod registry;
pub mod typed_model;
pub mod types;
pub mod validation;
pub mod writer;

#[cfg(test)]
mod tests;

pub use compiler::ModelCompiler;
pub use discriminated_set::{DiscriminatedSet, DocumentVariant, SetWriteResult};
pub use registry::SchemaRegistry;
pub use typed_model::{ModelVariant, TypeSelection, TypeVariant, TypedModel};
pub use types::{
    DeleteHook, DocumentDefinition, GroupReader, ModelDefinition, NodeCapabilities, NodeChildren,
    NodeId, NodeType, PropertyDefinition, PropertyReader, PropertyValidator, PropertyWriter,
    RemovalHook, SchemaNode, TypeDefinition,
};
pub use validation::{validate_document, ValidationScope};
pub use writer::{DocumentWriter, WriteContext, WriteMethod};
