//! Behaviour attached to schema nodes.
//!
//! A node either has a capability or it does not; an absent reader means the
//! stored value is returned as is.

use super::node::SchemaNode;
use crate::error::FaultResult;
use crate::permissions::AccessContext;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Computes the value returned for a property.
pub trait PropertyReader: Send + Sync {
    /// `parent` is the document holding the property, `value` the stored value.
    fn read(
        &self,
        ac: &AccessContext,
        node: &SchemaNode,
        parent: &Value,
        value: Option<&Value>,
    ) -> FaultResult<Option<Value>>;
}

/// Transforms a cast value before it is stored.
pub trait PropertyWriter: Send + Sync {
    fn write(&self, ac: &AccessContext, node: &SchemaNode, value: Value) -> FaultResult<Value>;
}

/// Fills a property for a whole page of results in one pass.
#[async_trait]
pub trait GroupReader: Send + Sync {
    async fn read_group(
        &self,
        ac: &AccessContext,
        node: &SchemaNode,
        documents: &mut [Value],
    ) -> FaultResult<()>;
}

pub trait PropertyValidator: Send + Sync {
    fn validate(&self, ac: &AccessContext, node: &SchemaNode, value: &Value) -> FaultResult<()>;
}

/// Called when a set element is removed.
pub trait RemovalHook: Send + Sync {
    fn on_removing_value(&self, ac: &AccessContext, element: &Value) -> FaultResult<()>;
}

/// Model level delete hooks run around each instance deletion.
#[async_trait]
pub trait DeleteHook: Send + Sync {
    async fn before_delete(&self, ac: &AccessContext, document: &Value) -> FaultResult<()>;

    async fn after_delete(&self, _ac: &AccessContext, _document: &Value) -> FaultResult<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct NodeCapabilities {
    pub reader: Option<Arc<dyn PropertyReader>>,
    pub writer: Option<Arc<dyn PropertyWriter>>,
    pub group_reader: Option<Arc<dyn GroupReader>>,
    pub validators: Vec<Arc<dyn PropertyValidator>>,
}

impl fmt::Debug for NodeCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCapabilities")
            .field("reader", &self.reader.is_some())
            .field("writer", &self.writer.is_some())
            .field("group_reader", &self.group_reader.is_some())
            .field("validators", &self.validators.len())
            .finish()
    }
}
