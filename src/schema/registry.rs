//! Compiled models for one org, keyed by object name.

use super::typed_model::TypedModel;
use crate::error::{Fault, FaultResult};
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe lookup of compiled models.
///
/// Redefining an object replaces the compiled model wholesale; callers
/// holding the previous `Arc` keep a consistent view until they drop it.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    models: RwLock<HashMap<String, Arc<TypedModel>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, model: TypedModel) -> FaultResult<Arc<TypedModel>> {
        let model = Arc::new(model);
        let mut models = self
            .models
            .write()
            .map_err(|_| Fault::internal("unspecified").with_reason("schema registry lock poisoned"))?;
        let replaced = models
            .insert(model.object_name().to_string(), model.clone())
            .is_some();
        info!(
            "{} model {}",
            if replaced { "redefined" } else { "defined" },
            model.object_name()
        );
        Ok(model)
    }

    pub fn get(&self, object_name: &str) -> FaultResult<Arc<TypedModel>> {
        let models = self
            .models
            .read()
            .map_err(|_| Fault::internal("unspecified").with_reason("schema registry lock poisoned"))?;
        models
            .get(object_name)
            .cloned()
            .ok_or_else(|| Fault::not_found("model").with_reason(format!("Unknown object '{}'", object_name)))
    }

    pub fn object_names(&self) -> Vec<String> {
        self.models
            .read()
            .map(|models| {
                let mut names: Vec<String> = models.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }
}
