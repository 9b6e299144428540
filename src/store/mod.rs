//! Document storage interface and the collaborators the mutation layer
//! delegates to.

pub mod collaborators;
pub mod in_memory;

pub use collaborators::{
    ChannelReaperQueue, NoScriptRuntime, ReapJob, ReapOperation, ReaperQueue, ScriptRuntime,
};
pub use in_memory::InMemoryDocumentStore;

use crate::error::{Fault, FaultResult};
use crate::utils::json_path;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Equality filter over dotted paths, with optional id restrictions.
///
/// Reaped documents are excluded unless `include_reaped` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    pub equals: Map<String, Value>,
    pub ids: Option<Vec<String>>,
    pub exclude_ids: Vec<String>,
    pub include_reaped: bool,
}

impl DocumentFilter {
    /// Build a filter from a caller supplied match object.
    ///
    /// `_id` may be a single id or `{"$in": [ids]}`; other keys are compared
    /// for equality. Operators elsewhere are rejected.
    pub fn from_match(matcher: &Value) -> FaultResult<Self> {
        let map = match matcher {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            _ => {
                return Err(Fault::invalid_argument("invalidMatch")
                    .with_reason("Match must be an object."))
            }
        };
        let mut filter = Self::default();
        for (key, value) in map {
            if key.starts_with('$') {
                return Err(Fault::invalid_argument("invalidMatch")
                    .with_reason(format!("Unsupported match operator '{}'.", key)));
            }
            if key == "_id" {
                filter.ids = Some(parse_ids(value)?);
                continue;
            }
            if let Value::Object(inner) = value {
                if inner.keys().any(|k| k.starts_with('$')) {
                    return Err(Fault::invalid_argument("invalidMatch")
                        .with_reason(format!("Unsupported operator for '{}'.", key))
                        .with_path(key.clone()));
                }
            }
            filter.equals.insert(json_path::normalize(key), value.clone());
        }
        Ok(filter)
    }

    pub fn by_id<S: Into<String>>(id: S) -> Self {
        Self {
            ids: Some(vec![id.into()]),
            ..Self::default()
        }
    }

    pub fn by_ids(ids: Vec<String>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn and_equals<S: Into<String>>(mut self, path: S, value: Value) -> Self {
        self.equals.insert(path.into(), value);
        self
    }

    /// Restrict to documents of one org, overriding any `org` in the match.
    #[must_use]
    pub fn in_org(self, org: &str) -> Self {
        self.and_equals("org", Value::String(org.to_string()))
    }

    #[must_use]
    pub fn excluding(mut self, ids: &[String]) -> Self {
        self.exclude_ids.extend(ids.iter().cloned());
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        if !self.include_reaped && document.get("reap").and_then(Value::as_bool) == Some(true) {
            return false;
        }
        let id = document.get("_id").and_then(Value::as_str);
        if let Some(ids) = &self.ids {
            if !id.map_or(false, |id| ids.iter().any(|i| i == id)) {
                return false;
            }
        }
        if id.map_or(false, |id| self.exclude_ids.iter().any(|i| i == id)) {
            return false;
        }
        self.equals
            .iter()
            .all(|(path, expected)| path_matches(document, path, expected))
    }
}

fn parse_ids(value: &Value) -> FaultResult<Vec<String>> {
    let invalid = || Fault::invalid_argument("invalidMatch").with_path("_id");
    match value {
        Value::String(id) => Ok(vec![id.clone()]),
        Value::Object(map) => map
            .get("$in")
            .and_then(Value::as_array)
            .ok_or_else(invalid)?
            .iter()
            .map(|id| id.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

/// Equality, with arrays matching when any element equals the expected value.
fn path_matches(document: &Value, path: &str, expected: &Value) -> bool {
    match json_path::get(document, path) {
        Some(actual) if actual == expected => true,
        Some(Value::Array(items)) => items.iter().any(|item| item == expected),
        Some(actual) => actual.get("_id").map_or(false, |id| id == expected),
        None => expected.is_null(),
    }
}

/// Field updates applied by [`DocumentStore::update_many`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub inc: Map<String, Value>,
}

impl DocumentUpdate {
    /// The soft delete marker: `reap: true` and a sequence bump.
    pub fn mark_for_reaping() -> Self {
        let mut update = Self::default();
        update.set.insert("reap".to_string(), Value::Bool(true));
        update.inc.insert("sequence".to_string(), Value::from(1));
        update
    }

    #[must_use]
    pub fn with_set<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.set.insert(key.into(), value);
        self
    }

    pub fn apply(&self, document: &mut Value) {
        let Some(map) = document.as_object_mut() else {
            return;
        };
        for (key, value) in &self.set {
            map.insert(key.clone(), value.clone());
        }
        for (key, by) in &self.inc {
            let current = map.get(key).and_then(Value::as_i64).unwrap_or(0);
            map.insert(key.clone(), Value::from(current + by.as_i64().unwrap_or(0)));
        }
    }
}

/// A per-operation failure from a bulk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreWriteError {
    /// Position of the failing document in the submitted batch.
    pub index: usize,
    pub fault: Fault,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteResult {
    /// `(batch index, _id)` of each inserted document.
    pub inserted_ids: Vec<(usize, String)>,
    pub write_errors: Vec<StoreWriteError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManyResult {
    pub matched_count: usize,
    pub modified_count: usize,
}

/// Async access to the per-object collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        limit: Option<usize>,
    ) -> FaultResult<Vec<Value>>;

    async fn find_one(&self, collection: &str, filter: &DocumentFilter) -> FaultResult<Option<Value>> {
        Ok(self.find(collection, filter, Some(1)).await?.into_iter().next())
    }

    async fn count(&self, collection: &str, filter: &DocumentFilter) -> FaultResult<usize>;

    /// Unordered insert; a failing document does not stop the rest.
    async fn bulk_insert(&self, collection: &str, documents: Vec<Value>) -> FaultResult<BulkWriteResult>;

    /// Replace the stored document with the same `_id`.
    ///
    /// With `expected_sequence`, the stored `sequence` must match or the call
    /// fails with `conflict.sequencing`.
    async fn replace_one(
        &self,
        collection: &str,
        document: Value,
        expected_sequence: Option<i64>,
    ) -> FaultResult<()>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        update: &DocumentUpdate,
    ) -> FaultResult<UpdateManyResult>;

    async fn delete_many(&self, collection: &str, filter: &DocumentFilter) -> FaultResult<usize>;
}
