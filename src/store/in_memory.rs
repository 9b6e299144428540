use super::{
    BulkWriteResult, DocumentFilter, DocumentStore, DocumentUpdate, StoreWriteError, UpdateManyResult,
};
use crate::error::{Fault, FaultResult};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Collections held in memory, in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert documents as-is, bypassing duplicate checks.
    pub async fn seed(&self, collection: &str, documents: Vec<Value>) {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }

    /// Every stored document, reaped ones included.
    pub async fn snapshot(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| id_of(d) == Some(id)).cloned())
    }
}

fn id_of(document: &Value) -> Option<&str> {
    document.get("_id").and_then(Value::as_str)
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        limit: Option<usize>,
    ) -> FaultResult<Vec<Value>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(documents
            .iter()
            .filter(|d| filter.matches(d))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count(&self, collection: &str, filter: &DocumentFilter) -> FaultResult<usize> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map_or(0, |docs| docs.iter().filter(|d| filter.matches(d)).count()))
    }

    async fn bulk_insert(&self, collection: &str, documents: Vec<Value>) -> FaultResult<BulkWriteResult> {
        let mut collections = self.collections.write().await;
        let stored = collections.entry(collection.to_string()).or_default();
        let mut result = BulkWriteResult::default();
        for (index, document) in documents.into_iter().enumerate() {
            let Some(id) = id_of(&document).map(str::to_string) else {
                result.write_errors.push(StoreWriteError {
                    index,
                    fault: Fault::invalid_argument("required").with_path("_id"),
                });
                continue;
            };
            if stored.iter().any(|d| id_of(d) == Some(id.as_str())) {
                result.write_errors.push(StoreWriteError {
                    index,
                    fault: Fault::conflict("duplicateKey").for_document(id),
                });
                continue;
            }
            stored.push(document);
            result.inserted_ids.push((index, id));
        }
        debug!(
            "bulk insert into {}: {} inserted, {} failed",
            collection,
            result.inserted_ids.len(),
            result.write_errors.len()
        );
        Ok(result)
    }

    async fn replace_one(
        &self,
        collection: &str,
        document: Value,
        expected_sequence: Option<i64>,
    ) -> FaultResult<()> {
        let id = id_of(&document)
            .map(str::to_string)
            .ok_or_else(|| Fault::invalid_argument("required").with_path("_id"))?;
        let mut collections = self.collections.write().await;
        let stored = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| id_of(d) == Some(id.as_str())))
            .ok_or_else(|| Fault::not_found("instance").for_document(id.clone()))?;
        if let Some(expected) = expected_sequence {
            let current = stored.get("sequence").and_then(Value::as_i64).unwrap_or(0);
            if current != expected {
                return Err(Fault::sequencing().for_document(id));
            }
        }
        *stored = document;
        Ok(())
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        update: &DocumentUpdate,
    ) -> FaultResult<UpdateManyResult> {
        let mut collections = self.collections.write().await;
        let mut result = UpdateManyResult::default();
        if let Some(documents) = collections.get_mut(collection) {
            for document in documents.iter_mut().filter(|d| filter.matches(d)) {
                result.matched_count += 1;
                let before = document.clone();
                update.apply(document);
                if *document != before {
                    result.modified_count += 1;
                }
            }
        }
        Ok(result)
    }

    async fn delete_many(&self, collection: &str, filter: &DocumentFilter) -> FaultResult<usize> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = documents.len();
        documents.retain(|d| !filter.matches(d));
        Ok(before - documents.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn bulk_insert_reports_failures_by_index() {
        let store = InMemoryDocumentStore::new();
        store.seed("c_widget", vec![json!({ "_id": "a" })]).await;
        let result = store
            .bulk_insert(
                "c_widget",
                vec![json!({ "_id": "b" }), json!({ "_id": "a" }), json!({}), json!({ "_id": "c" })],
            )
            .await
            .expect("bulk insert");
        assert_eq!(
            result.inserted_ids,
            vec![(0, "b".to_string()), (3, "c".to_string())]
        );
        let failed: Vec<(usize, String)> = result
            .write_errors
            .iter()
            .map(|e| (e.index, e.fault.code()))
            .collect();
        assert_eq!(
            failed,
            vec![
                (1, "conflict.duplicateKey".to_string()),
                (2, "invalidArgument.required".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn replace_is_guarded_by_sequence() {
        let store = InMemoryDocumentStore::new();
        store
            .seed("c_widget", vec![json!({ "_id": "a", "sequence": 2 })])
            .await;
        let fault = store
            .replace_one("c_widget", json!({ "_id": "a", "sequence": 3 }), Some(1))
            .await
            .unwrap_err();
        assert!(fault.is_sequencing_conflict());
        store
            .replace_one("c_widget", json!({ "_id": "a", "sequence": 3 }), Some(2))
            .await
            .expect("replace");
        assert_eq!(store.get("c_widget", "a").await, Some(json!({ "_id": "a", "sequence": 3 })));

        let fault = store
            .replace_one("c_widget", json!({ "_id": "zz" }), None)
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "notFound.instance");
    }

    #[tokio::test]
    async fn reaped_documents_are_hidden_from_finds() {
        let store = InMemoryDocumentStore::new();
        store
            .seed("c_widget", vec![json!({ "_id": "a" }), json!({ "_id": "b" })])
            .await;
        let marked = store
            .update_many("c_widget", &DocumentFilter::by_id("a"), &DocumentUpdate::mark_for_reaping())
            .await
            .expect("update");
        assert_eq!(marked.modified_count, 1);
        assert_eq!(store.count("c_widget", &DocumentFilter::default()).await.expect("count"), 1);
        assert_eq!(store.snapshot("c_widget").await.len(), 2);
        let removed = store
            .delete_many(
                "c_widget",
                &DocumentFilter {
                    include_reaped: true,
                    ..DocumentFilter::by_id("a")
                },
            )
            .await
            .expect("delete");
        assert_eq!(removed, 1);
    }
}
