//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use objectfold::constants::PUBLIC_IDENTIFIER;
use objectfold::permissions::{Org, OrgConfiguration};
use objectfold::schema::{NodeType, PropertyDefinition, TypeDefinition};
use objectfold::store::{
    BulkWriteResult, ChannelReaperQueue, DocumentFilter, DocumentUpdate, ReapJob, UpdateManyResult,
};
use objectfold::{
    AccessLevel, AclEntry, DocumentStore, FaultResult, InMemoryDocumentStore, ModelDefinition, MutationOrchestrator,
    Principal,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub const ACCOUNT_ID: &str = "account-1";

pub fn org() -> Arc<Org> {
    Arc::new(Org {
        id: "org-1".to_string(),
        code: "test".to_string(),
        configuration: OrgConfiguration::default(),
    })
}

pub fn principal() -> Arc<Principal> {
    Arc::new(Principal::new(ACCOUNT_ID, org()))
}

pub fn principal_with_roles(roles: &[&str]) -> Arc<Principal> {
    Arc::new(Principal::new(ACCOUNT_ID, org()).with_roles(roles.iter().copied()))
}

pub fn property(name: &str, node_type: NodeType) -> PropertyDefinition {
    PropertyDefinition::new(name, node_type)
}

pub fn document(name: &str, properties: Vec<PropertyDefinition>) -> PropertyDefinition {
    let mut doc = PropertyDefinition::new(name, NodeType::Document);
    doc.properties = properties;
    doc
}

/// A managed, creatable model owned by whoever creates the instance.
pub fn model(name: &str, properties: Vec<PropertyDefinition>) -> ModelDefinition {
    ModelDefinition {
        name: name.to_string(),
        label: None,
        unmanaged: false,
        deletable: true,
        obey_object_mode: false,
        has_feeds: false,
        migrating: false,
        default_acl: vec![AclEntry::owner(AccessLevel::Delete)],
        create_acl: vec![AclEntry::account(PUBLIC_IDENTIFIER, AccessLevel::MIN)],
        properties,
        types: None,
    }
}

pub fn typed_model(name: &str, properties: Vec<PropertyDefinition>, types: Vec<TypeDefinition>) -> ModelDefinition {
    ModelDefinition {
        types: Some(types),
        ..model(name, properties)
    }
}

pub fn variant(name: &str, properties: Vec<PropertyDefinition>) -> TypeDefinition {
    TypeDefinition {
        id: None,
        name: name.to_string(),
        properties,
    }
}

/// A stored instance owned by [`ACCOUNT_ID`].
pub fn instance(object: &str, id: &str, fields: Value) -> Value {
    let mut doc = json!({
        "_id": id,
        "object": object,
        "org": "org-1",
        "owner": { "_id": ACCOUNT_ID },
        "creator": { "_id": ACCOUNT_ID },
        "acl": [],
        "sequence": 0,
        "reap": false,
    });
    if let (Some(map), Some(extra)) = (doc.as_object_mut(), fields.as_object()) {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
    doc
}

pub struct Harness<S: DocumentStore + 'static> {
    pub store: Arc<S>,
    pub orchestrator: MutationOrchestrator,
    pub jobs: UnboundedReceiver<ReapJob>,
}

pub fn harness<S: DocumentStore + 'static>(store: Arc<S>) -> Harness<S> {
    let (reaper, jobs) = ChannelReaperQueue::new();
    let orchestrator = MutationOrchestrator::new(store.clone(), Arc::new(reaper));
    Harness {
        store,
        orchestrator,
        jobs,
    }
}

pub async fn seeded(collection: &str, documents: Vec<Value>) -> Arc<InMemoryDocumentStore> {
    let store = Arc::new(InMemoryDocumentStore::new());
    store.seed(collection, documents).await;
    store
}

/// A store where another writer races the next `conflicts` guarded saves.
///
/// Each raced save first applies a concurrent change to the stored
/// document, so the caller's expected sequence no longer matches.
pub struct ConflictingStore {
    pub inner: InMemoryDocumentStore,
    conflicts: AtomicUsize,
    pub raced: AtomicUsize,
}

impl ConflictingStore {
    pub fn new(inner: InMemoryDocumentStore, conflicts: usize) -> Self {
        Self {
            inner,
            conflicts: AtomicUsize::new(conflicts),
            raced: AtomicUsize::new(0),
        }
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for ConflictingStore {
    async fn find(&self, collection: &str, filter: &DocumentFilter, limit: Option<usize>) -> FaultResult<Vec<Value>> {
        self.inner.find(collection, filter, limit).await
    }

    async fn count(&self, collection: &str, filter: &DocumentFilter) -> FaultResult<usize> {
        self.inner.count(collection, filter).await
    }

    async fn bulk_insert(&self, collection: &str, documents: Vec<Value>) -> FaultResult<BulkWriteResult> {
        self.inner.bulk_insert(collection, documents).await
    }

    async fn replace_one(&self, collection: &str, document: Value, expected_sequence: Option<i64>) -> FaultResult<()> {
        if expected_sequence.is_some() && self.take_conflict() {
            let id = document.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
            if let Some(mut current) = self.inner.get(collection, &id).await {
                let sequence = current.get("sequence").and_then(Value::as_i64).unwrap_or(0);
                current["sequence"] = json!(sequence + 1);
                current["c_note"] = json!("concurrent");
                self.inner.replace_one(collection, current, None).await?;
                self.raced.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.replace_one(collection, document, expected_sequence).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        update: &DocumentUpdate,
    ) -> FaultResult<UpdateManyResult> {
        self.inner.update_many(collection, filter, update).await
    }

    async fn delete_many(&self, collection: &str, filter: &DocumentFilter) -> FaultResult<usize> {
        self.inner.delete_many(collection, filter).await
    }
}
