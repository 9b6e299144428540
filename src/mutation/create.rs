use super::result::{IndexedId, MutationResult};
use super::{MutationOptions, MutationOrchestrator};
use crate::error::{Fault, FaultResult};
use crate::permissions::{AccessContext, AccessLevel, AccessMethod, AclEntry, Principal};
use crate::reporting::metrics::names;
use crate::schema::{validate_document, DocumentWriter, TypedModel, ValidationScope, WriteContext};
use futures::stream::{self, StreamExt};
use log::{debug, info};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// A document that was written and validated and is waiting for insert.
struct Prepared {
    index: usize,
    document: Value,
    ac: AccessContext,
}

enum Outcome {
    Ready(Box<Prepared>),
    Failed(Fault),
    /// Not started; the script budget ran out.
    Deferred,
}

type TypeGroup = (Option<String>, Vec<(usize, Value)>);

/// Split a batch by type variant, keeping first-seen group order and the
/// original indices.
fn group_by_type(model: &TypedModel, documents: Vec<Value>) -> Vec<TypeGroup> {
    let mut groups: Vec<TypeGroup> = Vec::new();
    for (index, document) in documents.into_iter().enumerate() {
        let key = if model.is_typed() {
            document.get("type").and_then(Value::as_str).map(|name| {
                model
                    .variant_named(name)
                    .map_or_else(|| name.to_string(), |variant| variant.name.clone())
            })
        } else {
            None
        };
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, items)) => items.push((index, document)),
            None => groups.push((key, vec![(index, document)])),
        }
    }
    groups
}

fn base_document(principal: &Principal, model: &TypedModel) -> Value {
    let now = chrono::Utc::now().to_rfc3339();
    let mut document = Map::new();
    document.insert("_id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
    document.insert("object".to_string(), json!(model.object_name()));
    document.insert("org".to_string(), json!(principal.org.id));
    document.insert("created".to_string(), json!(now));
    document.insert("reap".to_string(), json!(false));
    if !model.is_unmanaged() {
        document.insert("creator".to_string(), json!({ "_id": principal.id }));
        document.insert("owner".to_string(), json!({ "_id": principal.id }));
        document.insert("acl".to_string(), json!([]));
        document.insert("sequence".to_string(), json!(0));
    }
    Value::Object(document)
}

impl MutationOrchestrator {
    /// Create `documents`, reporting each by its position in the batch.
    ///
    /// Documents of different type variants are created as independent
    /// groups; the merged result lists ids and errors in original index order.
    pub async fn create_many(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        documents: Vec<Value>,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        self.check_object_mode(principal, model, options, 'c', "creationDisabled")?;
        let configuration = &principal.org.configuration;
        let max_inserts = if model.is_unmanaged() {
            configuration.max_unmanaged_inserts
        } else {
            configuration.max_managed_inserts
        };
        if documents.len() > max_inserts {
            return Err(Fault::invalid_argument("maxInsertsPerCall").with_path(max_inserts.to_string()));
        }

        let mut groups = group_by_type(model, documents);
        if groups.len() <= 1 {
            let Some((type_name, items)) = groups.pop() else {
                return Ok(MutationResult::default());
            };
            return self.create_group(principal, model, type_name.as_deref(), items, options).await;
        }

        debug!("creating {} type groups of {}", groups.len(), model.object_name());
        let mut merged = MutationResult::default();
        for (type_name, items) in groups {
            let indices: Vec<usize> = items.iter().map(|(index, _)| *index).collect();
            match self.create_group(principal, model, type_name.as_deref(), items, options).await {
                Ok(result) => merged.merge(result),
                Err(fault) => {
                    for index in indices {
                        if merged.record_error(fault.clone().at_index(index), options.halt_on_error, self.config.max_write_errors) {
                            break;
                        }
                    }
                }
            }
            if merged.is_halted() {
                break;
            }
        }
        merged.sort_by_index();
        Ok(merged)
    }

    /// Create a single document and return its id.
    pub async fn acl_create(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        document: Value,
        options: &MutationOptions,
    ) -> FaultResult<String> {
        let options = MutationOptions {
            halt_on_error: true,
            ..options.clone()
        };
        let result = self.create_many(principal, model, vec![document], &options).await?.into_single()?;
        result
            .inserted_ids
            .into_iter()
            .next()
            .map(|id| id.id)
            .ok_or_else(|| Fault::internal("unspecified").with_reason("Document was not created."))
    }

    async fn create_group(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        type_name: Option<&str>,
        items: Vec<(usize, Value)>,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        let scope = match type_name {
            Some(name) => format!("object.create.{}#{}", model.object_name(), name),
            None => format!("object.create.{}", model.object_name()),
        };
        Self::check_scope(principal, options, &scope, false)?;

        let access = options.access_for(AccessMethod::Post);
        let create_acl = options.create_acl.as_deref().unwrap_or_else(|| model.create_acl());
        if !options.skip_acl && !AccessContext::new(principal.clone(), model.object_name(), &access).can_create(create_acl) {
            return Err(Fault::access_denied("instanceCreate"));
        }

        let default_acl = options.default_acl_for(model);
        let before = self.has_trigger(principal, model, options, "create.before").await;
        let after = self.has_trigger(principal, model, options, "create.after").await;
        let window = self.config.create_concurrency.max(1);

        let outcomes: Vec<Outcome> = stream::iter(items)
            .map(|(index, payload)| self.prepare(principal, model, &default_acl, index, payload, options, before))
            .buffered(window)
            .collect()
            .await;

        let mut result = MutationResult::default();
        let mut ready = Vec::new();
        for outcome in outcomes {
            match outcome {
                Outcome::Ready(prepared) => ready.push(*prepared),
                Outcome::Failed(fault) => {
                    if result.record_error(fault, options.halt_on_error, self.config.max_write_errors) {
                        break;
                    }
                }
                Outcome::Deferred => result.has_more = true,
            }
        }
        if result.is_halted() {
            self.metrics.increment(names::WRITE_ERRORS, result.write_errors.len() as u64);
            return Ok(result);
        }

        let mut inserted = Vec::with_capacity(ready.len());
        if access.dry_run {
            for (position, prepared) in ready.iter().enumerate() {
                if let Some(id) = prepared.document.get("_id").and_then(Value::as_str) {
                    inserted.push((position, id.to_string()));
                }
            }
        } else if !ready.is_empty() {
            let documents = ready.iter().map(|p| p.document.clone()).collect();
            let bulk = self.store.bulk_insert(model.collection(), documents).await?;
            inserted = bulk.inserted_ids;
            for error in bulk.write_errors {
                let Some(prepared) = ready.get(error.index) else {
                    continue;
                };
                if result.record_error(error.fault.at_index(prepared.index), options.halt_on_error, self.config.max_write_errors) {
                    break;
                }
            }
        }

        for (position, id) in inserted {
            let Some(prepared) = ready.get(position) else {
                continue;
            };
            result.inserted_ids.push(IndexedId::new(prepared.index, id));
            if after && !access.dry_run {
                self.after_trigger("create.after", &prepared.ac, &prepared.document).await;
            }
            if options.return_access_contexts {
                result.access_contexts.push(prepared.ac.clone());
            }
        }
        result.inserted_count = result.inserted_ids.len();
        result.sort_by_index();

        self.metrics.increment(names::DOCUMENTS_INSERTED, result.inserted_count as u64);
        self.metrics.increment(names::WRITE_ERRORS, result.write_errors.len() as u64);
        info!(
            "created {} {} document(s), {} error(s)",
            result.inserted_count,
            model.object_name(),
            result.write_errors.len()
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        default_acl: &[AclEntry],
        index: usize,
        payload: Value,
        options: &MutationOptions,
        before_trigger: bool,
    ) -> Outcome {
        if self.out_of_time(options) {
            return Outcome::Deferred;
        }
        match self.build_document(principal, model, default_acl, index, &payload, options, before_trigger).await {
            Ok(prepared) => Outcome::Ready(Box::new(prepared)),
            Err(fault) => Outcome::Failed(fault.at_index(index)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_document(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        default_acl: &[AclEntry],
        index: usize,
        payload: &Value,
        options: &MutationOptions,
        before_trigger: bool,
    ) -> FaultResult<Prepared> {
        let selection = model.select_variant_for_write(&Value::Null, payload, true)?;
        let mut document = base_document(principal, model);

        let access = options.access_for(AccessMethod::Post);
        let mut ac = AccessContext::new(principal.clone(), model.object_name(), &access).with_subject(&document);
        ac.set_index(index);
        ac.resolve(default_acl);
        if !ac.has_access(AccessLevel::Public) {
            return Err(Fault::access_denied("instanceUpdate"));
        }
        options.apply_overlays(&mut ac, (!model.is_unmanaged()).then_some(0));

        let writer = DocumentWriter::new(model, selection.variant);
        let mut ctx = WriteContext::create();
        writer.write(&ac, &mut document, payload, &mut ctx)?;
        if before_trigger {
            self.scripts.trigger_script("create.before", &ac, &mut document).await?;
        }
        validate_document(model, selection.variant, &ac, &document, ValidationScope::All)?;
        Ok(Prepared { index, document, ac })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{AclEntry, Org, OrgConfiguration};
    use crate::schema::{ModelCompiler, ModelDefinition, NodeType, PropertyDefinition, TypeDefinition};
    use crate::store::{ChannelReaperQueue, DocumentFilter, DocumentStore, InMemoryDocumentStore};

    fn principal(configuration: OrgConfiguration) -> Arc<Principal> {
        let org = Arc::new(Org {
            id: "org-1".to_string(),
            code: "test".to_string(),
            configuration,
        });
        Arc::new(Principal::new("account-1", org))
    }

    fn note_model(obey_object_mode: bool) -> TypedModel {
        let mut title = PropertyDefinition::new("c_title", NodeType::String);
        title.required = true;
        ModelCompiler::new(ModelDefinition {
            name: "c_note".to_string(),
            label: None,
            unmanaged: false,
            deletable: true,
            obey_object_mode,
            has_feeds: false,
            migrating: false,
            default_acl: vec![AclEntry::owner(AccessLevel::Delete)],
            create_acl: vec![AclEntry::account(crate::constants::PUBLIC_IDENTIFIER, AccessLevel::MIN)],
            properties: vec![title],
            types: Some(vec![
                TypeDefinition {
                    id: None,
                    name: "x".to_string(),
                    properties: vec![],
                },
                TypeDefinition {
                    id: None,
                    name: "y".to_string(),
                    properties: vec![],
                },
            ]),
        })
        .compile()
        .expect("model")
    }

    fn orchestrator(store: Arc<InMemoryDocumentStore>) -> MutationOrchestrator {
        let (reaper, _jobs) = ChannelReaperQueue::new();
        MutationOrchestrator::new(store, Arc::new(reaper))
    }

    #[test]
    fn groups_keep_original_indices() {
        let model = note_model(false);
        let groups = group_by_type(
            &model,
            vec![json!({ "type": "x" }), json!({ "type": "y" }), json!({ "type": "x" })],
        );
        let indices: Vec<(Option<String>, Vec<usize>)> = groups
            .into_iter()
            .map(|(key, items)| (key, items.into_iter().map(|(i, _)| i).collect()))
            .collect();
        assert_eq!(
            indices,
            vec![(Some("x".to_string()), vec![0, 2]), (Some("y".to_string()), vec![1])]
        );
    }

    #[tokio::test]
    async fn creates_managed_documents_with_ownership() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let orchestrator = orchestrator(store.clone());
        let model = note_model(false);
        let principal = principal(OrgConfiguration::default());
        let id = orchestrator
            .acl_create(&principal, &model, json!({ "type": "x", "c_title": "hello" }), &MutationOptions::default())
            .await
            .expect("created");
        let stored = store.get("c_note", &id).await.expect("stored");
        assert_eq!(stored["owner"]["_id"], json!("account-1"));
        assert_eq!(stored["sequence"], json!(0));
        assert_eq!(stored["type"], json!("x"));
    }

    #[tokio::test]
    async fn validation_failures_are_indexed() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let orchestrator = orchestrator(store.clone());
        let model = note_model(false);
        let principal = principal(OrgConfiguration::default());
        let result = orchestrator
            .create_many(
                &principal,
                &model,
                vec![
                    json!({ "type": "x", "c_title": "a" }),
                    json!({ "type": "x" }),
                    json!({ "type": "x", "c_title": "c" }),
                ],
                &MutationOptions::default(),
            )
            .await
            .expect("result");
        assert_eq!(result.inserted_count, 2);
        assert_eq!(result.write_errors.len(), 1);
        assert_eq!(result.write_errors[0].index, Some(1));
        assert_eq!(result.write_errors[0].code(), "invalidArgument.required");
        assert_eq!(result.reported_indices(), vec![0, 1, 2]);
        assert_eq!(store.count("c_note", &DocumentFilter::default()).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn dry_run_reports_ids_without_inserting() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let orchestrator = orchestrator(store.clone());
        let model = note_model(false);
        let principal = principal(OrgConfiguration::default());
        let mut options = MutationOptions::default();
        options.access.dry_run = true;
        let result = orchestrator
            .create_many(&principal, &model, vec![json!({ "type": "y", "c_title": "a" })], &options)
            .await
            .expect("result");
        assert_eq!(result.inserted_count, 1);
        assert!(store.snapshot("c_note").await.is_empty());
    }

    #[tokio::test]
    async fn object_mode_and_quota_are_checked_first() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let orchestrator = orchestrator(store);
        let model = note_model(true);
        let read_only = principal(OrgConfiguration {
            object_mode: "r".to_string(),
            ..Default::default()
        });
        let fault = orchestrator
            .create_many(&read_only, &model, vec![json!({ "type": "x" })], &MutationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "invalidArgument.creationDisabled");

        let limited = principal(OrgConfiguration {
            max_managed_inserts: 1,
            ..Default::default()
        });
        let fault = orchestrator
            .create_many(
                &limited,
                &model,
                vec![json!({ "type": "x" }), json!({ "type": "x" })],
                &MutationOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "invalidArgument.maxInsertsPerCall");
        assert_eq!(fault.path.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn scope_failures_apply_to_their_group_only() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let orchestrator = orchestrator(store);
        let model = note_model(false);
        let org = Arc::new(Org {
            id: "org-1".to_string(),
            code: "test".to_string(),
            configuration: OrgConfiguration::default(),
        });
        let principal = Arc::new(Principal::new("account-1", org).with_scopes(["object.create.c_note#x"]));
        let mut options = MutationOptions::default();
        options.access.scoped = true;
        let result = orchestrator
            .create_many(
                &principal,
                &model,
                vec![json!({ "type": "y", "c_title": "a" }), json!({ "type": "x", "c_title": "b" })],
                &options,
            )
            .await
            .expect("result");
        assert_eq!(result.inserted_ids.iter().map(|id| id.index).collect::<Vec<_>>(), vec![1]);
        assert_eq!(result.write_errors.len(), 1);
        assert_eq!(result.write_errors[0].code(), "accessDenied.scope");
        assert_eq!(result.write_errors[0].index, Some(0));
    }
}
