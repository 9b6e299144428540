use super::patch::{normalize_patch_operations, NormalizedPatch, PatchOperation};
use super::result::{IndexedId, MutationResult};
use super::sequenced::RetryPolicy;
use super::{MutationOptions, MutationOrchestrator};
use crate::error::{Fault, FaultResult};
use crate::permissions::{AccessContext, AccessLevel, AccessMethod, Principal};
use crate::reporting::metrics::names;
use crate::schema::{validate_document, DocumentWriter, TypedModel, ValidationScope, WriteContext, WriteMethod};
use crate::store::DocumentFilter;
use crate::utils::json_path;
use log::{debug, info};
use serde_json::{json, Value};
use std::sync::Arc;

/// What one update attempt applies to the freshly loaded document.
#[derive(Clone, Copy)]
enum Change<'a> {
    Payload(&'a Value),
    Patch(&'a NormalizedPatch),
}

/// Path segment addressing one value inside an array.
fn element_segment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn document_id(document: &Value) -> FaultResult<String> {
    document
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Fault::invalid_argument("required").with_path("_id"))
}

impl MutationOrchestrator {
    /// Merge `payload` into the single document selected by `matcher`.
    pub async fn acl_update(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        matcher: &Value,
        payload: &Value,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        self.check_object_mode(principal, model, options, 'u', "updateDisabled")?;
        Self::matcher_object(matcher)?;
        if !payload.is_object() {
            return Err(Fault::invalid_argument("objectExpected").with_reason("Expected an object payload."));
        }
        let filter = DocumentFilter::from_match(matcher)?.in_org(&principal.org.id);
        let found = self
            .store
            .find_one(model.collection(), &filter)
            .await?
            .ok_or_else(|| Fault::not_found("instance"))?;
        let id = document_id(&found)?;

        let modified = self
            .update_with_retry(principal, model, &id, Change::Payload(payload), options, 0)
            .await
            .map_err(|fault| fault.for_document(id.clone()))?;

        let mut result = MutationResult {
            matched_count: 1,
            modified_count: usize::from(modified),
            ..Default::default()
        };
        result.updated_ids.push(IndexedId::new(0, id));
        self.metrics.increment(names::DOCUMENTS_UPDATED, 1);
        Ok(result)
    }

    /// Apply patch operations to every document selected by `matcher`.
    ///
    /// At most `max_updates_per_call` documents are processed per call
    /// (unbounded inside scripts); `has_more` is set when candidates remain.
    pub async fn acl_patch_many(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        matcher: &Value,
        ops: &Value,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        self.check_object_mode(principal, model, options, 'u', "updateDisabled")?;
        Self::matcher_object(matcher)?;
        let patch = normalize_patch_operations(ops, options.path.as_deref())?;
        if patch.operations.is_empty() {
            return Err(Fault::invalid_argument("emptyOperationsPayload"));
        }
        Self::check_scope(principal, options, &format!("object.update.{}", model.object_name()), true)?;

        let filter = DocumentFilter::from_match(matcher)?.in_org(&principal.org.id);
        let max_updates = if options.access.script.is_some() {
            None
        } else {
            Some(self.config.max_updates_per_call)
        };
        let mut candidates = self
            .store
            .find(model.collection(), &filter, max_updates.map(|max| max + 1))
            .await?;

        let mut result = MutationResult::default();
        if let Some(max) = max_updates {
            if candidates.len() > max {
                candidates.truncate(max);
                result.has_more = true;
            }
        }
        debug!("patching up to {} {} document(s)", candidates.len(), model.object_name());

        for (index, candidate) in candidates.iter().enumerate() {
            if self.out_of_time(options) {
                result.has_more = true;
                break;
            }
            let id = match document_id(candidate) {
                Ok(id) => id,
                Err(fault) => {
                    if result.record_error(fault.at_index(index), options.halt_on_error, self.config.max_write_errors) {
                        break;
                    }
                    continue;
                }
            };
            result.matched_count += 1;
            match self
                .update_with_retry(principal, model, &id, Change::Patch(&patch), options, index)
                .await
            {
                Ok(modified) => {
                    if modified {
                        result.modified_count += 1;
                    }
                    result.updated_ids.push(IndexedId::new(index, id));
                }
                Err(fault) => {
                    let fault = fault.at_index(index).for_document(id);
                    if result.record_error(fault, options.halt_on_error, self.config.max_write_errors) {
                        break;
                    }
                }
            }
        }

        self.metrics.increment(names::DOCUMENTS_UPDATED, result.modified_count as u64);
        self.metrics.increment(names::WRITE_ERRORS, result.write_errors.len() as u64);
        info!(
            "patched {} of {} matched {} document(s), {} error(s)",
            result.modified_count,
            result.matched_count,
            model.object_name(),
            result.write_errors.len()
        );
        Ok(result)
    }

    /// Patch the document with `id`.
    pub async fn acl_patch(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        id: &str,
        ops: &Value,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        let options = MutationOptions {
            halt_on_error: true,
            ..options.clone()
        };
        let result = self
            .acl_patch_many(principal, model, &json!({ "_id": id }), ops, &options)
            .await?
            .into_single()?;
        if result.matched_count == 0 {
            return Err(Fault::not_found("instance").for_document(id));
        }
        Ok(result)
    }

    async fn update_with_retry(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        id: &str,
        change: Change<'_>,
        options: &MutationOptions,
        index: usize,
    ) -> FaultResult<bool> {
        let policy = RetryPolicy::new(&self.config, self.metrics.as_ref());
        policy
            .run(|| self.update_once(principal, model, id, change, options, index))
            .await
    }

    /// Reload, apply, validate what changed and save. Returns whether any
    /// path was modified.
    async fn update_once(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        id: &str,
        change: Change<'_>,
        options: &MutationOptions,
        index: usize,
    ) -> FaultResult<bool> {
        let mut document = self
            .store
            .find_one(model.collection(), &DocumentFilter::by_id(id).in_org(&principal.org.id))
            .await?
            .ok_or_else(|| Fault::not_found("instance"))?;

        let access = options.access_for(AccessMethod::Put);
        let mut ac = AccessContext::new(principal.clone(), model.object_name(), &access).with_subject(&document);
        ac.set_index(index);
        ac.resolve(&options.default_acl_for(model));
        let required = match change {
            Change::Payload(_) => AccessLevel::Update,
            Change::Patch(_) => AccessLevel::Public,
        };
        if !ac.has_access(required) {
            return Err(Fault::access_denied("instanceUpdate"));
        }
        let stored_sequence = document.get("sequence").and_then(Value::as_i64).unwrap_or(0);
        options.apply_overlays(&mut ac, (!model.is_unmanaged()).then_some(stored_sequence + 1));

        let type_payload = match change {
            Change::Payload(payload) => payload.clone(),
            Change::Patch(patch) => patch.type_payload(),
        };
        let selection = model.select_variant_for_write(&document, &type_payload, false)?;
        let writer = DocumentWriter::new(model, selection.variant);
        let mut ctx = WriteContext::update(WriteMethod::Put);

        match change {
            Change::Payload(payload) => writer.write(&ac, &mut document, payload, &mut ctx)?,
            Change::Patch(patch) => {
                for operation in &patch.operations {
                    match operation {
                        PatchOperation::Write {
                            method,
                            payload,
                            overwrite,
                        } => {
                            ctx.method = *method;
                            ctx.overwrite = *overwrite;
                            writer.write(&ac, &mut document, payload, &mut ctx)?;
                        }
                        PatchOperation::Remove { path, values: None } => {
                            writer.remove(&ac, &mut document, path, &mut ctx)?;
                        }
                        PatchOperation::Remove {
                            path,
                            values: Some(values),
                        } => {
                            for value in values {
                                let element = json_path::join(path, &element_segment(value));
                                writer.remove(&ac, &mut document, &element, &mut ctx)?;
                            }
                        }
                    }
                }
            }
        }
        if selection.retyped_from_null {
            for path in model.variant_property_paths(selection.variant) {
                ctx.mark_modified(&path);
            }
        }
        if ctx.modified().is_empty() {
            return Ok(false);
        }

        let before = self.has_trigger(principal, model, options, "update.before").await;
        if before {
            self.scripts.trigger_script("update.before", &ac, &mut document).await?;
        }
        validate_document(model, selection.variant, &ac, &document, ValidationScope::Modified(ctx.modified()))?;

        if !access.dry_run {
            let expected_sequence = if model.is_unmanaged() {
                None
            } else {
                if let Some(map) = document.as_object_mut() {
                    map.insert("sequence".to_string(), json!(stored_sequence + 1));
                    map.insert("updated".to_string(), json!(chrono::Utc::now().to_rfc3339()));
                }
                Some(stored_sequence)
            };
            self.store
                .replace_one(model.collection(), document.clone(), expected_sequence)
                .await?;
            if self.has_trigger(principal, model, options, "update.after").await {
                self.after_trigger("update.after", &ac, &document).await;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{AclEntry, Org, OrgConfiguration};
    use crate::schema::{ModelCompiler, ModelDefinition, NodeType, PropertyDefinition};
    use crate::store::{ChannelReaperQueue, DocumentStore, InMemoryDocumentStore};

    fn principal() -> Arc<Principal> {
        let org = Arc::new(Org {
            id: "org-1".to_string(),
            code: "test".to_string(),
            configuration: OrgConfiguration::default(),
        });
        Arc::new(Principal::new("account-1", org))
    }

    fn task_model() -> TypedModel {
        let mut tags = PropertyDefinition::new("c_tags", NodeType::String);
        tags.array = true;
        let mut done = PropertyDefinition::new("c_done", NodeType::Boolean);
        done.removable = true;
        ModelCompiler::new(ModelDefinition {
            name: "c_task".to_string(),
            label: None,
            unmanaged: false,
            deletable: true,
            obey_object_mode: false,
            has_feeds: false,
            migrating: false,
            default_acl: vec![AclEntry::owner(AccessLevel::Delete)],
            create_acl: vec![],
            properties: vec![PropertyDefinition::new("c_title", NodeType::String), tags, done],
            types: None,
        })
        .compile()
        .expect("model")
    }

    fn task(id: &str, owner: &str) -> Value {
        json!({
            "_id": id,
            "object": "c_task",
            "org": "org-1",
            "owner": { "_id": owner },
            "creator": { "_id": owner },
            "acl": [],
            "sequence": 3,
            "reap": false,
            "c_title": "draft",
            "c_tags": ["a", "b", "c"],
            "c_done": true,
        })
    }

    async fn setup(docs: Vec<Value>) -> (Arc<InMemoryDocumentStore>, MutationOrchestrator) {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.seed("c_task", docs).await;
        let (reaper, _jobs) = ChannelReaperQueue::new();
        let orchestrator = MutationOrchestrator::new(store.clone(), Arc::new(reaper));
        (store, orchestrator)
    }

    #[tokio::test]
    async fn update_bumps_the_sequence() {
        let (store, orchestrator) = setup(vec![task("t1", "account-1")]).await;
        let result = orchestrator
            .acl_update(
                &principal(),
                &task_model(),
                &json!({ "_id": "t1" }),
                &json!({ "c_title": "final" }),
                &MutationOptions::default(),
            )
            .await
            .expect("updated");
        assert_eq!(result.modified_count, 1);
        let stored = store.get("c_task", "t1").await.expect("stored");
        assert_eq!(stored["c_title"], json!("final"));
        assert_eq!(stored["sequence"], json!(4));
        assert!(stored.get("updated").is_some());
    }

    #[tokio::test]
    async fn update_requires_instance_access() {
        let (_, orchestrator) = setup(vec![task("t1", "someone-else")]).await;
        let fault = orchestrator
            .acl_update(
                &principal(),
                &task_model(),
                &json!({ "_id": "t1" }),
                &json!({ "c_title": "final" }),
                &MutationOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "accessDenied.instanceUpdate");
        assert_eq!(fault.document_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn patch_pulls_values_and_unsets_paths() {
        let (store, orchestrator) = setup(vec![task("t1", "account-1")]).await;
        orchestrator
            .acl_patch(
                &principal(),
                &task_model(),
                "t1",
                &json!([
                    { "op": "pull", "path": "c_tags", "value": ["a", "c"] },
                    { "op": "unset", "value": { "c_done": 1 } },
                    { "op": "push", "path": "c_tags", "value": "d" },
                ]),
                &MutationOptions::default(),
            )
            .await
            .expect("patched");
        let stored = store.get("c_task", "t1").await.expect("stored");
        assert_eq!(stored["c_tags"], json!(["b", "d"]));
        assert!(stored.get("c_done").is_none());
    }

    #[tokio::test]
    async fn patch_reports_missing_documents() {
        let (_, orchestrator) = setup(vec![]).await;
        let fault = orchestrator
            .acl_patch(
                &principal(),
                &task_model(),
                "missing",
                &json!({ "op": "set", "path": "c_title", "value": "x" }),
                &MutationOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "notFound.instance");
    }

    #[tokio::test]
    async fn patch_limit_sets_has_more() {
        let docs = (0..5).map(|i| task(&format!("t{}", i), "account-1")).collect();
        let (store, orchestrator) = setup(docs).await;
        let orchestrator = orchestrator.with_config(crate::config::MutationConfig {
            max_updates_per_call: 3,
            ..Default::default()
        });
        let result = orchestrator
            .acl_patch_many(
                &principal(),
                &task_model(),
                &json!({}),
                &json!({ "op": "set", "path": "c_title", "value": "bulk" }),
                &MutationOptions::default(),
            )
            .await
            .expect("patched");
        assert!(result.has_more);
        assert_eq!(result.modified_count, 3);
        let untouched = store
            .count("c_task", &DocumentFilter::default().and_equals("c_title", json!("draft")))
            .await
            .expect("count");
        assert_eq!(untouched, 2);
    }

    #[tokio::test]
    async fn empty_patches_are_rejected() {
        let (_, orchestrator) = setup(vec![]).await;
        let fault = orchestrator
            .acl_patch_many(&principal(), &task_model(), &json!({}), &json!([]), &MutationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "invalidArgument.emptyOperationsPayload");

        let fault = orchestrator
            .acl_patch_many(&principal(), &task_model(), &json!("t1"), &json!([]), &MutationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "invalidArgument.matchExpected");
    }
}
