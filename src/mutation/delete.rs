use super::result::{IndexedId, MutationResult};
use super::{MutationOptions, MutationOrchestrator};
use crate::constants::{
    COMMENT_COLLECTION, CONNECTION_COLLECTION, HISTORY_COLLECTION, NOTIFICATION_COLLECTION, POST_COLLECTION,
};
use crate::error::{Fault, FaultResult};
use crate::permissions::{AccessContext, AccessLevel, AccessMethod, AclEntry, Principal};
use crate::reporting::metrics::names;
use crate::schema::TypedModel;
use crate::store::{DocumentFilter, DocumentUpdate, ReapJob, ReapOperation};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

/// What a delete has to do per instance, probed once per call.
#[derive(Debug, Clone, Default)]
struct DeleteEnvironment {
    hooks: bool,
    instance_scope: bool,
    instance_acl: bool,
    cascade: Vec<String>,
    triggers: bool,
    feeds: bool,
}

impl DeleteEnvironment {
    fn needs_instance_work(&self) -> bool {
        self.hooks || self.instance_scope || self.instance_acl || self.triggers || self.feeds || !self.cascade.is_empty()
    }
}

impl MutationOrchestrator {
    /// Soft-delete every document selected by `matcher`.
    ///
    /// Documents are marked `reap: true` with their sequence bumped; the
    /// reaper removes them later.
    pub async fn acl_delete_many(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        matcher: &Value,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        Self::matcher_object(matcher)?;
        if !model.is_deletable() {
            return Err(Fault::access_denied("notDeletable")
                .with_reason(format!("{} instances cannot be deleted.", model.label())));
        }
        self.check_object_mode(principal, model, options, 'd', "deletionDisabled")?;
        let scope = format!("object.delete.{}", model.object_name());
        Self::check_scope(principal, options, &scope, true)?;
        if model.is_migrating() {
            return Err(Fault::unsupported("unspecified")
                .with_reason("Instances cannot be deleted while a migration is running."));
        }
        let filter = DocumentFilter::from_match(matcher)?.in_org(&principal.org.id);

        let environment = DeleteEnvironment {
            hooks: !model.delete_hooks().is_empty(),
            instance_scope: options.access.scoped && !principal.in_scope(&scope, false),
            instance_acl: !model.is_unmanaged() && !options.skip_acl,
            cascade: model.cascade_properties(),
            triggers: !options.disable_triggers
                && self
                    .scripts
                    .trigger_exists(principal, model.object_name(), &["delete.before", "delete.after"])
                    .await,
            feeds: model.has_feeds(),
        };
        let access = options.access_for(AccessMethod::Delete);
        let default_acl = options.default_acl_for(model);

        if !environment.instance_acl {
            let mut ac = AccessContext::new(principal.clone(), model.object_name(), &access);
            if ac.resolve(&default_acl) < AccessLevel::Delete {
                return Err(Fault::access_denied("instanceDelete"));
            }
        }

        let result = if environment.needs_instance_work() {
            self.delete_each(principal, model, &filter, &environment, options).await?
        } else {
            self.delete_in_bulk(principal, model, &filter, options).await?
        };

        if result.deleted_count > 0 && !access.dry_run {
            self.reaper.enqueue(ReapJob {
                op: ReapOperation::Reap,
                org: principal.org.id.clone(),
                object: model.object_name().to_string(),
                subject: None,
                properties: Vec::new(),
            });
        }
        self.metrics.increment(names::DOCUMENTS_DELETED, result.deleted_count as u64);
        self.metrics.increment(names::WRITE_ERRORS, result.write_errors.len() as u64);
        info!(
            "deleted {} {} document(s), {} error(s)",
            result.deleted_count,
            model.object_name(),
            result.write_errors.len()
        );
        Ok(result)
    }

    /// Delete the document with `id`, failing if nothing was deleted.
    pub async fn acl_delete(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        id: &str,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        let options = MutationOptions {
            halt_on_error: true,
            limit: Some(1),
            ..options.clone()
        };
        let result = self
            .acl_delete_many(principal, model, &json!({ "_id": id }), &options)
            .await?
            .into_single()?;
        if result.deleted_count == 0 {
            return Err(Fault::not_found("instance").for_document(id));
        }
        Ok(result)
    }

    /// One bulk mark-for-reaping when nothing needs per-instance checks.
    async fn delete_in_bulk(
        &self,
        principal: &Principal,
        model: &TypedModel,
        filter: &DocumentFilter,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        let candidates = self.store.find(model.collection(), filter, options.limit).await?;
        let ids: Vec<String> = candidates
            .iter()
            .filter_map(|document| document.get("_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        debug!("bulk deleting {} {} document(s)", ids.len(), model.object_name());

        let mut result = MutationResult {
            matched_count: ids.len(),
            ..Default::default()
        };
        if ids.is_empty() {
            return Ok(result);
        }
        if !options.access.dry_run {
            let marked = self
                .store
                .update_many(
                    model.collection(),
                    &DocumentFilter::by_ids(ids.clone()).in_org(&principal.org.id),
                    &DocumentUpdate::mark_for_reaping(),
                )
                .await?;
            if marked.modified_count != ids.len() {
                debug!("{} of {} documents were already marked", ids.len() - marked.modified_count, ids.len());
            }
        }
        result.deleted_ids = ids.into_iter().enumerate().map(|(i, id)| IndexedId::new(i, id)).collect();
        result.deleted_count = result.deleted_ids.len();
        Ok(result)
    }

    /// Batched per-instance deletion with access checks, hooks and cleanup.
    async fn delete_each(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        filter: &DocumentFilter,
        environment: &DeleteEnvironment,
        options: &MutationOptions,
    ) -> FaultResult<MutationResult> {
        let access = options.access_for(AccessMethod::Delete);
        let default_acl = options.default_acl_for(model);
        let batch_size = self.config.delete_batch_size.max(1);
        let mut result = MutationResult::default();
        let mut seen: Vec<String> = Vec::new();
        let mut index = 0;

        'batches: loop {
            let remaining = options.limit.map(|limit| limit.saturating_sub(index));
            if remaining == Some(0) {
                break;
            }
            let size = remaining.map_or(batch_size, |r| r.min(batch_size));
            let batch = self
                .store
                .find(model.collection(), &filter.clone().excluding(&seen), Some(size))
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            for document in batch {
                if self.out_of_time(options) {
                    result.has_more = true;
                    break 'batches;
                }
                let Some(id) = document.get("_id").and_then(Value::as_str).map(str::to_string) else {
                    continue;
                };
                seen.push(id.clone());
                result.matched_count += 1;
                let position = index;
                index += 1;

                match self
                    .delete_instance(principal, model, &document, &id, position, environment, &default_acl, options)
                    .await
                {
                    Ok(()) => {
                        result.deleted_ids.push(IndexedId::new(position, id));
                        result.deleted_count += 1;
                    }
                    Err(fault) => {
                        let fault = fault.at_index(position).for_document(id);
                        if result.record_error(fault, options.halt_on_error, self.config.max_write_errors) {
                            break 'batches;
                        }
                    }
                }
            }

            if access.dry_run || batch_len < size {
                break;
            }
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn delete_instance(
        &self,
        principal: &Arc<Principal>,
        model: &TypedModel,
        document: &Value,
        id: &str,
        position: usize,
        environment: &DeleteEnvironment,
        default_acl: &[AclEntry],
        options: &MutationOptions,
    ) -> FaultResult<()> {
        let access = options.access_for(AccessMethod::Delete);
        let mut ac = AccessContext::new(principal.clone(), model.object_name(), &access).with_subject(document);
        ac.set_index(position);

        if environment.instance_acl && ac.resolve(default_acl) < AccessLevel::Delete {
            return Err(Fault::access_denied("instanceDelete"));
        }
        if environment.instance_scope {
            let type_suffix = document
                .get("type")
                .and_then(Value::as_str)
                .map(|t| format!("#{}", t))
                .unwrap_or_default();
            let scope = format!("object.delete.{}{}.{}", model.object_name(), type_suffix, id);
            if !principal.in_scope(&scope, false) {
                return Err(Fault::access_denied("scope").with_path(scope));
            }
        }

        for hook in model.delete_hooks() {
            hook.before_delete(&ac, document).await?;
        }
        if environment.triggers {
            let mut subject = document.clone();
            self.scripts.trigger_script("delete.before", &ac, &mut subject).await?;
        }
        if access.dry_run {
            return Ok(());
        }

        let marked = self
            .store
            .update_many(
                model.collection(),
                &DocumentFilter::by_id(id).in_org(&principal.org.id),
                &DocumentUpdate::mark_for_reaping(),
            )
            .await?;
        if marked.modified_count == 0 {
            return Err(Fault::not_found("instance"));
        }

        for hook in model.delete_hooks() {
            if let Err(fault) = hook.after_delete(&ac, document).await {
                warn!("after delete hook failed for {}: {}", id, fault);
            }
        }
        if environment.triggers {
            self.after_trigger("delete.after", &ac, document).await;
        }
        self.clean_up(principal, model, id, environment).await;
        Ok(())
    }

    /// Best-effort removal and archival of records attached to a deleted
    /// instance.
    async fn clean_up(&self, principal: &Principal, model: &TypedModel, id: &str, environment: &DeleteEnvironment) {
        if !environment.cascade.is_empty() {
            self.reaper.enqueue(ReapJob {
                op: ReapOperation::CascadeDelete,
                org: principal.org.id.clone(),
                object: model.object_name().to_string(),
                subject: Some(id.to_string()),
                properties: environment.cascade.clone(),
            });
        }

        let attached = DocumentFilter::default()
            .in_org(&principal.org.id)
            .and_equals("context", json!(id));
        if let Err(fault) = self.store.delete_many(NOTIFICATION_COLLECTION, &attached).await {
            warn!("failed to remove notifications for {}: {}", id, fault);
        }
        if let Err(fault) = self.store.delete_many(CONNECTION_COLLECTION, &attached).await {
            warn!("failed to remove connections for {}: {}", id, fault);
        }

        let archive = DocumentUpdate::default().with_set("archived", json!(true));
        let mut archived = vec![HISTORY_COLLECTION];
        if environment.feeds {
            archived.extend([POST_COLLECTION, COMMENT_COLLECTION]);
        }
        for collection in archived {
            if let Err(fault) = self.store.update_many(collection, &attached, &archive).await {
                warn!("failed to archive {} records for {}: {}", collection, id, fault);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{Org, OrgConfiguration};
    use crate::schema::{DeleteHook, ModelCompiler, ModelDefinition, NodeType, PropertyDefinition};
    use crate::store::{ChannelReaperQueue, DocumentStore, InMemoryDocumentStore};
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn principal() -> Arc<Principal> {
        let org = Arc::new(Org {
            id: "org-1".to_string(),
            code: "test".to_string(),
            configuration: OrgConfiguration::default(),
        });
        Arc::new(Principal::new("account-1", org))
    }

    fn definition(name: &str, unmanaged: bool) -> ModelDefinition {
        ModelDefinition {
            name: name.to_string(),
            label: None,
            unmanaged,
            deletable: true,
            obey_object_mode: false,
            has_feeds: false,
            migrating: false,
            default_acl: vec![AclEntry::owner(AccessLevel::Delete)],
            create_acl: vec![],
            properties: vec![PropertyDefinition::new("c_title", NodeType::String)],
            types: None,
        }
    }

    fn doc(id: &str, owner: &str) -> Value {
        json!({ "_id": id, "org": "org-1", "owner": { "_id": owner }, "acl": [], "sequence": 0, "reap": false })
    }

    async fn setup(
        collection: &str,
        docs: Vec<Value>,
    ) -> (Arc<InMemoryDocumentStore>, MutationOrchestrator, UnboundedReceiver<ReapJob>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.seed(collection, docs).await;
        let (reaper, jobs) = ChannelReaperQueue::new();
        (store.clone(), MutationOrchestrator::new(store, Arc::new(reaper)), jobs)
    }

    #[tokio::test]
    async fn unmanaged_models_take_the_bulk_path() {
        let mut definition = definition("c_log", true);
        definition.default_acl = vec![AclEntry::account("account-1", AccessLevel::Delete)];
        let model = ModelCompiler::new(definition).compile().expect("model");
        let (store, orchestrator, mut jobs) = setup("c_log", vec![doc("l1", "x"), doc("l2", "x")]).await;
        let result = orchestrator
            .acl_delete_many(&principal(), &model, &json!({}), &MutationOptions::default())
            .await
            .expect("deleted");
        assert_eq!(result.deleted_count, 2);
        let stored = store.get("c_log", "l1").await.expect("stored");
        assert_eq!(stored["reap"], json!(true));
        assert_eq!(stored["sequence"], json!(1));
        let job = jobs.recv().await.expect("job");
        assert_eq!(job.op, ReapOperation::Reap);
    }

    #[tokio::test]
    async fn unmanaged_models_need_delete_access_for_the_batch() {
        let model = ModelCompiler::new(definition("c_log", true)).compile().expect("model");
        let (_, orchestrator, _jobs) = setup("c_log", vec![doc("l1", "x")]).await;
        let fault = orchestrator
            .acl_delete_many(&principal(), &model, &json!({}), &MutationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "accessDenied.instanceDelete");
    }

    #[tokio::test]
    async fn managed_models_check_each_instance() {
        let model = ModelCompiler::new(definition("c_note", false)).compile().expect("model");
        let (store, orchestrator, _jobs) = setup(
            "c_note",
            vec![doc("n1", "account-1"), doc("n2", "other"), doc("n3", "account-1")],
        )
        .await;
        let result = orchestrator
            .acl_delete_many(&principal(), &model, &json!({}), &MutationOptions::default())
            .await
            .expect("deleted");
        assert_eq!(result.deleted_count, 2);
        assert_eq!(result.write_errors.len(), 1);
        assert_eq!(result.write_errors[0].code(), "accessDenied.instanceDelete");
        assert_eq!(result.write_errors[0].document_id.as_deref(), Some("n2"));
        assert_eq!(result.reported_indices(), vec![0, 1, 2]);
        assert_eq!(store.get("c_note", "n2").await.expect("kept")["reap"], json!(false));
    }

    #[tokio::test]
    async fn batches_continue_past_failures() {
        let model = ModelCompiler::new(definition("c_note", false)).compile().expect("model");
        let docs = (0..7)
            .map(|i| doc(&format!("n{}", i), if i % 3 == 0 { "other" } else { "account-1" }))
            .collect();
        let (_, orchestrator, _jobs) = setup("c_note", docs).await;
        let orchestrator = orchestrator.with_config(crate::config::MutationConfig {
            delete_batch_size: 2,
            ..Default::default()
        });
        let result = orchestrator
            .acl_delete_many(&principal(), &model, &json!({}), &MutationOptions::default())
            .await
            .expect("deleted");
        assert_eq!(result.matched_count, 7);
        assert_eq!(result.deleted_count, 4);
        assert_eq!(result.write_errors.len(), 3);
        assert_eq!(result.reported_indices(), (0..7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn halt_on_error_stops_the_batch() {
        let model = ModelCompiler::new(definition("c_note", false)).compile().expect("model");
        let (_, orchestrator, _jobs) =
            setup("c_note", vec![doc("n1", "other"), doc("n2", "account-1")]).await;
        let options = MutationOptions {
            halt_on_error: true,
            ..Default::default()
        };
        let result = orchestrator
            .acl_delete_many(&principal(), &model, &json!({}), &options)
            .await
            .expect("result");
        assert_eq!(result.deleted_count, 0);
        assert_eq!(
            result.halted_by.as_ref().map(Fault::code).as_deref(),
            Some("accessDenied.instanceDelete")
        );
    }

    #[tokio::test]
    async fn dry_run_leaves_documents_alone() {
        let model = ModelCompiler::new(definition("c_note", false)).compile().expect("model");
        let (store, orchestrator, _jobs) = setup("c_note", vec![doc("n1", "account-1")]).await;
        let mut options = MutationOptions::default();
        options.access.dry_run = true;
        let result = orchestrator
            .acl_delete_many(&principal(), &model, &json!({}), &options)
            .await
            .expect("result");
        assert_eq!(result.deleted_count, 1);
        assert_eq!(store.get("c_note", "n1").await.expect("kept")["reap"], json!(false));
    }

    struct Veto;

    #[async_trait]
    impl DeleteHook for Veto {
        async fn before_delete(&self, _ac: &AccessContext, document: &Value) -> FaultResult<()> {
            if document["c_title"] == json!("keep") {
                return Err(Fault::access_denied("unspecified").with_reason("Protected."));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn delete_hooks_can_veto_and_attachments_are_cleaned() {
        let model = ModelCompiler::new(definition("c_note", false))
            .delete_hook(Arc::new(Veto))
            .compile()
            .expect("model");
        let mut kept = doc("n1", "account-1");
        kept["c_title"] = json!("keep");
        let (store, orchestrator, _jobs) = setup("c_note", vec![kept, doc("n2", "account-1")]).await;
        store
            .seed(
                NOTIFICATION_COLLECTION,
                vec![
                    json!({ "_id": "note-1", "org": "org-1", "context": { "_id": "n2" } }),
                    json!({ "_id": "note-2", "org": "org-2", "context": { "_id": "n2" } }),
                ],
            )
            .await;
        store
            .seed(HISTORY_COLLECTION, vec![json!({ "_id": "h-1", "org": "org-1", "context": { "_id": "n2" } })])
            .await;

        let fault = orchestrator
            .acl_delete(&principal(), &model, "n1", &MutationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "accessDenied.unspecified");

        orchestrator
            .acl_delete(&principal(), &model, "n2", &MutationOptions::default())
            .await
            .expect("deleted");
        let notifications = store.snapshot(NOTIFICATION_COLLECTION).await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["_id"], json!("note-2"));
        assert_eq!(store.get(HISTORY_COLLECTION, "h-1").await.expect("history")["archived"], json!(true));
    }

    #[tokio::test]
    async fn pre_checks() {
        let mut fixed = definition("c_fixed", false);
        fixed.deletable = false;
        let model = ModelCompiler::new(fixed).compile().expect("model");
        let (_, orchestrator, _jobs) = setup("c_fixed", vec![]).await;
        let fault = orchestrator
            .acl_delete_many(&principal(), &model, &json!({}), &MutationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "accessDenied.notDeletable");

        let mut migrating = definition("c_moving", false);
        migrating.migrating = true;
        let model = ModelCompiler::new(migrating).compile().expect("model");
        let fault = orchestrator
            .acl_delete_many(&principal(), &model, &json!({}), &MutationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "unsupportedOperation.unspecified");

        let fault = orchestrator
            .acl_delete(&principal(), &model, "n1", &MutationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "unsupportedOperation.unspecified");
    }
}
