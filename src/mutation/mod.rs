//! Access-controlled batch create, update, patch and delete.
//!
//! Every operation reports per-item outcomes by batch index. A failing item
//! never aborts the rest of the batch unless the caller asked to halt on
//! error or the error ceiling is reached.

mod create;
mod delete;
pub mod patch;
pub mod result;
mod sequenced;
mod update;

pub use patch::{normalize_patch_operations, NormalizedPatch, PatchOperation};
pub use result::{IndexedId, MutationResult};

use crate::config::MutationConfig;
use crate::constants::{CREATE_ACL_OPTION, DEFAULT_ACL_OPTION, SET_VERSION_OPTION};
use crate::error::{Fault, FaultResult};
use crate::permissions::{merge_and_sanitize, AccessContext, AccessLevel, AccessMethod, AccessOptions, AclEntry, Principal};
use crate::reporting::{MetricsSink, NoopMetrics};
use crate::schema::TypedModel;
use crate::store::{DocumentStore, NoScriptRuntime, ReaperQueue, ScriptRuntime};
use log::warn;
use serde_json::{json, Value};
use std::sync::Arc;

/// Caller options shared by all mutation entry points.
#[derive(Debug, Clone, Default)]
pub struct MutationOptions {
    pub access: AccessOptions,
    /// Stop at the first per-item fault.
    pub halt_on_error: bool,
    /// Bypass instance and property access checks.
    pub skip_acl: bool,
    pub ignore_object_mode: bool,
    /// Merged ahead of the model's default ACL.
    pub default_acl: Vec<AclEntry>,
    /// Replaces the model's create ACL.
    pub create_acl: Option<Vec<AclEntry>>,
    pub return_access_contexts: bool,
    pub disable_triggers: bool,
    /// Patch path prefix.
    pub path: Option<String>,
    /// Most candidates a delete will consider.
    pub limit: Option<usize>,
}

impl MutationOptions {
    pub(crate) fn access_for(&self, method: AccessMethod) -> AccessOptions {
        let mut access = self.access.clone();
        access.method = method;
        if self.skip_acl && access.override_level.is_none() {
            access.override_level = Some(AccessLevel::MAX);
        }
        access
    }

    pub(crate) fn default_acl_for(&self, model: &TypedModel) -> Vec<AclEntry> {
        merge_and_sanitize(&[self.default_acl.as_slice(), model.default_acl()])
    }

    /// Publish the caller's ACL overrides and the sequence being written to
    /// writers and validators running under `ac`.
    pub(crate) fn apply_overlays(&self, ac: &mut AccessContext, version: Option<i64>) {
        let acls = [
            (DEFAULT_ACL_OPTION, Some(&self.default_acl).filter(|acl| !acl.is_empty())),
            (CREATE_ACL_OPTION, self.create_acl.as_ref()),
        ];
        for (key, acl) in acls {
            let Some(acl) = acl else {
                continue;
            };
            match serde_json::to_value(acl) {
                Ok(value) => ac.set_option(key, value),
                Err(err) => warn!("{} overlay skipped: {}", key, err),
            }
        }
        if let Some(version) = version {
            ac.set_option(SET_VERSION_OPTION, json!(version));
        }
    }
}

/// Runs mutations against a [`DocumentStore`].
pub struct MutationOrchestrator {
    store: Arc<dyn DocumentStore>,
    scripts: Arc<dyn ScriptRuntime>,
    reaper: Arc<dyn ReaperQueue>,
    config: MutationConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl MutationOrchestrator {
    pub fn new(store: Arc<dyn DocumentStore>, reaper: Arc<dyn ReaperQueue>) -> Self {
        Self {
            store,
            scripts: Arc::new(NoScriptRuntime),
            reaper,
            config: MutationConfig::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    #[must_use]
    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptRuntime>) -> Self {
        self.scripts = scripts;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: MutationConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &MutationConfig {
        &self.config
    }

    fn check_object_mode(
        &self,
        principal: &Principal,
        model: &TypedModel,
        options: &MutationOptions,
        mode: char,
        subcategory: &str,
    ) -> FaultResult<()> {
        if !options.ignore_object_mode && model.obeys_object_mode() && !principal.org.configuration.allows(mode) {
            return Err(Fault::invalid_argument(subcategory));
        }
        Ok(())
    }

    fn check_scope(principal: &Principal, options: &MutationOptions, scope: &str, accept_prefix: bool) -> FaultResult<()> {
        if options.access.scoped && !principal.in_scope(scope, accept_prefix) {
            return Err(Fault::access_denied("scope").with_path(scope.to_string()));
        }
        Ok(())
    }

    fn matcher_object(matcher: &Value) -> FaultResult<()> {
        if matcher.is_object() {
            Ok(())
        } else {
            Err(Fault::invalid_argument("matchExpected"))
        }
    }

    /// Whether a script context is too close to its deadline to start more work.
    fn out_of_time(&self, options: &MutationOptions) -> bool {
        options
            .access
            .script
            .map_or(false, |budget| budget.time_left() < self.config.min_script_time_left())
    }

    async fn has_trigger(&self, principal: &Principal, model: &TypedModel, options: &MutationOptions, event: &str) -> bool {
        !options.disable_triggers && self.scripts.trigger_exists(principal, model.object_name(), &[event]).await
    }

    /// Run an `*.after` trigger; failures are logged and swallowed.
    async fn after_trigger(&self, event: &str, ac: &AccessContext, document: &Value) {
        let mut copy = document.clone();
        if let Err(fault) = self.scripts.trigger_script(event, ac, &mut copy).await {
            warn!(
                "{} trigger failed for {:?} (req {}): {}",
                event,
                ac.subject_id(),
                ac.req_id().unwrap_or("-"),
                fault
            );
        }
    }
}
