use super::projected::{read_fields, Projected, SourceRef};
use crate::error::FaultResult;
use crate::permissions::{AccessContext, AccessLevel, AccessOptions, Principal};
use crate::reporting::metrics::names;
use crate::reporting::MetricsSink;
use crate::schema::{reader, TypedModel};
use log::{debug, trace};
use serde_json::Value;
use std::sync::Arc;

/// A resolved pipeline, ready to serve result pages.
#[derive(Debug, Clone)]
pub struct ProjectionPlan {
    pub(crate) models: Vec<Arc<TypedModel>>,
    /// `None` when documents keep their natural shape.
    pub(crate) outputs: Option<Vec<(String, Projected)>>,
    pub(crate) required_access: AccessLevel,
}

impl ProjectionPlan {
    pub fn outputs(&self) -> Option<&[(String, Projected)]> {
        self.outputs.as_deref()
    }

    pub fn output(&self, path: &str) -> Option<&Projected> {
        self.outputs
            .as_ref()?
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, projected)| projected)
    }

    /// Level every served document must grant the caller.
    pub fn required_access(&self) -> AccessLevel {
        self.required_access
    }

    fn model_for(&self, raw: &Value) -> Option<&Arc<TypedModel>> {
        match raw.get("object").and_then(Value::as_str) {
            Some(object) => self.models.iter().find(|m| m.object_name() == object),
            None if self.models.len() == 1 => self.models.first(),
            None => None,
        }
    }

    /// Context for a shaped row that no longer names its object, such as
    /// `$group` output. It must meet the required access on every model the
    /// plan covers, without a subject.
    fn detached_context(&self, principal: &Arc<Principal>, options: &AccessOptions) -> Option<AccessContext> {
        let mut contexts = self.models.iter().map(|model| {
            let mut ac = AccessContext::new(principal.clone(), model.object_name(), options);
            let resolved = ac.resolve(model.default_acl());
            (ac, resolved)
        });
        let (first, lowest) = contexts.next()?;
        let lowest = contexts.fold(lowest, |lowest, (_, resolved)| lowest.min(resolved));
        (lowest >= self.required_access.max(AccessLevel::MIN)).then_some(first)
    }

    /// Leaf sources with a group reader, without repeats.
    fn group_read_sources(&self) -> Vec<SourceRef> {
        let mut found: Vec<SourceRef> = Vec::new();
        let mut push = |source: SourceRef| {
            if source.node().has_group_reader() && !found.iter().any(|f| f.same_as(&source)) {
                found.push(source);
            }
        };
        match &self.outputs {
            Some(outputs) => {
                for (_, projected) in outputs {
                    for source in projected.sources() {
                        push(source.clone());
                    }
                }
            }
            None => {
                for model in &self.models {
                    let roots = std::iter::once(model.root()).chain(model.variants().iter().map(|v| v.root));
                    for root in roots {
                        for id in model.node(root).properties() {
                            push(SourceRef::new(model.clone(), *id));
                        }
                    }
                }
            }
        }
        found
    }

    /// Serve one page of raw results.
    ///
    /// Group readers run over the whole page first. Each document is then
    /// read with its own access context; documents below the plan's
    /// required access are dropped. Shaped rows without an `object` are read
    /// through the plan outputs with a subject-less context.
    pub async fn serve_page(
        &self,
        principal: &Arc<Principal>,
        options: &AccessOptions,
        mut page: Vec<Value>,
        metrics: &dyn MetricsSink,
    ) -> FaultResult<Vec<Value>> {
        for source in self.group_read_sources() {
            let node = source.node();
            if let Some(group_reader) = &node.capabilities.group_reader {
                let ac = AccessContext::new(principal.clone(), source.model.object_name(), options);
                group_reader.read_group(&ac, node, &mut page).await?;
                metrics.increment(names::GROUP_READ, 1);
            }
        }

        let mut served = Vec::with_capacity(page.len());
        let mut detached: Option<Option<AccessContext>> = None;
        for raw in &page {
            if let (Some(outputs), None) = (&self.outputs, raw.get("object")) {
                let ac = detached.get_or_insert_with(|| self.detached_context(principal, options));
                match ac {
                    Some(ac) => served.push(read_fields(outputs, ac, raw, raw, metrics)?),
                    None => trace!("dropping shaped result below {}", self.required_access.name()),
                }
                continue;
            }
            let Some(model) = self.model_for(raw) else {
                debug!("dropping result without a known object");
                continue;
            };
            let mut ac = AccessContext::new(principal.clone(), model.object_name(), options).with_subject(raw);
            let resolved = ac.resolve(model.default_acl());
            if resolved < self.required_access.max(AccessLevel::MIN) {
                trace!("dropping result below {}", self.required_access.name());
                continue;
            }
            let document = match &self.outputs {
                Some(outputs) => read_fields(outputs, &ac, raw, raw, metrics)?,
                None => reader::read_document(model, &ac, raw, metrics)?,
            };
            served.push(document);
        }
        Ok(served)
    }
}
