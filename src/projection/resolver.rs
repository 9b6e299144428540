//! Compile-time resolution of pipeline outputs to schema nodes.
//!
//! Each referenced path is traced to every node that can produce it, and
//! each node is authorized up to the model root. Paths the caller can only
//! observe indirectly (matches, group keys, operator inputs) raise the access
//! level the query requires of every document instead of failing, so the
//! shape of a result cannot leak what the caller could not read.

use super::expression::{query_error, ProjectionExpr, StageKind};
use super::projected::{Projected, ProjectedDocument, ProjectedNode, SourceRef};
use super::serve::ProjectionPlan;
use crate::config::QueryConfig;
use crate::constants::RESERVED_PROJECTION_NAMES;
use crate::error::{Fault, FaultResult};
use crate::permissions::{AccessContext, AccessLevel};
use crate::schema::{NodeType, TypedModel};
use crate::utils::json_path;
use log::trace;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Fields every non-grouping plan carries for serve-time disambiguation.
const IMPLICIT_FIELDS: &[&str] = &["_id", "object", "type"];

pub struct ProjectionResolver<'a> {
    ac: &'a AccessContext,
    models: Vec<Arc<TypedModel>>,
    /// Outputs of the last shaping stage; `None` while documents are natural.
    known: Option<Vec<(String, Projected)>>,
    /// Set path to the discriminator value a `$match` pinned it to.
    discriminators: HashMap<String, String>,
    strict: bool,
    allow_system_access: bool,
    skip_acl: bool,
    required_access: AccessLevel,
}

impl<'a> ProjectionResolver<'a> {
    pub fn new(ac: &'a AccessContext, models: Vec<Arc<TypedModel>>, config: &QueryConfig) -> Self {
        Self {
            ac,
            models,
            known: None,
            discriminators: HashMap::new(),
            strict: config.strict,
            allow_system_access: config.allow_system_access,
            skip_acl: false,
            required_access: AccessLevel::MIN,
        }
    }

    /// Skip ACL checks for internal queries.
    #[must_use]
    pub fn skip_acl(mut self, skip: bool) -> Self {
        self.skip_acl = skip;
        self
    }

    pub fn required_access(&self) -> AccessLevel {
        self.required_access
    }

    pub fn resolve_pipeline(mut self, stages: &[Value]) -> FaultResult<ProjectionPlan> {
        for stage in stages {
            self.resolve_stage(stage)?;
        }
        Ok(self.into_plan())
    }

    pub fn into_plan(self) -> ProjectionPlan {
        ProjectionPlan {
            models: self.models,
            outputs: self.known,
            required_access: self.required_access,
        }
    }

    /// Resolve one `{"$stage": {...}}` object.
    pub fn resolve_stage(&mut self, stage: &Value) -> FaultResult<()> {
        let map = stage
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| query_error("A stage must have exactly one operator."))?;
        let (operator, body) = map
            .iter()
            .next()
            .ok_or_else(|| query_error("Empty stage."))?;
        let kind = StageKind::from_operator(operator)?;
        let fields = body
            .as_object()
            .ok_or_else(|| query_error(format!("{} expects an object.", kind)))?;
        trace!("resolving {} with {} fields", kind, fields.len());

        match kind {
            StageKind::Match => self.resolve_match(body, true),
            StageKind::Sort => {
                for key in fields.keys() {
                    let path = json_path::normalize(key);
                    self.resolve(&path, &ProjectionExpr::Field(path.clone()), kind)?;
                }
                Ok(())
            }
            StageKind::Project | StageKind::AddFields | StageKind::Group => {
                if kind == StageKind::Group && !fields.contains_key("_id") {
                    return Err(query_error("$group requires an _id."));
                }
                let mut outputs = Vec::with_capacity(fields.len());
                for (key, value) in fields {
                    let path = json_path::normalize(key);
                    let expr = ProjectionExpr::parse(value)?;
                    let projected = self.resolve(&path, &expr, kind)?;
                    outputs.push((path, projected));
                }
                if kind == StageKind::Project {
                    for implicit in IMPLICIT_FIELDS {
                        if !outputs.iter().any(|(path, _)| path == implicit) {
                            if let Ok(projected) = self.resolve(implicit, &ProjectionExpr::Include, kind) {
                                outputs.push((implicit.to_string(), projected));
                            }
                        }
                    }
                }
                let known = match (kind, self.known.take()) {
                    (StageKind::AddFields, Some(mut known)) => {
                        known.retain(|(path, _)| !outputs.iter().any(|(p, _)| p == path));
                        known.extend(outputs);
                        known
                    }
                    (StageKind::AddFields, None) => {
                        let mut known = self.natural_outputs();
                        known.retain(|(path, _)| !outputs.iter().any(|(p, _)| p == path));
                        known.extend(outputs);
                        known
                    }
                    _ => outputs,
                };
                self.known = Some(known);
                Ok(())
            }
        }
    }

    /// Every readable root property of the candidate models.
    fn natural_outputs(&mut self) -> Vec<(String, Projected)> {
        let mut names: Vec<String> = Vec::new();
        for model in &self.models {
            let roots = std::iter::once(model.root()).chain(model.variants().iter().map(|v| v.root));
            for root in roots {
                for id in model.node(root).properties() {
                    let name = &model.node(*id).name;
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
        }
        names
            .into_iter()
            .filter_map(|name| {
                let projected = self
                    .resolve(&name, &ProjectionExpr::Include, StageKind::AddFields)
                    .ok()?;
                Some((name, projected))
            })
            .collect()
    }

    fn resolve_match(&mut self, body: &Value, pin: bool) -> FaultResult<()> {
        let fields = body
            .as_object()
            .ok_or_else(|| query_error("$match expects an object."))?;
        for (key, value) in fields {
            match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let clauses = value
                        .as_array()
                        .ok_or_else(|| query_error(format!("{} expects an array.", key)))?;
                    let pin = pin && key == "$and";
                    for clause in clauses {
                        self.resolve_match(clause, pin)?;
                    }
                }
                other if other.starts_with('$') => {
                    return Err(query_error(format!("Unsupported match operator '{}'.", other)));
                }
                _ => {
                    let path = json_path::normalize(key);
                    let projected = self.resolve(&path, &ProjectionExpr::Field(path.clone()), StageKind::Match)?;
                    if pin {
                        self.pin_discriminator(&projected, value);
                    }
                }
            }
        }
        Ok(())
    }

    /// Record `set.discriminatorKey == value` constraints.
    fn pin_discriminator(&mut self, projected: &Projected, value: &Value) {
        let Some(value) = value.as_str() else {
            return;
        };
        for source in projected.sources() {
            let Some((set_node, _)) = source.model.enclosing_set(source.node) else {
                continue;
            };
            let Some(set) = set_node.set() else {
                continue;
            };
            if source.node().name == set.discriminator_key {
                self.discriminators
                    .insert(set_node.fullpath.clone(), value.to_string());
            }
        }
    }

    /// Resolve the expression producing `output_path` in a stage.
    pub fn resolve(&mut self, output_path: &str, expr: &ProjectionExpr, stage: StageKind) -> FaultResult<Projected> {
        if let Some(first) = json_path::split(output_path).first() {
            if RESERVED_PROJECTION_NAMES.contains(first) {
                return Err(query_error(format!("'{}' is a reserved name.", first)).with_path(output_path));
            }
        }
        self.resolve_expr(output_path, expr, stage, false)
    }

    fn resolve_expr(
        &mut self,
        output_path: &str,
        expr: &ProjectionExpr,
        stage: StageKind,
        in_operator: bool,
    ) -> FaultResult<Projected> {
        let grouping = stage == StageKind::Group;
        match expr {
            ProjectionExpr::Include if grouping && !in_operator => {
                Err(query_error("Inclusions are not allowed in $group.").with_path(output_path))
            }
            ProjectionExpr::Include => self.resolve_reference(output_path, output_path, stage, in_operator),
            ProjectionExpr::Field(path) => {
                if grouping && !in_operator {
                    let projected = self.resolve_reference(output_path, path, stage, true)?;
                    return self.amalgamate(output_path, projected);
                }
                if stage == StageKind::Project && path != output_path {
                    self.check_rename(output_path)?;
                }
                self.resolve_reference(output_path, path, stage, in_operator)
            }
            ProjectionExpr::Variable(name) => match name.as_str() {
                "ROOT" | "CURRENT" => {
                    if grouping || in_operator || self.known.is_some() {
                        return Err(query_error(format!("$${} is not allowed here.", name)).with_path(output_path));
                    }
                    let sources = self
                        .models
                        .iter()
                        .map(|m| SourceRef::new(m.clone(), m.root()))
                        .collect();
                    Ok(Projected::Document(ProjectedDocument {
                        path: output_path.to_string(),
                        children: Vec::new(),
                        sources,
                        read_access: AccessLevel::MIN,
                    }))
                }
                "NOW" | "REMOVE" => Ok(Projected::Node(ProjectedNode::computed(output_path, AccessLevel::MIN))),
                other => Err(query_error(format!("Unknown variable $${}.", other)).with_path(output_path)),
            },
            ProjectionExpr::Literal(_) if grouping && !in_operator => {
                Err(query_error("Literals are not allowed in $group.").with_path(output_path))
            }
            ProjectionExpr::Literal(_) => Ok(Projected::Node(ProjectedNode::computed(output_path, AccessLevel::MIN))),
            ProjectionExpr::Document(fields) => {
                let mut children = Vec::with_capacity(fields.len());
                let mut read_access = AccessLevel::MIN;
                for (name, child) in fields {
                    let child_path = json_path::join(output_path, name);
                    let projected = self.resolve_expr(&child_path, child, stage, in_operator)?;
                    read_access = read_access.max(projected.read_access());
                    children.push((name.clone(), projected));
                }
                if grouping || in_operator {
                    return Ok(Projected::Node(ProjectedNode::computed(output_path, read_access)));
                }
                Ok(Projected::Document(ProjectedDocument {
                    path: output_path.to_string(),
                    children,
                    sources: Vec::new(),
                    read_access,
                }))
            }
            ProjectionExpr::Array(items) | ProjectionExpr::Operator { args: items, .. } => {
                let mut read_access = AccessLevel::MIN;
                for item in items {
                    read_access = read_access.max(self.resolve_expr(output_path, item, stage, true)?.read_access());
                }
                Ok(Projected::Node(ProjectedNode::computed(output_path, read_access)))
            }
        }
    }

    /// Renaming onto a schema path would let a computed value pose as stored data.
    fn check_rename(&self, output_path: &str) -> FaultResult<()> {
        let shadows = match &self.known {
            Some(known) => known.iter().any(|(path, _)| path == output_path),
            None => self.models.iter().any(|m| !m.find_nodes(output_path).is_empty()),
        };
        if shadows {
            return Err(query_error("Cannot rename onto an existing property.").with_path(output_path));
        }
        Ok(())
    }

    fn candidates(&self, path: &str) -> Option<Vec<SourceRef>> {
        if let Some(known) = &self.known {
            if let Some((_, projected)) = known.iter().find(|(p, _)| p == path) {
                return Some(projected.sources().to_vec());
            }
            let (_, parent) = known
                .iter()
                .filter(|(p, _)| path.starts_with(&format!("{}.", p)))
                .max_by_key(|(p, _)| p.len())?;
            let rest = &path[parent.path().len() + 1..];
            let mut found: Vec<SourceRef> = Vec::new();
            for source in parent.sources() {
                let target = json_path::join(&source.node().fullpath, rest);
                for id in source.model.find_nodes(&target) {
                    let candidate = SourceRef::new(source.model.clone(), id);
                    if !found.iter().any(|f| f.same_as(&candidate)) {
                        found.push(candidate);
                    }
                }
            }
            return Some(found);
        }
        let mut found: Vec<SourceRef> = Vec::new();
        for model in &self.models {
            for id in model.find_nodes(path) {
                let candidate = SourceRef::new(model.clone(), id);
                if !found.iter().any(|f| f.same_as(&candidate)) {
                    found.push(candidate);
                }
            }
        }
        Some(found)
    }

    fn filter_by_discriminator(&self, candidates: Vec<SourceRef>) -> Vec<SourceRef> {
        candidates
            .into_iter()
            .filter(|source| {
                let Some((set_node, discriminator)) = source.model.enclosing_set(source.node) else {
                    return true;
                };
                self.discriminators
                    .get(&set_node.fullpath)
                    .map_or(true, |pinned| pinned == discriminator)
            })
            .collect()
    }

    fn resolve_reference(
        &mut self,
        output_path: &str,
        path: &str,
        stage: StageKind,
        in_operator: bool,
    ) -> FaultResult<Projected> {
        let from_known = self
            .known
            .as_ref()
            .and_then(|known| known.iter().find(|(p, _)| p == path))
            .map(|(_, projected)| projected.clone());
        if let Some(projected) = &from_known {
            if projected.sources().is_empty() {
                return Ok(Projected::Node(ProjectedNode::computed(output_path, projected.read_access())));
            }
        }

        let candidates = self.filter_by_discriminator(self.candidates(path).unwrap_or_default());
        if candidates.is_empty() {
            if self.strict || self.known.is_some() {
                return Err(Fault::not_found("property")
                    .with_reason("Unknown property in query.")
                    .with_path(path.to_string()));
            }
            return Ok(Projected::Node(ProjectedNode::computed(output_path, AccessLevel::MIN)));
        }

        let mut read_access = AccessLevel::MIN;
        for source in &candidates {
            read_access = read_access.max(self.authorize(source, stage, in_operator)?);
        }
        if candidates.len() > 1 && candidates.iter().any(SourceRef::has_direct_acl) {
            return Err(query_error("A property with its own ACL cannot be projected from several sources.")
                .with_path(path.to_string()));
        }

        let first_type = candidates[0].node().node_type;
        let node_type = candidates
            .iter()
            .all(|s| s.node().node_type == first_type)
            .then_some(first_type);
        Ok(Projected::Node(ProjectedNode {
            path: output_path.to_string(),
            node_type,
            array: candidates.iter().any(|s| s.node().array),
            read_access,
            sources: candidates,
        }))
    }

    /// Authorize a source and its ancestors, returning the highest read level.
    fn authorize(&mut self, source: &SourceRef, stage: StageKind, in_operator: bool) -> FaultResult<AccessLevel> {
        let mut read_access = AccessLevel::MIN;
        let chain = source.model.path_to_root(source.node);
        for (depth, id) in chain.iter().enumerate() {
            let node = source.model.node(*id);
            if !node.readable {
                return Err(Fault::not_found("property").with_path(node.fullpath.clone()));
            }
            if node.read_access == AccessLevel::System && !self.allow_system_access {
                return Err(Fault::not_found("property").with_path(node.fullpath.clone()));
            }
            if node.has_reader() || node.has_group_reader() || node.is_virtual {
                let leaf_of_plain_read = depth == 0 && !stage.is_selective() && !in_operator;
                if !leaf_of_plain_read {
                    return Err(query_error("Computed properties cannot be used here.")
                        .with_path(node.fullpath.clone()));
                }
            }
            read_access = read_access.max(node.read_access);
            if self.skip_acl {
                continue;
            }
            if node.acl.is_empty() {
                if stage.is_selective() || in_operator {
                    self.bump(node.read_access);
                }
                continue;
            }
            if node.acl.iter().any(|entry| !entry.is_targeted()) {
                return Err(Fault::unsupported("query")
                    .with_reason("Instance-relative ACL entries cannot be resolved in a query.")
                    .with_path(node.fullpath.clone()));
            }
            if self.ac.resolve_with_grants(&node.acl) < node.read_access {
                return Err(Fault::access_denied("inaccessibleProperty").with_path(node.fullpath.clone()));
            }
        }
        Ok(read_access)
    }

    fn bump(&mut self, level: AccessLevel) {
        if level > self.required_access {
            trace!("query required access raised to {}", level.name());
            self.required_access = level;
        }
    }

    /// Re-validate a group key across its sources, then drop them.
    fn amalgamate(&mut self, output_path: &str, projected: Projected) -> FaultResult<Projected> {
        let sources = projected.sources().to_vec();
        let ambiguous = sources.len() > 1;
        let mut read_access = projected.read_access();
        for source in &sources {
            let mut violation: Option<Fault> = None;
            let mut highest = AccessLevel::MIN;
            let strict = self.strict;
            let allow_system_access = self.allow_system_access;
            source.model.walk(source.node, &mut |node| {
                if violation.is_some() {
                    return;
                }
                highest = highest.max(node.read_access);
                violation = amalgamation_violation(node, ambiguous, strict, allow_system_access);
            });
            if let Some(fault) = violation {
                return Err(fault);
            }
            read_access = read_access.max(highest);
        }
        if !self.skip_acl {
            self.bump(read_access);
        }
        Ok(Projected::Node(ProjectedNode {
            path: output_path.to_string(),
            node_type: None,
            array: false,
            read_access,
            sources: Vec::new(),
        }))
    }
}

fn amalgamation_violation(
    node: &crate::schema::SchemaNode,
    ambiguous: bool,
    strict: bool,
    allow_system_access: bool,
) -> Option<Fault> {
    let fail = |reason: &str| Some(query_error(reason.to_string()).with_path(node.fullpath.clone()));
    if !node.readable {
        return fail("Group keys must be readable.");
    }
    if ambiguous && !node.acl.is_empty() {
        return fail("Ambiguous group keys cannot carry an ACL.");
    }
    if node.read_access == AccessLevel::System && !allow_system_access {
        return fail("Group keys cannot include hidden values.");
    }
    if strict && node.node_type == NodeType::Any {
        return fail("Untyped values cannot be grouped in strict mode.");
    }
    if node.has_reader() || node.has_group_reader() || node.is_virtual {
        return fail("Computed values cannot be grouped.");
    }
    None
}
